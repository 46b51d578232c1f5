//! Calls to systemd
//!
//! Each outgoing request is first described as a `ServiceManagerCall` and
//! then turned into a complete `zbus::Message` in one step. A message that
//! fails to build is dropped whole; nothing half-built reaches the wire.

use serde::{Deserialize, Serialize};
use zbus::message::Flags;
use zbus::zvariant::{Type, Value};
use zbus::Message;

use super::{
    ACTIVATOR_INTERFACE, ACTIVATOR_PATH, SYSTEMD_MANAGER_INTERFACE, SYSTEMD_NAME, SYSTEMD_PATH,
};

/// Start mode of transient units: refuse instead of replacing queued jobs
pub const TRANSIENT_UNIT_MODE: &str = "fail";

/// One `ExecStart` entry: `(sasb)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type, Value)]
pub struct ExecCommand {
    pub path: String,
    pub argv: Vec<String>,
    pub ignore_failure: bool,
}

/// A transient service running a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientUnit {
    pub name: String,
    pub mode: &'static str,
    pub exec: Vec<String>,
}

impl TransientUnit {
    /// Unit `dbus-<name>.service` running `exec`
    pub fn for_service(service_name: &str, exec: &[String]) -> Self {
        Self {
            name: format!("dbus-{}.service", service_name),
            mode: TRANSIENT_UNIT_MODE,
            exec: exec.to_vec(),
        }
    }

    /// The `ExecStart` property. `argv` keeps element 0.
    fn exec_start(&self) -> Vec<ExecCommand> {
        let path = self.exec.first().cloned().unwrap_or_default();
        vec![ExecCommand {
            path,
            argv: self.exec.clone(),
            ignore_failure: true,
        }]
    }
}

/// `StartTransientUnit` arguments: `ssa(sv)a(sa(sv))`
#[derive(Debug, Serialize, Type)]
struct TransientUnitBody<'a> {
    name: &'a str,
    mode: &'a str,
    properties: Vec<(&'a str, Value<'a>)>,
    aux: Vec<(&'a str, Vec<(&'a str, Value<'a>)>)>,
}

/// Requests the launcher sends to systemd on the regular link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceManagerCall {
    /// Ask systemd to start an existing unit
    ActivationRequest { unit: String },
    /// Run a command line as a transient unit
    StartTransientUnit(TransientUnit),
    /// Update the activation environment, entries are `KEY=VALUE`
    SetEnvironment(Vec<String>),
}

impl ServiceManagerCall {
    /// D-Bus member name of the request
    pub fn member(&self) -> &'static str {
        match self {
            ServiceManagerCall::ActivationRequest { .. } => "ActivationRequest",
            ServiceManagerCall::StartTransientUnit(_) => "StartTransientUnit",
            ServiceManagerCall::SetEnvironment(_) => "SetEnvironment",
        }
    }

    /// Build the complete message
    pub fn to_message(&self) -> zbus::Result<Message> {
        match self {
            ServiceManagerCall::ActivationRequest { unit } => {
                Message::signal(ACTIVATOR_PATH, ACTIVATOR_INTERFACE, self.member())?
                    .destination(SYSTEMD_NAME)?
                    .build(&(unit.as_str(),))
            }
            ServiceManagerCall::StartTransientUnit(unit) => {
                let body = TransientUnitBody {
                    name: &unit.name,
                    mode: unit.mode,
                    properties: vec![("ExecStart", Value::from(unit.exec_start()))],
                    aux: Vec::new(),
                };
                manager_call(self.member())?.build(&body)
            }
            ServiceManagerCall::SetEnvironment(entries) => {
                manager_call(self.member())?.build(&(entries,))
            }
        }
    }
}

fn manager_call(member: &'static str) -> zbus::Result<zbus::message::Builder<'static>> {
    Message::method_call(SYSTEMD_PATH, member)?
        .destination(SYSTEMD_NAME)?
        .interface(SYSTEMD_MANAGER_INTERFACE)?
        .with_flags(Flags::NoReplyExpected)
}
