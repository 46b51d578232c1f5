//! Controller link: administrative calls to the broker and classification of
//! the broker's notifications.
//!
//! The broker is the only peer on this link, so inbound messages are trusted
//! as-is. Anything that is not one of the two known signals is ignored.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::BorrowedFd;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zbus::message::{Flags, Type as MessageType};
use zbus::zvariant::{Fd, ObjectPath, Signature, Type};
use zbus::{Connection, Message};

use super::{name_path, BROKER_INTERFACE, BROKER_PATH, LISTENER_PATH, NAME_INTERFACE, NAME_PATH_PREFIX};
use crate::error::{bus_err, LaunchError};
use crate::policy::PolicyWire;

/// String map of a `SetActivationEnvironment` signal, in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationEnvironment(pub Vec<(String, String)>);

impl Type for ActivationEnvironment {
    const SIGNATURE: &'static Signature = <HashMap<String, String> as Type>::SIGNATURE;
}

impl Serialize for ActivationEnvironment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ActivationEnvironment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = ActivationEnvironment;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string-to-string map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    entries.push((key, value));
                }
                Ok(ActivationEnvironment(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// A notification from the broker the launcher acts upon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A client asked for the service with this id
    Activate { id: String },
    /// New activation environment for systemd
    SetActivationEnvironment(Vec<(String, String)>),
}

impl ControllerEvent {
    /// Classify an inbound controller-link message.
    ///
    /// Returns `Ok(None)` for anything that is not a known signal.
    pub fn from_message(msg: &Message) -> zbus::Result<Option<Self>> {
        if msg.message_type() != MessageType::Signal {
            return Ok(None);
        }

        let header = msg.header();
        let Some(path) = header.path() else {
            return Ok(None);
        };
        let interface = header.interface().map(|i| i.as_str());
        let member = header.member().map(|m| m.as_str());

        if let Some(id) = path.as_str().strip_prefix(NAME_PATH_PREFIX) {
            if interface == Some(NAME_INTERFACE) && member == Some("Activate") {
                return Ok(Some(ControllerEvent::Activate { id: id.to_string() }));
            }
        } else if path.as_str() == BROKER_PATH
            && interface == Some(BROKER_INTERFACE)
            && member == Some("SetActivationEnvironment")
        {
            let env: ActivationEnvironment = msg.body().deserialize()?;
            return Ok(Some(ControllerEvent::SetActivationEnvironment(env.0)));
        }

        Ok(None)
    }
}

/// Register an activatable name with the broker. No reply is awaited.
pub async fn add_name(controller: &Connection, id: &str, name: &str) -> Result<(), LaunchError> {
    let object = name_path(id)?;

    let msg = Message::method_call(BROKER_PATH, "AddName")
        .and_then(|b| b.interface(BROKER_INTERFACE))
        .and_then(|b| b.with_flags(Flags::NoReplyExpected))
        .and_then(|b| b.build(&(object, name, 0u32)))
        .map_err(|e| bus_err("AddName", e))?;

    controller
        .send(&msg)
        .await
        .map_err(|e| bus_err("AddName", e))
}

/// Hand the listener and its policy to the broker, waiting for the reply.
///
/// The broker starts accepting on the listener only once this returns.
pub async fn add_listener(
    controller: &Connection,
    listener: BorrowedFd<'_>,
    policy_path: &Path,
    policy: &PolicyWire,
) -> Result<(), LaunchError> {
    let object = ObjectPath::try_from(LISTENER_PATH).map_err(|e| bus_err("AddListener", e.into()))?;
    let policy_path = policy_path.to_string_lossy();

    controller
        .call_method(
            None::<&str>,
            BROKER_PATH,
            Some(BROKER_INTERFACE),
            "AddListener",
            &(object, Fd::from(listener), policy_path.as_ref(), policy),
        )
        .await
        .map_err(|e| bus_err("AddListener", e))?;

    log::debug!("Listener installed with policy {}", policy_path);
    Ok(())
}
