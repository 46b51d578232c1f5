//! D-Bus plumbing between broker, launcher and systemd
//!
//! Two connections are involved:
//! - the controller link, a peer-to-peer session with the broker over a
//!   socket pair, carrying `AddName`/`AddListener` out and activation
//!   signals in
//! - the regular link, a normal bus client connection through the broker's
//!   own listener, used only to talk to systemd
//!
//! Object paths:
//! - `/org/bus1/DBus/Broker`: broker control object
//! - `/org/bus1/DBus/Name/<id>`: one per activatable service
//! - `/org/bus1/DBus/Listener/0`: the single listener

mod controller;
mod message;
mod router;

pub use controller::{add_listener, add_name, ActivationEnvironment, ControllerEvent};
pub use message::{ExecCommand, ServiceManagerCall, TransientUnit};
pub use router::route;

use zbus::zvariant::ObjectPath;

use crate::error::{bus_err, LaunchError};

pub const BROKER_PATH: &str = "/org/bus1/DBus/Broker";
pub const BROKER_INTERFACE: &str = "org.bus1.DBus.Broker";
pub const NAME_PATH_PREFIX: &str = "/org/bus1/DBus/Name/";
pub const NAME_INTERFACE: &str = "org.bus1.DBus.Name";
pub const LISTENER_PATH: &str = "/org/bus1/DBus/Listener/0";

pub const SYSTEMD_NAME: &str = "org.freedesktop.systemd1";
pub const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
pub const SYSTEMD_MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
pub const ACTIVATOR_PATH: &str = "/org/freedesktop/DBus";
pub const ACTIVATOR_INTERFACE: &str = "org.freedesktop.systemd1.Activator";

/// Object path string of a service, e.g. "7" -> "/org/bus1/DBus/Name/7"
pub fn name_object_path(id: &str) -> String {
    format!("{}{}", NAME_PATH_PREFIX, id)
}

/// Validated object path of a service
pub fn name_path(id: &str) -> Result<ObjectPath<'static>, LaunchError> {
    ObjectPath::try_from(name_object_path(id)).map_err(|e| bus_err("object path", e.into()))
}
