//! Launcher error type
//!
//! Failures are marked where they are first observed (a syscall, the
//! filesystem, the bus library) by wrapping them together with the operation
//! that failed. Errors from the config reader and policy compiler are folded
//! in through `From`. Everything else is propagated with `?`.

use std::path::PathBuf;

use nix::errno::Errno;

use crate::policy::{ConfigError, PolicyError};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: Errno,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("D-Bus {op} failed: {source}")]
    Bus {
        op: &'static str,
        #[source]
        source: zbus::Error,
    },

    #[error("No listener socket inherited")]
    NoListenerInherited,

    #[error("More than one listener socket passed ({0} sockets)")]
    TooManyListeners(usize),

    #[error("Non unix-domain-socket passed as listener")]
    InvalidInheritedListener,

    #[error("Listener socket already acquired")]
    ListenerAlreadyAcquired,

    #[error("Listener socket not acquired")]
    ListenerUnset,

    #[error("Listener path too long: {}", .0.display())]
    ListenerPathTooLong(PathBuf),

    #[error("Invalid listener socket '{0}'")]
    InvalidListenAddress(String),

    #[error("Failed to spawn broker {}: {source}", .broker.display())]
    Spawn {
        broker: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Broker exited with status {0}")]
    BrokerFailed(i32),

    #[error("Broker terminated abnormally")]
    BrokerTerminated,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub(crate) fn sys_err(op: &'static str, source: Errno) -> LaunchError {
    LaunchError::Sys { op, source }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LaunchError {
    LaunchError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn bus_err(op: &'static str, source: zbus::Error) -> LaunchError {
    LaunchError::Bus { op, source }
}
