//! Broker process supervision
//!
//! Exactly one broker is spawned per run and it is never restarted. The
//! broker receives its end of the controller socket pair as an inherited
//! descriptor whose number is passed on the command line. When the broker
//! exits, the launcher exits with it.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::Signal;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tokio::process::{Child, Command};

use crate::error::{sys_err, LaunchError};

/// `argv[0]` the broker is executed with
pub const BROKER_ARGV0: &str = "dbus-broker";

/// How the broker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerExit {
    /// Exited normally with this status
    Exited(i32),
    /// Killed by this signal
    Signaled(i32),
    /// Status could not be determined
    Unknown,
}

impl BrokerExit {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            BrokerExit::Exited(code)
        } else if let Some(signal) = status.signal() {
            BrokerExit::Signaled(signal)
        } else {
            BrokerExit::Unknown
        }
    }

    /// Map the broker's end to the launcher's own outcome.
    ///
    /// A normal exit status is passed through; any other termination is a
    /// generic failure.
    pub fn into_result(self) -> Result<(), LaunchError> {
        match self {
            BrokerExit::Exited(0) => Ok(()),
            BrokerExit::Exited(code) => Err(LaunchError::BrokerFailed(code)),
            BrokerExit::Signaled(_) | BrokerExit::Unknown => Err(LaunchError::BrokerTerminated),
        }
    }
}

/// Create the controller socket pair: `(launcher end, broker end)`.
///
/// Both ends are close-on-exec; the broker end has the flag cleared in the
/// child only.
pub fn controller_pair() -> Result<(OwnedFd, OwnedFd), LaunchError> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
    .map_err(|e| sys_err("socketpair", e))
}

/// The running broker
#[derive(Debug)]
pub struct Broker {
    child: Child,
}

impl Broker {
    /// Spawn `broker`, handing it `controller`.
    ///
    /// The launcher's copy of `controller` is closed as soon as the spawn
    /// attempt returns, whether or not it succeeded.
    pub fn spawn(broker: &Path, controller: OwnedFd) -> Result<Self, LaunchError> {
        let fd = controller.as_raw_fd();

        let mut cmd = Command::new(broker);
        cmd.arg0(BROKER_ARGV0)
            .arg("-v")
            .arg("--controller")
            .arg(fd.to_string());

        // Runs after fork, before exec: only async-signal-safe calls here
        unsafe {
            cmd.pre_exec(move || prepare_child(fd));
        }

        let spawned = cmd.spawn();
        drop(controller);

        let child = spawned.map_err(|source| LaunchError::Spawn {
            broker: broker.to_path_buf(),
            source,
        })?;

        log::info!(
            "Spawned broker {} (pid {})",
            broker.display(),
            child.id().unwrap_or(0)
        );
        Ok(Self { child })
    }

    /// Wait until the broker terminates, for any reason
    pub async fn wait(&mut self) -> BrokerExit {
        match self.child.wait().await {
            Ok(status) => {
                log::debug!("Caught SIGCHLD of broker");
                BrokerExit::from_status(status)
            }
            Err(e) => {
                log::error!("Failed to wait for broker: {}", e);
                BrokerExit::Unknown
            }
        }
    }
}

/// Let the controller descriptor survive exec and make sure the broker goes
/// down with the launcher.
fn prepare_child(fd: RawFd) -> std::io::Result<()> {
    nix::sys::prctl::set_pdeathsig(Signal::SIGTERM)?;

    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;

    Ok(())
}
