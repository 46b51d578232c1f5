//! Listener socket acquisition
//!
//! The launcher owns exactly one listening socket, either inherited from the
//! service manager (`LISTEN_FDS`) or bound fresh at a filesystem path. It is
//! acquired once, handed to the broker with `AddListener`, and also used to
//! find the address the launcher's own client connection dials.

use std::ops::Range;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{
    bind, connect, getsockname, getsockopt, listen, socket, sockopt, AddressFamily, Backlog,
    SockFlag, SockType, SockaddrLike, SockaddrStorage, UnixAddr,
};

use crate::error::{io_err, sys_err, LaunchError};

/// First descriptor passed by socket activation
pub const LISTEN_FDS_START: RawFd = 3;

const LISTEN_BACKLOG: i32 = 256;

#[derive(Debug, Default)]
enum ListenerState {
    #[default]
    Unset,
    Inherited(OwnedFd),
    Bound { fd: OwnedFd, path: PathBuf },
    Closed,
}

/// The single listening socket of a launcher run
#[derive(Debug, Default)]
pub struct Listener {
    state: ListenerState,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take over the one socket passed via `LISTEN_PID`/`LISTEN_FDS`
    pub fn acquire_inherited(&mut self) -> Result<(), LaunchError> {
        self.ensure_unset()?;
        let fds = take_listen_fds()?;
        self.acquire_inherited_from(fds)
    }

    /// Take over an inherited socket from an explicit descriptor list
    pub fn acquire_inherited_from(&mut self, mut fds: Vec<OwnedFd>) -> Result<(), LaunchError> {
        self.ensure_unset()?;

        let fd = match fds.len() {
            0 => return Err(LaunchError::NoListenerInherited),
            1 => fds.remove(0),
            n => return Err(LaunchError::TooManyListeners(n)),
        };

        validate_listener(&fd)?;
        set_nonblocking(fd.as_raw_fd())?;

        log::info!("Listening on inherited socket");
        self.state = ListenerState::Inherited(fd);
        Ok(())
    }

    /// Bind and listen on a fresh socket at `path`.
    ///
    /// With `force`, a stale file at `path` is removed first.
    pub fn acquire_path(&mut self, path: &Path, force: bool) -> Result<(), LaunchError> {
        self.ensure_unset()?;

        let addr = UnixAddr::new(path).map_err(|e| match e {
            Errno::ENAMETOOLONG => LaunchError::ListenerPathTooLong(path.to_path_buf()),
            e => sys_err("sockaddr", e),
        })?;

        if force {
            match std::fs::remove_file(path) {
                Ok(()) => log::info!("Forcibly removed conflicting socket '{}'", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::debug!("No conflict on socket '{}'", path.display());
                }
                Err(e) => return Err(io_err(path, e)),
            }
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| sys_err("socket", e))?;

        bind(fd.as_raw_fd(), &addr).map_err(|e| sys_err("bind", e))?;

        let backlog = Backlog::new(LISTEN_BACKLOG).map_err(|e| sys_err("listen", e))?;
        listen(&fd, backlog).map_err(|e| sys_err("listen", e))?;

        log::info!("Listening on socket '{}'", path.display());
        self.state = ListenerState::Bound {
            fd,
            path: path.to_path_buf(),
        };
        Ok(())
    }

    /// Borrow the listening descriptor, if acquired and not yet closed
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.state {
            ListenerState::Inherited(fd) | ListenerState::Bound { fd, .. } => Some(fd.as_fd()),
            ListenerState::Unset | ListenerState::Closed => None,
        }
    }

    /// Filesystem path owned by this run, if bound
    pub fn path(&self) -> Option<&Path> {
        match &self.state {
            ListenerState::Bound { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Open a client connection to this listener's own address
    pub fn connect(&self) -> Result<UnixStream, LaunchError> {
        let fd = self.fd().ok_or(LaunchError::ListenerUnset)?;

        let addr: UnixAddr = getsockname(fd.as_raw_fd()).map_err(|e| sys_err("getsockname", e))?;

        let stream = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| sys_err("socket", e))?;

        connect(stream.as_raw_fd(), &addr).map_err(|e| sys_err("connect", e))?;

        Ok(UnixStream::from(stream))
    }

    /// Close the socket, unlinking its path if it was bound here
    pub fn close(&mut self) -> Result<(), LaunchError> {
        match std::mem::replace(&mut self.state, ListenerState::Closed) {
            ListenerState::Bound { fd, path } => {
                drop(fd);
                std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                log::info!("Cleaned up listener socket '{}'", path.display());
            }
            ListenerState::Inherited(fd) => drop(fd),
            ListenerState::Unset | ListenerState::Closed => {}
        }
        Ok(())
    }

    fn ensure_unset(&self) -> Result<(), LaunchError> {
        match self.state {
            ListenerState::Unset => Ok(()),
            _ => Err(LaunchError::ListenerAlreadyAcquired),
        }
    }
}

/// Collect the descriptors passed by socket activation and clear the
/// activation environment so children do not see it.
fn take_listen_fds() -> Result<Vec<OwnedFd>, LaunchError> {
    let pid = std::env::var("LISTEN_PID").ok();
    let count = std::env::var("LISTEN_FDS").ok();
    std::env::remove_var("LISTEN_PID");
    std::env::remove_var("LISTEN_FDS");
    std::env::remove_var("LISTEN_FDNAMES");

    let Some(pid) = pid else {
        return Ok(Vec::new());
    };
    let pid: u32 = pid.parse().map_err(|_| sys_err("LISTEN_PID", Errno::EINVAL))?;
    if pid != std::process::id() {
        return Ok(Vec::new());
    }

    let Some(count) = count else {
        return Ok(Vec::new());
    };

    let mut fds = Vec::new();
    for raw in listen_fd_range(&count)? {
        fcntl(raw, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| sys_err("fcntl", e))?;
        // SAFETY: socket activation hands these descriptors to this process
        // and nothing else in the process has claimed them.
        fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
    }

    Ok(fds)
}

/// Descriptors named by a `LISTEN_FDS` count
fn listen_fd_range(count: &str) -> Result<Range<RawFd>, LaunchError> {
    let invalid = || sys_err("LISTEN_FDS", Errno::EINVAL);

    let count: RawFd = count.parse().map_err(|_| invalid())?;
    if count < 0 {
        return Err(invalid());
    }
    let end = LISTEN_FDS_START.checked_add(count).ok_or_else(invalid)?;
    Ok(LISTEN_FDS_START..end)
}

/// Require a listening unix-domain stream socket
fn validate_listener(fd: &OwnedFd) -> Result<(), LaunchError> {
    let addr: SockaddrStorage = getsockname(fd.as_raw_fd()).map_err(|e| sys_err("getsockname", e))?;
    if addr.family() != Some(AddressFamily::Unix) {
        return Err(LaunchError::InvalidInheritedListener);
    }

    let sock_type = getsockopt(fd, sockopt::SockType).map_err(|e| sys_err("getsockopt", e))?;
    let listening = getsockopt(fd, sockopt::AcceptConn).map_err(|e| sys_err("getsockopt", e))?;
    if sock_type != SockType::Stream || !listening {
        return Err(LaunchError::InvalidInheritedListener);
    }

    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<(), LaunchError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| sys_err("fcntl", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| sys_err("fcntl", e))?;
    Ok(())
}
