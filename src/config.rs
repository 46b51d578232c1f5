//! Command line and launch configuration
//!
//! `Args` is what the user typed; `LaunchConfig` is the resolved, immutable
//! configuration the manager runs with. Scope-dependent defaults are filled
//! in here and nowhere else.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::LaunchError;

pub const DEFAULT_BROKER: &str = "/usr/bin/dbus-broker";

/// Which message bus this launcher provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scope {
    System,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }

    fn default_service_dir(&self) -> PathBuf {
        match self {
            Self::System => PathBuf::from("/usr/share/dbus-1/system-services"),
            Self::User => PathBuf::from("/usr/share/dbus-1/services"),
        }
    }

    fn default_policy_path(&self) -> PathBuf {
        match self {
            Self::System => PathBuf::from("/usr/share/dbus-1/system.conf"),
            Self::User => PathBuf::from("/usr/share/dbus-1/session.conf"),
        }
    }

    fn default_listen_path(&self, runtime_dir: Option<PathBuf>, uid: u32) -> PathBuf {
        match self {
            Self::System => PathBuf::from("/var/run/dbus/system_bus_socket"),
            Self::User => match runtime_dir {
                Some(dir) => dir.join("bus"),
                None => PathBuf::from(format!("/var/run/user/{}/bus", uid)),
            },
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "dbus-broker-launch")]
#[command(version)]
#[command(about = "Linux D-Bus Message Broker Launcher")]
pub struct Args {
    /// Print progress to terminal
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Path of the listener socket, or "inherit" to use a socket passed by the service manager
    #[arg(long, value_name = "PATH")]
    pub listen: Option<String>,

    /// Ignore existing listener sockets
    #[arg(long, short = 'f')]
    pub force: bool,

    /// Scope of message bus
    #[arg(long, value_enum, default_value_t = Scope::System)]
    pub scope: Scope,

    /// Broker executable to supervise
    #[arg(long, value_name = "PATH", default_value = DEFAULT_BROKER)]
    pub broker: PathBuf,

    /// Directory of activatable service files
    #[arg(long, value_name = "DIR")]
    pub service_dir: Option<PathBuf>,

    /// Bus configuration file to compile the access policy from
    #[arg(long, value_name = "PATH")]
    pub policy: Option<PathBuf>,
}

/// Where the listener socket comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    /// Exactly one socket passed down via `LISTEN_FDS`
    Inherit,
    /// Bind a fresh socket at this absolute path
    Path(PathBuf),
}

impl ListenTarget {
    pub fn parse(value: &str) -> Result<Self, LaunchError> {
        if value == "inherit" {
            Ok(Self::Inherit)
        } else if value.starts_with('/') {
            Ok(Self::Path(PathBuf::from(value)))
        } else {
            Err(LaunchError::InvalidListenAddress(value.to_string()))
        }
    }
}

/// Resolved configuration, constructed once and handed to the manager
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub scope: Scope,
    pub verbose: bool,
    pub force: bool,
    pub listen: ListenTarget,
    pub broker: PathBuf,
    pub service_dir: PathBuf,
    pub policy_path: PathBuf,
}

impl LaunchConfig {
    /// Resolve against the real environment (`XDG_RUNTIME_DIR`, current uid)
    pub fn from_args(args: Args) -> Result<Self, LaunchError> {
        let uid = nix::unistd::getuid().as_raw();
        Self::resolve(args, dirs::runtime_dir(), uid)
    }

    /// Resolve with an explicit runtime directory and uid
    pub fn resolve(args: Args, runtime_dir: Option<PathBuf>, uid: u32) -> Result<Self, LaunchError> {
        let listen = match args.listen.as_deref() {
            Some(value) => ListenTarget::parse(value)?,
            None => ListenTarget::Path(args.scope.default_listen_path(runtime_dir, uid)),
        };

        Ok(Self {
            scope: args.scope,
            verbose: args.verbose,
            force: args.force,
            listen,
            broker: args.broker,
            service_dir: args
                .service_dir
                .unwrap_or_else(|| args.scope.default_service_dir()),
            policy_path: args
                .policy
                .unwrap_or_else(|| args.scope.default_policy_path()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["dbus-broker-launch"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_system_defaults() {
        let config = LaunchConfig::resolve(parse(&[]), None, 1000).unwrap();
        assert_eq!(config.scope, Scope::System);
        assert!(!config.force);
        assert!(!config.verbose);
        assert_eq!(
            config.listen,
            ListenTarget::Path("/var/run/dbus/system_bus_socket".into())
        );
        assert_eq!(
            config.service_dir,
            PathBuf::from("/usr/share/dbus-1/system-services")
        );
        assert_eq!(config.policy_path, PathBuf::from("/usr/share/dbus-1/system.conf"));
        assert_eq!(config.broker, PathBuf::from(DEFAULT_BROKER));
    }

    #[test]
    fn test_user_scope_uses_runtime_dir() {
        let config = LaunchConfig::resolve(
            parse(&["--scope", "user"]),
            Some("/run/user/1000".into()),
            1000,
        )
        .unwrap();
        assert_eq!(config.listen, ListenTarget::Path("/run/user/1000/bus".into()));
        assert_eq!(config.service_dir, PathBuf::from("/usr/share/dbus-1/services"));
        assert_eq!(config.policy_path, PathBuf::from("/usr/share/dbus-1/session.conf"));
    }

    #[test]
    fn test_user_scope_falls_back_to_uid() {
        let config = LaunchConfig::resolve(parse(&["--scope", "user"]), None, 4242).unwrap();
        assert_eq!(config.listen, ListenTarget::Path("/var/run/user/4242/bus".into()));
    }

    #[test]
    fn test_listen_inherit_and_flags() {
        let config =
            LaunchConfig::resolve(parse(&["--listen", "inherit", "-f", "-v"]), None, 0).unwrap();
        assert_eq!(config.listen, ListenTarget::Inherit);
        assert!(config.force);
        assert!(config.verbose);
    }

    #[test]
    fn test_relative_listen_path_rejected() {
        let err = LaunchConfig::resolve(parse(&["--listen", "bus.sock"]), None, 0).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidListenAddress(ref s) if s == "bus.sock"));
    }

    #[test]
    fn test_invalid_scope_rejected() {
        assert!(Args::try_parse_from(["dbus-broker-launch", "--scope", "session"]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = LaunchConfig::resolve(
            parse(&[
                "--broker",
                "/opt/broker",
                "--service-dir",
                "/tmp/services",
                "--policy",
                "/tmp/bus.conf",
            ]),
            None,
            0,
        )
        .unwrap();
        assert_eq!(config.broker, PathBuf::from("/opt/broker"));
        assert_eq!(config.service_dir, PathBuf::from("/tmp/services"));
        assert_eq!(config.policy_path, PathBuf::from("/tmp/bus.conf"));
    }
}
