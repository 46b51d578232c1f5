//! broker-launch - D-Bus broker launcher
//!
//! Supervises a `dbus-broker` process and bridges legacy bus activation to
//! systemd:
//! - Acquires the bus listener socket (inherited or bound at a path)
//! - Spawns the broker with a private controller connection
//! - Registers activatable names and the compiled access policy with it
//! - Forwards activation requests and environment updates to systemd
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  controller link   ┌────────────┐  regular link  ┌─────────┐
//! │  launcher  │ ◄────────────────► │   broker   │ ◄────────────► │ systemd │
//! └────────────┘  (socket pair)     └────────────┘  (via listener)└─────────┘
//! ```

pub mod config;
pub mod dbus;
pub mod error;
pub mod listener;
pub mod manager;
pub mod policy;
pub mod services;
pub mod supervisor;

pub use config::{Args, LaunchConfig, ListenTarget, Scope};
pub use error::LaunchError;
pub use manager::Manager;
