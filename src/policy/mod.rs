//! Bus access policy
//!
//! `config` reads the XML bus configuration, `compile` turns its `<policy>`
//! blocks into the ruleset handed to the broker with the listener.

mod compile;
mod config;

pub use compile::{
    Batch, BatchWire, OwnMatch, Policy, PolicyError, PolicyWire, Rule, Subject, TransmitMatch,
    TransmitWire,
};
pub use config::{ConfigError, ConfigRoot, PolicyContext, PolicyNode, RuleAttrs, RuleNode, MAX_INCLUDE_DEPTH};

use std::path::Path;

use crate::error::LaunchError;

/// Read, compile and optimize the policy at `path`
pub fn load(path: &Path) -> Result<Policy, LaunchError> {
    let root = ConfigRoot::read(path)?;
    let mut policy = Policy::import(&root)?;
    policy.optimize();
    Ok(policy)
}
