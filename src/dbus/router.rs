//! Activation routing
//!
//! Decides what, if anything, systemd has to be told in response to a
//! controller event.

use super::{ControllerEvent, ServiceManagerCall, TransientUnit, SYSTEMD_NAME};
use crate::services::{Activation, ServiceRegistry};

/// Map a controller event to the call systemd should receive, if any
pub fn route(registry: &ServiceRegistry, event: ControllerEvent) -> Option<ServiceManagerCall> {
    match event {
        ControllerEvent::Activate { id } => activate(registry, &id),
        ControllerEvent::SetActivationEnvironment(entries) => {
            let entries = entries
                .into_iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            Some(ServiceManagerCall::SetEnvironment(entries))
        }
    }
}

fn activate(registry: &ServiceRegistry, id: &str) -> Option<ServiceManagerCall> {
    let Some(service) = registry.lookup(id) else {
        log::warn!("Activation request on unknown name '{}'", id);
        return None;
    };

    // systemd activates itself; answering would loop
    if service.name() == SYSTEMD_NAME {
        return None;
    }

    match service.activation() {
        Activation::Unit(unit) => {
            log::info!("Activation request for '{}' -> '{}'", service.name(), unit);
            Some(ServiceManagerCall::ActivationRequest { unit: unit.clone() })
        }
        Activation::Exec(exec) => {
            log::info!(
                "Activation request for '{}' -> transient unit running {}",
                service.name(),
                exec.join(" ")
            );
            Some(ServiceManagerCall::StartTransientUnit(TransientUnit::for_service(
                service.name(),
                exec,
            )))
        }
    }
}
