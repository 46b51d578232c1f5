//! Activatable service registry
//!
//! Every loaded service file becomes a `Service` with a process-unique
//! decimal id. The broker only ever sees that id (as the last segment of the
//! service's object path), so activation requests come back keyed by it.

mod parser;

pub use parser::{load_service_file, parse_section, ParsedSection, ServiceFile, ServiceFileError, SERVICE_SECTION};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// How a service gets started on activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Ask systemd to start this existing unit
    Unit(String),
    /// Run this command line in a transient unit (never empty)
    Exec(Vec<String>),
}

impl Activation {
    /// Pick the activation method. A unit takes precedence over a command
    /// line; an empty command line counts as absent.
    pub fn from_parts(unit: Option<String>, exec: Option<Vec<String>>) -> Option<Self> {
        match (unit, exec) {
            (Some(unit), _) => Some(Self::Unit(unit)),
            (None, Some(exec)) if !exec.is_empty() => Some(Self::Exec(exec)),
            _ => None,
        }
    }
}

/// One activatable bus name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    id: String,
    name: String,
    activation: Activation,
}

impl Service {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    pub fn unit(&self) -> Option<&str> {
        match &self.activation {
            Activation::Unit(unit) => Some(unit),
            Activation::Exec(_) => None,
        }
    }

    pub fn exec(&self) -> Option<&[String]> {
        match &self.activation {
            Activation::Unit(_) => None,
            Activation::Exec(exec) => Some(exec),
        }
    }
}

/// Services by id
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Service>,
    last_id: u64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service and return its id.
    ///
    /// Returns `None` without consuming an id when neither a unit nor a
    /// command line is given.
    pub fn register(
        &mut self,
        name: &str,
        unit: Option<String>,
        exec: Option<Vec<String>>,
    ) -> Option<String> {
        let activation = Activation::from_parts(unit, exec)?;

        self.last_id += 1;
        let id = self.last_id.to_string();

        self.services.insert(
            id.clone(),
            Service {
                id: id.clone(),
                name: name.to_string(),
                activation,
            },
        );

        Some(id)
    }

    /// Look up a service. Unknown ids are a normal outcome.
    pub fn lookup(&self, id: &str) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Service> {
        self.services.remove(id)
    }

    /// Ids of all registered services, in no particular order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// List the service files of a directory.
///
/// Dot-files and names not ending in `.service` are skipped. A directory
/// that is missing or cannot be read is treated as empty.
pub fn load_dir(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e)
            if e.kind() == std::io::ErrorKind::NotFound
                || e.raw_os_error() == Some(libc::ENOTDIR) =>
        {
            log::debug!("Service directory {} not present", dir.display());
            return Vec::new();
        }
        Err(e) => {
            log::warn!("Cannot read service directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Cannot read service directory {}: {}", dir.display(), e);
                continue;
            }
        };
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        if file_name.starts_with('.') {
            continue;
        }
        match file_name.strip_suffix(".service") {
            Some(stem) if !stem.is_empty() => paths.push(entry.path()),
            _ => continue,
        }
    }

    paths.sort();
    paths
}

/// Load every service file of `dir` into `registry`.
///
/// Returns `(id, name)` of each registered service in load order. Files
/// that cannot be read, lack a name, or name neither a unit nor a command
/// line are skipped with a warning.
pub async fn load_services(
    registry: &mut ServiceRegistry,
    dir: &Path,
) -> Vec<(String, String)> {
    let mut loaded = Vec::new();

    for path in load_dir(dir) {
        log::debug!("Loading service '{}'", path.display());

        let file = match load_service_file(&path).await {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Cannot load service file '{}': {}", path.display(), e);
                continue;
            }
        };

        let Some(id) = registry.register(&file.name, file.systemd_service, file.exec) else {
            log::warn!("Missing exec or unit in service file '{}'", path.display());
            continue;
        };

        loaded.push((id, file.name));
    }

    loaded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential() {
        let mut registry = ServiceRegistry::new();
        let a = registry.register("org.example.A", Some("a.service".into()), None);
        let b = registry.register("org.example.B", None, Some(vec!["/bin/b".into()]));
        assert_eq!(a.as_deref(), Some("1"));
        assert_eq!(b.as_deref(), Some("2"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_without_activation_is_skipped() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.register("org.example.None", None, None).is_none());
        assert!(registry
            .register("org.example.Empty", None, Some(vec![]))
            .is_none());
        assert!(registry.is_empty());

        // Skips do not consume ids
        let id = registry.register("org.example.A", Some("a.service".into()), None);
        assert_eq!(id.as_deref(), Some("1"));
    }

    #[test]
    fn test_drain_by_ids() {
        let mut registry = ServiceRegistry::new();
        registry.register("org.example.A", Some("a.service".into()), None);
        registry.register("org.example.B", Some("b.service".into()), None);

        let mut ids: Vec<String> = registry.ids().map(str::to_owned).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);

        for id in &ids {
            assert!(registry.remove(id).is_some());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unit_takes_precedence() {
        let mut registry = ServiceRegistry::new();
        let id = registry
            .register(
                "org.example.Both",
                Some("both.service".into()),
                Some(vec!["/bin/both".into()]),
            )
            .unwrap();
        let service = registry.lookup(&id).unwrap();
        assert_eq!(service.unit(), Some("both.service"));
        assert!(service.exec().is_none());
    }

    #[test]
    fn test_lookup_and_remove() {
        let mut registry = ServiceRegistry::new();
        let id = registry
            .register("org.example.A", None, Some(vec!["/bin/a".into(), "-x".into()]))
            .unwrap();

        let service = registry.lookup(&id).unwrap();
        assert_eq!(service.name(), "org.example.A");
        assert_eq!(service.exec(), Some(&["/bin/a".to_string(), "-x".to_string()][..]));

        assert!(registry.lookup("42").is_none());
        assert!(registry.remove(&id).is_some());
        assert!(registry.lookup(&id).is_none());

        // Ids are never reused
        let next = registry.register("org.example.B", Some("b.service".into()), None);
        assert_eq!(next.as_deref(), Some("2"));
    }

    #[test]
    fn test_load_dir_missing_is_empty() {
        let paths = load_dir(Path::new("/nonexistent/dbus-1/services-12345"));
        assert!(paths.is_empty());
    }
}
