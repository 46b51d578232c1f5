//! Bus configuration reader
//!
//! Reads the XML bus configuration (`system.conf`, `session.conf` and their
//! includes) into a flat list of `<policy>` blocks in document order. Only
//! what the policy compiler needs is kept; every other element is accepted
//! and skipped.

use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Includes nested deeper than this are treated as a cycle
pub const MAX_INCLUDE_DEPTH: usize = 64;

/// Present only while SELinux is enabled
const SELINUX_ENFORCE: &str = "/sys/fs/selinux/enforce";
const SELINUX_CONFIG: &str = "/etc/selinux/config";
const SELINUX_DIR: &str = "/etc/selinux";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read bus config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed XML in {}: {source}", .path.display())]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },

    #[error("Invalid bus config {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Who a `<policy>` block applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyContext {
    Default,
    Mandatory,
    User(String),
    Group(String),
    AtConsole(bool),
}

/// Attributes of one `<allow>`/`<deny>` element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleAttrs {
    pub send_interface: Option<String>,
    pub send_member: Option<String>,
    pub send_error: Option<String>,
    pub send_destination: Option<String>,
    pub send_path: Option<String>,
    pub send_type: Option<String>,
    pub send_requested_reply: Option<bool>,
    pub receive_interface: Option<String>,
    pub receive_member: Option<String>,
    pub receive_error: Option<String>,
    pub receive_sender: Option<String>,
    pub receive_path: Option<String>,
    pub receive_type: Option<String>,
    pub receive_requested_reply: Option<bool>,
    pub own: Option<String>,
    pub own_prefix: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub eavesdrop: Option<bool>,
    pub log: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleNode {
    pub allow: bool,
    pub attrs: RuleAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyNode {
    pub context: PolicyContext,
    pub rules: Vec<RuleNode>,
}

/// SELinux state consulted by `if_selinux_enabled` and
/// `selinux_root_relative` includes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selinux {
    pub enabled: bool,
    /// Policy root such as `/etc/selinux/targeted`
    pub root: Option<PathBuf>,
}

impl Selinux {
    /// Probe the running system
    pub fn detect() -> Self {
        let enabled = Path::new(SELINUX_ENFORCE).exists();
        let root = if enabled {
            policy_root(Path::new(SELINUX_CONFIG))
        } else {
            None
        };
        Self { enabled, root }
    }
}

/// `/etc/selinux/<SELINUXTYPE>` from the SELinux config file
fn policy_root(config: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(config).ok()?;
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("SELINUXTYPE="))
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .map(|kind| Path::new(SELINUX_DIR).join(kind))
}

/// Parsed configuration, includes resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigRoot {
    pub policies: Vec<PolicyNode>,
}

impl ConfigRoot {
    /// Read a configuration file and everything it includes
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        Self::read_with(path, &Selinux::detect())
    }

    pub fn read_with(path: &Path, selinux: &Selinux) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_with(path, &content, selinux)
    }

    /// Parse configuration text. `path` anchors relative includes.
    pub fn parse_str(path: &Path, content: &str) -> Result<Self, ConfigError> {
        Self::parse_with(path, content, &Selinux::detect())
    }

    pub fn parse_with(path: &Path, content: &str, selinux: &Selinux) -> Result<Self, ConfigError> {
        let mut root = Self::default();
        FileParser::new(path, 0, &mut root, selinux).run(content)?;
        Ok(root)
    }
}

#[derive(Debug)]
struct PendingInclude {
    dir: bool,
    ignore_missing: bool,
    if_selinux_enabled: bool,
    selinux_root_relative: bool,
    target: String,
}

struct FileParser<'a> {
    path: &'a Path,
    depth: usize,
    root: &'a mut ConfigRoot,
    selinux: &'a Selinux,
    stack: Vec<String>,
    saw_busconfig: bool,
    policy: Option<PolicyNode>,
    include: Option<PendingInclude>,
}

impl<'a> FileParser<'a> {
    fn new(path: &'a Path, depth: usize, root: &'a mut ConfigRoot, selinux: &'a Selinux) -> Self {
        Self {
            path,
            depth,
            root,
            selinux,
            stack: Vec::new(),
            saw_busconfig: false,
            policy: None,
            include: None,
        }
    }

    fn run(mut self, content: &str) -> Result<(), ConfigError> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        loop {
            match reader.read_event().map_err(|e| self.xml(e))? {
                Event::Start(e) => {
                    let name = element_name(&e);
                    self.open(&name, &e)?;
                    self.stack.push(name);
                }
                Event::Empty(e) => {
                    let name = element_name(&e);
                    self.open(&name, &e)?;
                    self.close(&name)?;
                }
                Event::End(_) => {
                    if let Some(name) = self.stack.pop() {
                        self.close(&name)?;
                    }
                }
                Event::Text(t) => {
                    if let Some(include) = self.include.as_mut() {
                        let text = t.unescape().map_err(|e| ConfigError::Xml {
                            path: self.path.to_path_buf(),
                            source: e,
                        })?;
                        include.target.push_str(&text);
                    }
                }
                Event::Eof => break,
                // Declarations, comments, doctype, processing instructions
                _ => {}
            }
        }

        if !self.saw_busconfig {
            return Err(self.invalid("missing <busconfig> root element"));
        }
        Ok(())
    }

    fn open(&mut self, name: &str, e: &BytesStart<'_>) -> Result<(), ConfigError> {
        let parent = self.stack.last().map(String::as_str);

        match (parent, name) {
            (None, "busconfig") => self.saw_busconfig = true,
            (None, other) => {
                return Err(self.invalid(&format!("unexpected root element <{}>", other)));
            }
            (Some("busconfig"), "policy") => {
                self.policy = Some(PolicyNode {
                    context: self.policy_context(e)?,
                    rules: Vec::new(),
                });
            }
            (Some("busconfig"), "include") => {
                let mut include = PendingInclude {
                    dir: false,
                    ignore_missing: false,
                    if_selinux_enabled: false,
                    selinux_root_relative: false,
                    target: String::new(),
                };
                for (key, value) in self.attrs(e)? {
                    let flag = match key.as_str() {
                        "ignore_missing" => &mut include.ignore_missing,
                        "if_selinux_enabled" => &mut include.if_selinux_enabled,
                        "selinux_root_relative" => &mut include.selinux_root_relative,
                        _ => return Err(self.invalid(&format!("unknown include attribute {}", key))),
                    };
                    *flag = self.yes_no(&key, &value)?;
                }
                self.include = Some(include);
            }
            (Some("busconfig"), "includedir") => {
                self.include = Some(PendingInclude {
                    dir: true,
                    ignore_missing: true,
                    if_selinux_enabled: false,
                    selinux_root_relative: false,
                    target: String::new(),
                });
            }
            (Some("policy"), "allow") | (Some("policy"), "deny") => {
                let rule = RuleNode {
                    allow: name == "allow",
                    attrs: self.rule_attrs(e)?,
                };
                if let Some(policy) = self.policy.as_mut() {
                    policy.rules.push(rule);
                }
            }
            (_, "allow") | (_, "deny") => {
                return Err(self.invalid(&format!("<{}> outside of <policy>", name)));
            }
            _ => log::debug!("Ignoring <{}> in {}", name, self.path.display()),
        }

        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<(), ConfigError> {
        match name {
            "policy" => {
                if let Some(policy) = self.policy.take() {
                    self.root.policies.push(policy);
                }
            }
            "include" | "includedir" => {
                if let Some(include) = self.include.take() {
                    self.resolve_include(include)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_include(&mut self, include: PendingInclude) -> Result<(), ConfigError> {
        let target = include.target.trim();
        if target.is_empty() {
            return Err(self.invalid("empty include"));
        }

        if include.if_selinux_enabled && !self.selinux.enabled {
            log::debug!("Skipping include {} without SELinux", target);
            return Ok(());
        }

        let base = if include.selinux_root_relative {
            match self.selinux.root.as_deref() {
                Some(root) => Some(root),
                None => {
                    log::warn!("Skipping include {}: no SELinux policy root", target);
                    return Ok(());
                }
            }
        } else {
            self.path.parent()
        };
        let target = match base {
            Some(dir) => dir.join(target),
            None => PathBuf::from(target),
        };

        if self.depth + 1 > MAX_INCLUDE_DEPTH {
            return Err(self.invalid("include depth exceeded"));
        }

        if include.dir {
            for file in conf_files(&target)? {
                self.include_file(&file, true)?;
            }
            Ok(())
        } else {
            self.include_file(&target, include.ignore_missing)
        }
    }

    fn include_file(&mut self, path: &Path, ignore_missing: bool) -> Result<(), ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if ignore_missing && e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Skipping missing include {}", path.display());
                return Ok(());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        log::debug!("Including {}", path.display());
        FileParser::new(path, self.depth + 1, &mut *self.root, self.selinux).run(&content)
    }

    fn policy_context(&self, e: &BytesStart<'_>) -> Result<PolicyContext, ConfigError> {
        let mut context = None;

        for (key, value) in self.attrs(e)? {
            let next = match (key.as_str(), value.as_str()) {
                ("context", "default") => PolicyContext::Default,
                ("context", "mandatory") => PolicyContext::Mandatory,
                ("user", _) => PolicyContext::User(value),
                ("group", _) => PolicyContext::Group(value),
                ("at_console", "true") => PolicyContext::AtConsole(true),
                ("at_console", "false") => PolicyContext::AtConsole(false),
                _ => {
                    return Err(self.invalid(&format!("bad <policy> attribute {}=\"{}\"", key, value)));
                }
            };
            if context.replace(next).is_some() {
                return Err(self.invalid("<policy> with more than one context"));
            }
        }

        context.ok_or_else(|| self.invalid("<policy> without context"))
    }

    fn rule_attrs(&self, e: &BytesStart<'_>) -> Result<RuleAttrs, ConfigError> {
        let mut attrs = RuleAttrs::default();

        for (key, value) in self.attrs(e)? {
            match key.as_str() {
                "send_interface" => attrs.send_interface = Some(value),
                "send_member" => attrs.send_member = Some(value),
                "send_error" => attrs.send_error = Some(value),
                "send_destination" => attrs.send_destination = Some(value),
                "send_path" => attrs.send_path = Some(value),
                "send_type" => attrs.send_type = Some(value),
                "send_requested_reply" => attrs.send_requested_reply = Some(self.boolean(&key, &value)?),
                "receive_interface" => attrs.receive_interface = Some(value),
                "receive_member" => attrs.receive_member = Some(value),
                "receive_error" => attrs.receive_error = Some(value),
                "receive_sender" => attrs.receive_sender = Some(value),
                "receive_path" => attrs.receive_path = Some(value),
                "receive_type" => attrs.receive_type = Some(value),
                "receive_requested_reply" => {
                    attrs.receive_requested_reply = Some(self.boolean(&key, &value)?)
                }
                "own" => attrs.own = Some(value),
                "own_prefix" => attrs.own_prefix = Some(value),
                "user" => attrs.user = Some(value),
                "group" => attrs.group = Some(value),
                "eavesdrop" => attrs.eavesdrop = Some(self.boolean(&key, &value)?),
                "log" => attrs.log = Some(self.boolean(&key, &value)?),
                _ => return Err(self.invalid(&format!("unknown rule attribute {}", key))),
            }
        }

        Ok(attrs)
    }

    fn attrs(&self, e: &BytesStart<'_>) -> Result<Vec<(String, String)>, ConfigError> {
        let mut out = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| self.xml(e.into()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| self.xml(e))?.into_owned();
            out.push((key, value));
        }
        Ok(out)
    }

    fn yes_no(&self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match value {
            "yes" => Ok(true),
            "no" => Ok(false),
            _ => Err(self.invalid(&format!("{} must be yes or no", key))),
        }
    }

    fn boolean(&self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match value {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(self.invalid(&format!("{} must be true or false", key))),
        }
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            path: self.path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    fn xml(&self, source: quick_xml::Error) -> ConfigError {
        ConfigError::Xml {
            path: self.path.to_path_buf(),
            source,
        }
    }
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

/// `*.conf` files of an include directory, sorted. A missing directory is empty.
fn conf_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<ConfigRoot, ConfigError> {
        ConfigRoot::parse_str(Path::new("/nonexistent/bus.conf"), content)
    }

    #[test]
    fn test_policy_blocks_in_order() {
        let root = parse(
            r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
<busconfig>
  <type>system</type>
  <policy context="default">
    <allow user="*"/>
    <deny own="*"/>
    <allow send_destination="org.freedesktop.DBus" send_interface="org.freedesktop.DBus"/>
  </policy>
  <policy user="root">
    <allow own="*"/>
  </policy>
  <policy context="mandatory">
    <deny send_type="signal" send_path="/org/example"/>
  </policy>
</busconfig>"#,
        )
        .unwrap();

        assert_eq!(root.policies.len(), 3);
        assert_eq!(root.policies[0].context, PolicyContext::Default);
        assert_eq!(root.policies[0].rules.len(), 3);
        assert!(root.policies[0].rules[0].allow);
        assert_eq!(root.policies[0].rules[0].attrs.user.as_deref(), Some("*"));
        assert!(!root.policies[0].rules[1].allow);
        assert_eq!(root.policies[1].context, PolicyContext::User("root".into()));
        assert_eq!(root.policies[2].context, PolicyContext::Mandatory);
        assert_eq!(
            root.policies[2].rules[0].attrs.send_type.as_deref(),
            Some("signal")
        );
    }

    #[test]
    fn test_wrong_root_rejected() {
        let err = parse("<config><policy context=\"default\"/></config>").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_unknown_rule_attribute_rejected() {
        let err = parse(
            "<busconfig><policy context=\"default\"><allow send_bogus=\"x\"/></policy></busconfig>",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref reason, .. } if reason.contains("send_bogus")));
    }

    #[test]
    fn test_bad_context_rejected() {
        let err =
            parse("<busconfig><policy context=\"sometimes\"></policy></busconfig>").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_rule_outside_policy_rejected() {
        let err = parse("<busconfig><allow own=\"*\"/></busconfig>").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_malformed_xml() {
        let err = parse("<busconfig><policy context=\"default\"></busconfig>").unwrap_err();
        assert!(matches!(err, ConfigError::Xml { .. }));
    }

    #[test]
    fn test_missing_optional_include_ignored() {
        let root = parse(
            "<busconfig><include ignore_missing=\"yes\">nope.conf</include><includedir>nope.d</includedir></busconfig>",
        )
        .unwrap();
        assert!(root.policies.is_empty());
    }

    #[test]
    fn test_missing_include_is_error() {
        let err = parse("<busconfig><include>nope.conf</include></busconfig>").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_includes_resolved_relative() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("system.conf");
        std::fs::create_dir(dir.path().join("system.d")).unwrap();
        std::fs::write(
            &main,
            r#"<busconfig>
  <policy context="default"><allow user="*"/></policy>
  <includedir>system.d</includedir>
  <include ignore_missing="yes">system-local.conf</include>
</busconfig>"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("system.d/b.conf"),
            "<busconfig><policy group=\"wheel\"><allow own=\"org.example.B\"/></policy></busconfig>",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("system.d/a.conf"),
            "<busconfig><policy user=\"root\"><allow own=\"org.example.A\"/></policy></busconfig>",
        )
        .unwrap();
        std::fs::write(dir.path().join("system.d/ignored.txt"), "not xml").unwrap();

        let root = ConfigRoot::read(&main).unwrap();
        let contexts: Vec<_> = root.policies.iter().map(|p| p.context.clone()).collect();
        assert_eq!(
            contexts,
            vec![
                PolicyContext::Default,
                PolicyContext::User("root".into()),
                PolicyContext::Group("wheel".into()),
            ]
        );
    }

    const SELINUX_INCLUDE: &str = r#"<busconfig>
  <policy context="default"><allow user="*"/></policy>
  <include if_selinux_enabled="yes" selinux_root_relative="yes">contexts/dbus_contexts</include>
</busconfig>"#;

    #[test]
    fn test_selinux_include_skipped_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("system.conf");
        std::fs::write(&main, SELINUX_INCLUDE).unwrap();

        let root = ConfigRoot::read_with(&main, &Selinux::default()).unwrap();
        assert_eq!(root.policies.len(), 1);
    }

    #[test]
    fn test_selinux_include_relative_to_policy_root() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("system.conf");
        std::fs::write(&main, SELINUX_INCLUDE).unwrap();

        let policy_root = tempfile::tempdir().unwrap();
        std::fs::create_dir(policy_root.path().join("contexts")).unwrap();
        std::fs::write(
            policy_root.path().join("contexts/dbus_contexts"),
            "<busconfig><policy context=\"mandatory\"><deny own=\"org.example.X\"/></policy></busconfig>",
        )
        .unwrap();

        let selinux = Selinux {
            enabled: true,
            root: Some(policy_root.path().to_path_buf()),
        };
        let root = ConfigRoot::read_with(&main, &selinux).unwrap();
        assert_eq!(root.policies.len(), 2);
        assert_eq!(root.policies[1].context, PolicyContext::Mandatory);

        // Not resolved against the including file's directory
        let err = ConfigRoot::read_with(
            &main,
            &Selinux {
                enabled: true,
                root: Some(dir.path().to_path_buf()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_bad_include_flag_rejected() {
        let err = parse("<busconfig><include ignore_missing=\"maybe\">a.conf</include></busconfig>")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref reason, .. } if reason.contains("yes or no")));
    }

    #[test]
    fn test_policy_root_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config");
        std::fs::write(&config, "# comment\nSELINUX=enforcing\nSELINUXTYPE=targeted\n").unwrap();
        assert_eq!(policy_root(&config), Some(PathBuf::from("/etc/selinux/targeted")));

        std::fs::write(&config, "SELINUX=disabled\n").unwrap();
        assert_eq!(policy_root(&config), None);
    }

    #[test]
    fn test_include_cycle_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("loop.conf");
        std::fs::write(&main, "<busconfig><include>loop.conf</include></busconfig>").unwrap();

        let err = ConfigRoot::read(&main).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref reason, .. } if reason.contains("depth")));
    }
}
