//! Policy compiler
//!
//! Turns the `<policy>` blocks of a bus configuration into the ruleset the
//! broker enforces. The launcher never evaluates these rules itself; it only
//! sorts them by subject, ranks them, and ships them along with the listener.
//!
//! Every rule gets a priority made of its context rank (high 32 bits) and
//! its position in the configuration (low 32 bits), so a later rule beats an
//! earlier one of the same context, and any mandatory rule beats all others.

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;

use serde::Serialize;
use zbus::zvariant::{ObjectPath, Type};

use super::config::{ConfigRoot, PolicyContext, RuleAttrs, RuleNode};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Rule mixes {0} and {1} attributes")]
    MixedRule(&'static str, &'static str),

    #[error("Rule without any match attribute")]
    EmptyRule,

    #[error("Invalid message type '{0}'")]
    InvalidMessageType(String),

    #[error("Invalid object path '{0}'")]
    InvalidObjectPath(String),
}

/// Who a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subject {
    Everyone,
    Uid(u32),
    Gid(u32),
    Console(bool),
}

impl Subject {
    fn wire(&self) -> (u32, u32) {
        match *self {
            Subject::Everyone => (0, 0),
            Subject::Uid(uid) => (1, uid),
            Subject::Gid(gid) => (2, gid),
            Subject::Console(on) => (3, on as u32),
        }
    }
}

/// Verdict plus the match it applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule<M> {
    pub allow: bool,
    pub priority: u64,
    pub matcher: M,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnMatch {
    pub prefix: bool,
    /// Empty matches every name
    pub name: String,
}

/// Empty strings and a zero type match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TransmitMatch {
    pub send: bool,
    pub peer: String,
    pub interface: String,
    pub member: String,
    pub error: String,
    pub path: String,
    pub message_type: u32,
}

/// Rules for one subject
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub own: Vec<Rule<OwnMatch>>,
    pub transmit: Vec<Rule<TransmitMatch>>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.own.is_empty() && self.transmit.is_empty()
    }
}

/// Compiled access policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub connect: Vec<Rule<Subject>>,
    pub batches: BTreeMap<Subject, Batch>,
}

impl Policy {
    /// Compile a parsed configuration
    pub fn import(root: &ConfigRoot) -> Result<Self, PolicyError> {
        let mut policy = Self::default();
        let mut position: u64 = 0;

        for node in &root.policies {
            let Some((subject, rank)) = resolve_context(&node.context) else {
                log::warn!("Skipping policy for unknown {:?}", node.context);
                continue;
            };

            for rule in &node.rules {
                position += 1;
                let priority = (rank << 32) | (position & 0xffff_ffff);
                policy.add_rule(subject, priority, rule)?;
            }
        }

        Ok(policy)
    }

    fn add_rule(&mut self, subject: Subject, priority: u64, rule: &RuleNode) -> Result<(), PolicyError> {
        let allow = rule.allow;
        let attrs = &rule.attrs;

        match classify(attrs)? {
            RuleKind::Qualifier => {
                log::debug!("Skipping rule with only eavesdrop or log attributes");
            }
            RuleKind::Connect => {
                let Some(target) = connect_subject(attrs) else {
                    log::warn!("Skipping connect rule for unknown user or group");
                    return Ok(());
                };
                self.connect.push(Rule {
                    allow,
                    priority,
                    matcher: target,
                });
            }
            RuleKind::Own => {
                let (prefix, name) = match (&attrs.own, &attrs.own_prefix) {
                    (Some(name), _) if name == "*" => (true, String::new()),
                    (Some(name), _) => (false, name.clone()),
                    (None, Some(prefix)) => (true, prefix.clone()),
                    (None, None) => return Err(PolicyError::EmptyRule),
                };
                self.batches.entry(subject).or_default().own.push(Rule {
                    allow,
                    priority,
                    matcher: OwnMatch { prefix, name },
                });
            }
            RuleKind::Send => {
                let matcher = TransmitMatch {
                    send: true,
                    peer: wildcard(&attrs.send_destination),
                    interface: wildcard(&attrs.send_interface),
                    member: wildcard(&attrs.send_member),
                    error: wildcard(&attrs.send_error),
                    path: wildcard(&attrs.send_path),
                    message_type: message_type(&attrs.send_type)?,
                };
                self.push_transmit(subject, allow, priority, matcher);
            }
            RuleKind::Receive => {
                let matcher = TransmitMatch {
                    send: false,
                    peer: wildcard(&attrs.receive_sender),
                    interface: wildcard(&attrs.receive_interface),
                    member: wildcard(&attrs.receive_member),
                    error: wildcard(&attrs.receive_error),
                    path: wildcard(&attrs.receive_path),
                    message_type: message_type(&attrs.receive_type)?,
                };
                self.push_transmit(subject, allow, priority, matcher);
            }
        }

        Ok(())
    }

    fn push_transmit(&mut self, subject: Subject, allow: bool, priority: u64, matcher: TransmitMatch) {
        self.batches.entry(subject).or_default().transmit.push(Rule {
            allow,
            priority,
            matcher,
        });
    }

    /// Drop rules shadowed by a higher-priority rule with the same match,
    /// then drop subjects left without rules.
    pub fn optimize(&mut self) {
        dedup_rules(&mut self.connect);
        for batch in self.batches.values_mut() {
            dedup_rules(&mut batch.own);
            dedup_rules(&mut batch.transmit);
        }
        self.batches.retain(|_, batch| !batch.is_empty());
    }

    /// Wire form appended to `AddListener`
    pub fn export(&self) -> Result<PolicyWire, PolicyError> {
        let connect = self
            .connect
            .iter()
            .map(|rule| {
                let (kind, id) = rule.matcher.wire();
                (kind, id, rule.allow, rule.priority)
            })
            .collect();

        let mut batches = Vec::with_capacity(self.batches.len());
        for (subject, batch) in &self.batches {
            let (kind, id) = subject.wire();

            let own = batch
                .own
                .iter()
                .map(|rule| (rule.allow, rule.priority, rule.matcher.prefix, rule.matcher.name.clone()))
                .collect();

            let mut transmit = Vec::with_capacity(batch.transmit.len());
            for rule in &batch.transmit {
                let m = &rule.matcher;
                if !m.path.is_empty() && ObjectPath::try_from(m.path.as_str()).is_err() {
                    return Err(PolicyError::InvalidObjectPath(m.path.clone()));
                }
                transmit.push(TransmitWire {
                    allow: rule.allow,
                    priority: rule.priority,
                    send: m.send,
                    peer: m.peer.clone(),
                    interface: m.interface.clone(),
                    member: m.member.clone(),
                    error: m.error.clone(),
                    path: m.path.clone(),
                    message_type: m.message_type,
                });
            }

            batches.push(BatchWire {
                kind,
                id,
                own,
                transmit,
            });
        }

        Ok(PolicyWire { connect, batches })
    }
}

/// Serialized policy: `(a(uubt)a(uua(btbs)a(btbsssssu)))`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Type)]
pub struct PolicyWire {
    pub connect: Vec<(u32, u32, bool, u64)>,
    pub batches: Vec<BatchWire>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Type)]
pub struct BatchWire {
    pub kind: u32,
    pub id: u32,
    pub own: Vec<(bool, u64, bool, String)>,
    pub transmit: Vec<TransmitWire>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Type)]
pub struct TransmitWire {
    pub allow: bool,
    pub priority: u64,
    pub send: bool,
    pub peer: String,
    pub interface: String,
    pub member: String,
    pub error: String,
    pub path: String,
    pub message_type: u32,
}

enum RuleKind {
    /// Only `eavesdrop`/`log`, which qualify a match but are not one
    Qualifier,
    Connect,
    Own,
    Send,
    Receive,
}

fn classify(attrs: &RuleAttrs) -> Result<RuleKind, PolicyError> {
    let connect = attrs.user.is_some() || attrs.group.is_some();
    let own = attrs.own.is_some() || attrs.own_prefix.is_some();
    let send = attrs.send_interface.is_some()
        || attrs.send_member.is_some()
        || attrs.send_error.is_some()
        || attrs.send_destination.is_some()
        || attrs.send_path.is_some()
        || attrs.send_type.is_some()
        || attrs.send_requested_reply.is_some();
    let receive = attrs.receive_interface.is_some()
        || attrs.receive_member.is_some()
        || attrs.receive_error.is_some()
        || attrs.receive_sender.is_some()
        || attrs.receive_path.is_some()
        || attrs.receive_type.is_some()
        || attrs.receive_requested_reply.is_some();

    let kinds = [
        (connect, "user/group", RuleKind::Connect),
        (own, "own", RuleKind::Own),
        (send, "send", RuleKind::Send),
        (receive, "receive", RuleKind::Receive),
    ];

    let mut found: Option<(&'static str, RuleKind)> = None;
    for (present, label, kind) in kinds {
        if !present {
            continue;
        }
        if let Some((first, _)) = found {
            return Err(PolicyError::MixedRule(first, label));
        }
        found = Some((label, kind));
    }

    match found {
        Some((_, kind)) => Ok(kind),
        None if attrs.eavesdrop.is_some() || attrs.log.is_some() => Ok(RuleKind::Qualifier),
        None => Err(PolicyError::EmptyRule),
    }
}

/// Subject and context rank of a `<policy>` block, or `None` if its user or
/// group does not exist
fn resolve_context(context: &PolicyContext) -> Option<(Subject, u64)> {
    match context {
        PolicyContext::Default => Some((Subject::Everyone, 0)),
        PolicyContext::Group(group) => Some((resolve_group(group)?, 1)),
        PolicyContext::User(user) => Some((resolve_user(user)?, 2)),
        PolicyContext::AtConsole(on) => Some((Subject::Console(*on), 3)),
        PolicyContext::Mandatory => Some((Subject::Everyone, 4)),
    }
}

fn connect_subject(attrs: &RuleAttrs) -> Option<Subject> {
    match (&attrs.user, &attrs.group) {
        (Some(user), _) => resolve_user(user),
        (None, Some(group)) => resolve_group(group),
        (None, None) => None,
    }
}

fn resolve_user(name: &str) -> Option<Subject> {
    if name == "*" {
        return Some(Subject::Everyone);
    }
    if let Ok(uid) = name.parse::<u32>() {
        return Some(Subject::Uid(uid));
    }
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Some(Subject::Uid(user.uid.as_raw())),
        Ok(None) => None,
        Err(e) => {
            log::warn!("Failed to look up user {}: {}", name, e);
            None
        }
    }
}

fn resolve_group(name: &str) -> Option<Subject> {
    if name == "*" {
        return Some(Subject::Everyone);
    }
    if let Ok(gid) = name.parse::<u32>() {
        return Some(Subject::Gid(gid));
    }
    match nix::unistd::Group::from_name(name) {
        Ok(Some(group)) => Some(Subject::Gid(group.gid.as_raw())),
        Ok(None) => None,
        Err(e) => {
            log::warn!("Failed to look up group {}: {}", name, e);
            None
        }
    }
}

fn wildcard(value: &Option<String>) -> String {
    match value.as_deref() {
        None | Some("*") => String::new(),
        Some(value) => value.to_string(),
    }
}

fn message_type(value: &Option<String>) -> Result<u32, PolicyError> {
    match value.as_deref() {
        None | Some("*") => Ok(0),
        Some("method_call") => Ok(1),
        Some("method_return") => Ok(2),
        Some("error") => Ok(3),
        Some("signal") => Ok(4),
        Some(other) => Err(PolicyError::InvalidMessageType(other.to_string())),
    }
}

/// Keep only the highest-priority rule per match, in priority order
fn dedup_rules<M: Clone + Eq + Hash>(rules: &mut Vec<Rule<M>>) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    let mut seen = HashSet::new();
    rules.retain(|rule| seen.insert(rule.matcher.clone()));
    rules.reverse();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn compile(content: &str) -> Result<Policy, PolicyError> {
        let root = ConfigRoot::parse_str(Path::new("/nonexistent/bus.conf"), content).unwrap();
        Policy::import(&root)
    }

    #[test]
    fn test_rules_sorted_by_subject() {
        let policy = compile(
            r#"<busconfig>
  <policy context="default">
    <allow user="*"/>
    <deny own="*"/>
    <allow send_destination="org.freedesktop.DBus" send_type="method_call"/>
    <allow receive_sender="org.freedesktop.DBus"/>
  </policy>
  <policy user="0">
    <allow own_prefix="org.example"/>
  </policy>
  <policy group="100">
    <deny send_interface="org.example.Secret"/>
  </policy>
</busconfig>"#,
        )
        .unwrap();

        assert_eq!(policy.connect.len(), 1);
        assert_eq!(policy.connect[0].matcher, Subject::Everyone);
        assert!(policy.connect[0].allow);

        let everyone = &policy.batches[&Subject::Everyone];
        assert_eq!(everyone.own.len(), 1);
        assert_eq!(
            everyone.own[0].matcher,
            OwnMatch {
                prefix: true,
                name: String::new()
            }
        );
        assert_eq!(everyone.transmit.len(), 2);
        assert!(everyone.transmit[0].matcher.send);
        assert_eq!(everyone.transmit[0].matcher.message_type, 1);
        assert!(!everyone.transmit[1].matcher.send);
        assert_eq!(everyone.transmit[1].matcher.peer, "org.freedesktop.DBus");

        let root = &policy.batches[&Subject::Uid(0)];
        assert_eq!(root.own[0].matcher.name, "org.example");
        assert!(root.own[0].matcher.prefix);

        assert_eq!(policy.batches[&Subject::Gid(100)].transmit.len(), 1);
    }

    #[test]
    fn test_priority_ranks() {
        let policy = compile(
            r#"<busconfig>
  <policy context="mandatory"><deny own="org.example.A"/></policy>
  <policy user="0"><allow own="org.example.A"/></policy>
  <policy group="0"><allow own="org.example.A"/></policy>
  <policy context="default"><allow own="org.example.A"/></policy>
</busconfig>"#,
        )
        .unwrap();

        let mandatory = policy.batches[&Subject::Everyone]
            .own
            .iter()
            .find(|rule| !rule.allow)
            .unwrap()
            .priority;
        let default = policy.batches[&Subject::Everyone]
            .own
            .iter()
            .find(|rule| rule.allow)
            .unwrap()
            .priority;
        let user = policy.batches[&Subject::Uid(0)].own[0].priority;
        let group = policy.batches[&Subject::Gid(0)].own[0].priority;

        // Context rank dominates document order
        assert!(mandatory > user);
        assert!(user > group);
        assert!(group > default);
    }

    #[test]
    fn test_mixed_rule_rejected() {
        let err = compile(
            r#"<busconfig><policy context="default"><allow own="a.b" send_destination="a.b"/></policy></busconfig>"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::MixedRule("own", "send")));
    }

    #[test]
    fn test_empty_rule_rejected() {
        let err =
            compile(r#"<busconfig><policy context="default"><allow/></policy></busconfig>"#).unwrap_err();
        assert!(matches!(err, PolicyError::EmptyRule));
    }

    #[test]
    fn test_session_default_policy() {
        let policy = compile(
            r#"<busconfig>
  <policy context="default">
    <!-- Allow everything to be sent -->
    <allow send_destination="*" eavesdrop="true"/>
    <!-- Allow everything to be received -->
    <allow eavesdrop="true"/>
    <!-- Allow anyone to own anything -->
    <allow own="*"/>
  </policy>
</busconfig>"#,
        )
        .unwrap();

        assert!(policy.connect.is_empty());
        let everyone = &policy.batches[&Subject::Everyone];
        assert_eq!(everyone.transmit.len(), 1);
        assert!(everyone.transmit[0].matcher.send);
        assert_eq!(everyone.transmit[0].matcher.peer, "");
        assert_eq!(everyone.own.len(), 1);
        assert!(everyone.own[0].matcher.prefix);
    }

    #[test]
    fn test_log_only_rule_skipped() {
        let policy =
            compile(r#"<busconfig><policy context="default"><deny log="true"/></policy></busconfig>"#)
                .unwrap();
        assert!(policy.batches.is_empty());
    }

    #[test]
    fn test_bad_send_type_rejected() {
        let err = compile(
            r#"<busconfig><policy context="default"><allow send_type="broadcast"/></policy></busconfig>"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidMessageType(ref t) if t == "broadcast"));
    }

    #[test]
    fn test_unknown_user_skipped() {
        let policy = compile(
            r#"<busconfig>
  <policy user="no-such-user-for-policy-tests"><allow own="*"/></policy>
  <policy context="default"><allow user="no-such-user-for-policy-tests"/></policy>
</busconfig>"#,
        )
        .unwrap();
        assert!(policy.batches.is_empty());
        assert!(policy.connect.is_empty());
    }

    #[test]
    fn test_optimize_keeps_latest_duplicate() {
        let mut policy = compile(
            r#"<busconfig>
  <policy context="default">
    <deny send_destination="org.example.A"/>
    <allow own="org.example.B"/>
    <allow send_destination="org.example.A"/>
  </policy>
  <policy user="0"><deny own="org.example.C"/></policy>
  <policy user="0"><allow own="org.example.C"/></policy>
</busconfig>"#,
        )
        .unwrap();
        policy.optimize();

        let everyone = &policy.batches[&Subject::Everyone];
        assert_eq!(everyone.transmit.len(), 1);
        assert!(everyone.transmit[0].allow);
        assert_eq!(everyone.own.len(), 1);

        let root = &policy.batches[&Subject::Uid(0)];
        assert_eq!(root.own.len(), 1);
        assert!(root.own[0].allow);
    }

    #[test]
    fn test_optimize_drops_empty_subjects() {
        let mut policy = Policy::default();
        policy.batches.insert(Subject::Uid(7), Batch::default());
        policy.optimize();
        assert!(policy.batches.is_empty());
    }

    #[test]
    fn test_export_shape() {
        let mut policy = compile(
            r#"<busconfig>
  <policy context="default">
    <allow user="*"/>
    <allow send_path="/org/example" send_type="signal"/>
  </policy>
  <policy at_console="true"><allow own="org.example.Console"/></policy>
</busconfig>"#,
        )
        .unwrap();
        policy.optimize();

        let wire = policy.export().unwrap();
        assert_eq!(wire.connect.len(), 1);
        assert_eq!((wire.connect[0].0, wire.connect[0].2), (0, true));
        assert_eq!(wire.batches.len(), 2);
        assert_eq!((wire.batches[0].kind, wire.batches[0].id), (0, 0));
        assert_eq!(wire.batches[0].transmit[0].path, "/org/example");
        assert_eq!(wire.batches[0].transmit[0].message_type, 4);
        assert_eq!((wire.batches[1].kind, wire.batches[1].id), (3, 1));

        assert_eq!(
            PolicyWire::SIGNATURE.to_string(),
            "(a(uubt)a(uua(btbs)a(btbsssssu)))"
        );
    }

    #[test]
    fn test_export_rejects_bad_path() {
        let policy = compile(
            r#"<busconfig><policy context="default"><deny receive_path="not/a/path"/></policy></busconfig>"#,
        )
        .unwrap();
        let err = policy.export().unwrap_err();
        assert!(matches!(err, PolicyError::InvalidObjectPath(ref p) if p == "not/a/path"));
    }
}
