//! Scenario descriptor types
//!
//! Defines the data structures for deserializing YAML scenarios, and the
//! static checks run on them before any engine is started.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::common::paths::slug;
use crate::common::{Error, Result};
use crate::facts::Fact;
use crate::sequencer::OperationClass;

use super::bindings::variables;

/// A complete scenario loaded from a YAML file
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Name of the scenario, also used for the run directory
    pub name: String,
    /// Optional description of what the scenario verifies
    #[serde(default)]
    pub description: Option<String>,
    /// Minimum passing assertions that still count as success
    #[serde(default)]
    pub threshold: Option<usize>,
    /// Engine instances taking part, in start order
    pub participants: Vec<Participant>,
    /// Steps whose failure aborts the scenario
    #[serde(default)]
    pub setup: Vec<Step>,
    /// Steps run best-effort
    #[serde(default)]
    pub actions: Vec<Step>,
    /// Predicates scored at the end
    pub assertions: Vec<Assertion>,
}

/// One engine instance in a scenario
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Participant {
    pub name: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creates the space and administers membership
    Owner,
    #[default]
    Member,
}

fn default_space_var() -> String {
    "space_id".to_string()
}

fn default_full_space_var() -> String {
    "full_space_id".to_string()
}

fn default_invite_var() -> String {
    "invite".to_string()
}

fn default_true() -> bool {
    true
}

/// A single scripted step
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// Publish key material (`keypackage publish`), for everyone by default
    PublishKeys {
        #[serde(default)]
        who: Option<Vec<String>>,
    },
    /// `space create <name> [--mode <mode>]`, binding the short id and,
    /// through `context`, the full id as `full_<bind>`
    CreateSpace {
        by: String,
        name: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default = "default_space_var")]
        bind: String,
        #[serde(default = "default_true")]
        resolve_full: bool,
    },
    /// `invite create`
    CreateInvite {
        by: String,
        #[serde(default = "default_invite_var")]
        bind: String,
    },
    /// `network`, binding `<who>.peer_id`
    PeerInfo { who: String },
    /// Connect to `via`, join the space and bind `<who>.user_id`
    Join {
        who: String,
        via: String,
        #[serde(default = "default_full_space_var")]
        space: String,
        #[serde(default = "default_invite_var")]
        invite: String,
    },
    /// `member add <user-id>`
    AddMember { by: String, member: String },
    /// `kick <user-id>` in the kicker's current scope
    Kick { by: String, member: String },
    /// `channel create <name>`
    CreateChannel {
        by: String,
        name: String,
        #[serde(default)]
        bind: Option<String>,
    },
    /// `thread create "<title>"`
    CreateThread {
        by: String,
        title: String,
        #[serde(default)]
        bind: Option<String>,
    },
    /// Select a space, then a channel and optionally a thread by listing them
    Navigate {
        who: String,
        #[serde(default = "default_space_var")]
        space: String,
        channel: String,
        #[serde(default)]
        thread: Option<String>,
    },
    /// `send <text>`, tracked for revocation and continuity checks
    Send {
        who: String,
        text: String,
        #[serde(default)]
        scope: Option<String>,
    },
    /// Any raw engine command
    Command {
        who: String,
        command: String,
        #[serde(default)]
        class: OperationClass,
        /// Explicit settle in seconds, replacing the class default
        #[serde(default)]
        settle: Option<f64>,
    },
    /// Bind a fact from a participant's output
    Extract {
        who: String,
        fact: Fact,
        #[serde(default)]
        arg: Option<String>,
        bind: String,
        #[serde(default = "default_true")]
        required: bool,
    },
    /// Fixed pause
    Wait {
        seconds: f64,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Poll a participant's output until the text appears
    AwaitText {
        who: String,
        contains: String,
        timeout: f64,
    },
    /// Mark a logical point in time for later checks
    Checkpoint { name: String },
}

impl Step {
    /// One-line summary for reports
    pub fn describe(&self) -> String {
        match self {
            Step::PublishKeys { who: None } => "Everyone publishes key packages".to_string(),
            Step::PublishKeys { who: Some(who) } => {
                format!("{} publish key packages", who.join(", "))
            }
            Step::CreateSpace { by, name, mode, .. } => match mode {
                Some(mode) => format!("{by} creates {mode} space '{name}'"),
                None => format!("{by} creates space '{name}'"),
            },
            Step::CreateInvite { by, .. } => format!("{by} creates an invite"),
            Step::PeerInfo { who } => format!("{who} reports network info"),
            Step::Join { who, via, .. } => format!("{who} joins via {via}"),
            Step::AddMember { by, member } => format!("{by} adds {member} to the group"),
            Step::Kick { by, member } => format!("{by} kicks {member}"),
            Step::CreateChannel { by, name, .. } => format!("{by} creates channel '{name}'"),
            Step::CreateThread { by, title, .. } => format!("{by} creates thread \"{title}\""),
            Step::Navigate {
                who,
                channel,
                thread,
                ..
            } => match thread {
                Some(thread) => format!("{who} opens {channel} / \"{thread}\""),
                None => format!("{who} opens {channel}"),
            },
            Step::Send { who, text, .. } => format!("{who} sends \"{text}\""),
            Step::Command { who, command, .. } => format!("{who}: {command}"),
            Step::Extract { who, fact, bind, .. } => format!("Bind {bind} from {who}'s {fact}"),
            Step::Wait { seconds, reason } => match reason {
                Some(reason) => format!("Wait {seconds}s ({reason})"),
                None => format!("Wait {seconds}s"),
            },
            Step::AwaitText { who, contains, .. } => format!("Wait for {who} to see \"{contains}\""),
            Step::Checkpoint { name } => format!("Checkpoint '{name}'"),
        }
    }

    /// Participants this step talks to
    fn participants(&self) -> Vec<&String> {
        match self {
            Step::PublishKeys { who } => who.iter().flatten().collect(),
            Step::CreateSpace { by, .. }
            | Step::CreateInvite { by, .. }
            | Step::CreateChannel { by, .. }
            | Step::CreateThread { by, .. } => vec![by],
            Step::AddMember { by, member } | Step::Kick { by, member } => vec![by, member],
            Step::Join { who, via, .. } => vec![who, via],
            Step::PeerInfo { who }
            | Step::Navigate { who, .. }
            | Step::Send { who, .. }
            | Step::Command { who, .. }
            | Step::Extract { who, .. }
            | Step::AwaitText { who, .. } => vec![who],
            Step::Wait { .. } | Step::Checkpoint { .. } => Vec::new(),
        }
    }

    /// Variables this step needs bound before it runs
    fn requires(&self) -> Vec<String> {
        fn owned(names: Vec<&str>) -> Vec<String> {
            names.into_iter().map(str::to_string).collect()
        }
        match self {
            Step::Join {
                via, space, invite, ..
            } => vec![format!("{via}.peer_id"), space.clone(), invite.clone()],
            Step::AddMember { member, .. } | Step::Kick { member, .. } => {
                vec![format!("{member}.user_id")]
            }
            Step::Navigate { space, .. } => vec![space.clone()],
            Step::Send { text, .. } => owned(variables(text)),
            Step::Command { command, .. } => owned(variables(command)),
            Step::AwaitText { contains, .. } => owned(variables(contains)),
            _ => Vec::new(),
        }
    }

    /// Variables this step binds when it succeeds
    fn binds(&self) -> Vec<String> {
        match self {
            Step::CreateSpace {
                bind, resolve_full, ..
            } => {
                let mut names = vec![bind.clone()];
                if *resolve_full {
                    names.push(format!("full_{bind}"));
                }
                names
            }
            Step::CreateInvite { bind, .. } => vec![bind.clone()],
            Step::PeerInfo { who } => vec![format!("{who}.peer_id"), "peer_id".to_string()],
            Step::Join { who, .. } => vec![format!("{who}.user_id")],
            Step::CreateChannel { bind, .. } | Step::CreateThread { bind, .. } => {
                bind.iter().cloned().collect()
            }
            Step::Extract { bind, .. } => vec![bind.clone()],
            _ => Vec::new(),
        }
    }
}

/// A named predicate
#[derive(Deserialize, Debug, Clone)]
pub struct Assertion {
    pub name: String,
    #[serde(flatten)]
    pub check: Check,
}

/// Predicate vocabulary over captured output
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    /// Output contains the text
    Contains { who: String, text: String },
    /// Output does not contain the text
    NotContains { who: String, text: String },
    /// Output matches the regex
    Matches { who: String, pattern: String },
    /// A registered fact is present in the output
    Fact {
        who: String,
        fact: Fact,
        #[serde(default)]
        arg: Option<String>,
    },
    /// A variable was bound during the run
    Bound { var: String },
    /// Decrypt marker count within bounds
    Decrypts {
        who: String,
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    /// Decrypt marker count grew by at most `max_increase` since a checkpoint
    DecryptsSince {
        who: String,
        checkpoint: String,
        #[serde(default)]
        max_increase: usize,
    },
    /// Messages sent after `since` reach every retained member and not the removed one
    Revocation {
        removed: String,
        retained: Vec<String>,
        since: String,
        #[serde(default)]
        scope: Option<String>,
    },
    /// Member still receives every message sent after `since`
    Continuity {
        member: String,
        since: String,
        #[serde(default)]
        scope: Option<String>,
    },
    /// Every nested check holds
    All { checks: Vec<Check> },
    /// At least one nested check holds
    Any { checks: Vec<Check> },
}

impl Check {
    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Check)) {
        f(self);
        if let Check::All { checks } | Check::Any { checks } = self {
            for check in checks {
                check.visit(f);
            }
        }
    }

    fn participants(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.visit(&mut |check| match check {
            Check::Contains { who, .. }
            | Check::NotContains { who, .. }
            | Check::Matches { who, .. }
            | Check::Fact { who, .. }
            | Check::Decrypts { who, .. }
            | Check::DecryptsSince { who, .. } => names.push(who.as_str()),
            Check::Revocation {
                removed, retained, ..
            } => {
                names.push(removed.as_str());
                names.extend(retained.iter().map(String::as_str));
            }
            Check::Continuity { member, .. } => names.push(member.as_str()),
            Check::Bound { .. } | Check::All { .. } | Check::Any { .. } => {}
        });
        names
    }

    fn checkpoints(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.visit(&mut |check| match check {
            Check::DecryptsSince { checkpoint, .. } => names.push(checkpoint.as_str()),
            Check::Revocation { since, .. } | Check::Continuity { since, .. } => {
                names.push(since.as_str())
            }
            _ => {}
        });
        names
    }
}

impl Scenario {
    /// Load and validate a scenario file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        let scenario = Self::from_yaml(&content)
            .map_err(|e| Error::Scenario(format!("{}: {}", path.display(), e)))?;
        Ok(scenario)
    }

    /// Parse and validate scenario YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        let scenario: Scenario =
            serde_yaml::from_str(content).map_err(|e| Error::Scenario(e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn participant_names(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.name.as_str()).collect()
    }

    /// Static checks: roster, threshold, references and variable flow
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Scenario(format!("{}: {}", self.name, msg)));

        if self.participants.is_empty() {
            return invalid("no participants".to_string());
        }
        let mut roster = HashSet::new();
        // Credential and log files are named by slug
        let mut files: HashMap<String, &str> = HashMap::new();
        for p in &self.participants {
            if !roster.insert(p.name.as_str()) {
                return invalid(format!("participant '{}' is listed twice", p.name));
            }
            if let Some(other) = files.insert(slug(&p.name), p.name.as_str()) {
                return invalid(format!(
                    "participants '{}' and '{}' would share files in the run directory",
                    other, p.name
                ));
            }
        }

        if self.assertions.is_empty() {
            return invalid("no assertions".to_string());
        }
        if let Some(threshold) = self.threshold {
            if threshold == 0 || threshold > self.assertions.len() {
                return invalid(format!(
                    "threshold {} must be between 1 and the assertion count ({})",
                    threshold,
                    self.assertions.len()
                ));
            }
        }

        let mut bound: HashSet<String> = self
            .participants
            .iter()
            .map(|p| format!("{}.port", p.name))
            .collect();
        let mut checkpoints = HashSet::new();

        for (section, steps) in [("setup", &self.setup), ("actions", &self.actions)] {
            for (i, step) in steps.iter().enumerate() {
                let at = format!("{} step {}", section, i + 1);
                for name in step.participants() {
                    if !roster.contains(name.as_str()) {
                        return Err(Error::UnknownParticipant(format!("{name} ({at})")));
                    }
                }
                for var in step.requires() {
                    if !bound.contains(&var) {
                        return invalid(format!("{at} uses '{{{var}}}' before it is bound"));
                    }
                }
                if let Step::Extract { fact, arg: None, .. } = step {
                    if fact.requires_arg() {
                        return invalid(format!("{at}: fact '{fact}' needs an arg"));
                    }
                }
                if let Step::Checkpoint { name } = step {
                    checkpoints.insert(name.as_str());
                }
                bound.extend(step.binds());
            }
        }

        for assertion in &self.assertions {
            for name in assertion.check.participants() {
                if !roster.contains(name) {
                    return Err(Error::UnknownParticipant(format!(
                        "{name} (assertion '{}')",
                        assertion.name
                    )));
                }
            }
            for cp in assertion.check.checkpoints() {
                if !checkpoints.contains(cp) {
                    return invalid(format!(
                        "assertion '{}' refers to undeclared checkpoint '{cp}'",
                        assertion.name
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KICK: &str = r#"
name: kick
threshold: 2
participants:
  - { name: alice, role: owner }
  - { name: bob }
setup:
  - action: publish_keys
  - { action: create_space, by: alice, name: kick-test }
  - { action: create_invite, by: alice }
  - { action: peer_info, who: alice }
  - { action: join, who: bob, via: alice }
  - { action: add_member, by: alice, member: bob }
actions:
  - { action: checkpoint, name: kicked }
  - { action: kick, by: alice, member: bob }
  - { action: send, who: alice, text: After kick }
  - { action: command, who: bob, command: "space {space_id}", class: query, settle: 1.5 }
assertions:
  - name: Bob cannot read after kick
    check: not_contains
    who: bob
    text: After kick
  - name: Revocation holds
    check: revocation
    removed: bob
    retained: [alice]
    since: kicked
  - name: Either marker
    check: any
    checks:
      - { check: fact, who: alice, fact: removal_confirmation }
      - { check: decrypts, who: bob, max: 4 }
"#;

    #[test]
    fn test_parse_full_scenario() {
        let scenario = Scenario::from_yaml(KICK).unwrap();
        assert_eq!(scenario.participants[0].role, Role::Owner);
        assert_eq!(scenario.participants[1].role, Role::Member);
        assert_eq!(scenario.setup.len(), 6);
        assert!(matches!(
            &scenario.setup[1],
            Step::CreateSpace { bind, resolve_full: true, .. } if bind == "space_id"
        ));
        assert!(matches!(
            &scenario.actions[3],
            Step::Command { class: OperationClass::Query, settle: Some(s), .. } if *s == 1.5
        ));
        assert!(matches!(scenario.assertions[2].check, Check::Any { ref checks } if checks.len() == 2));
        assert_eq!(scenario.threshold, Some(2));
    }

    #[test]
    fn test_threshold_above_total_rejected() {
        let yaml = KICK.replace("threshold: 2", "threshold: 4");
        assert!(matches!(Scenario::from_yaml(&yaml), Err(Error::Scenario(_))));
    }

    #[test]
    fn test_participants_with_colliding_file_names_rejected() {
        let yaml = KICK.replace("  - { name: bob }\n", "  - { name: bob }\n  - { name: Alice }\n");
        let err = Scenario::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("share files"), "{err}");

        let yaml = KICK.replace("  - { name: bob }\n", "  - { name: bob-1 }\n  - { name: bob_1 }\n");
        assert!(matches!(Scenario::from_yaml(&yaml), Err(Error::Scenario(_))));
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let yaml = KICK.replace("member: bob }\nactions", "member: carol }\nactions");
        assert!(matches!(
            Scenario::from_yaml(&yaml),
            Err(Error::UnknownParticipant(_))
        ));
    }

    #[test]
    fn test_variable_used_before_bound_rejected() {
        // Joining before anyone reported a peer id
        let yaml = KICK.replace("  - { action: peer_info, who: alice }\n", "");
        let err = Scenario::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("alice.peer_id"), "{err}");
    }

    #[test]
    fn test_undeclared_checkpoint_rejected() {
        let yaml = KICK.replace("name: kicked", "name: later");
        let err = Scenario::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("kicked"), "{err}");
    }

    #[test]
    fn test_unknown_action_rejected() {
        let yaml = KICK.replace("action: publish_keys", "action: teleport");
        assert!(Scenario::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_describe_is_human_readable() {
        let step = Step::Navigate {
            who: "bob".into(),
            space: "space_id".into(),
            channel: "general".into(),
            thread: Some("Kick Test".into()),
        };
        assert_eq!(step.describe(), "bob opens general / \"Kick Test\"");
    }
}
