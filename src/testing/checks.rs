//! Assertion evaluation
//!
//! Checks are evaluated against a frozen view of the run: one snapshot per
//! participant taken after the action phase, the messages the scenario
//! sent, and the checkpoints it recorded. Nothing here touches a process.

use std::collections::HashMap;

use serde::Serialize;

use crate::facts::{Pattern, Snapshot};

use super::bindings::Bindings;
use super::config::Check;

/// A message the scenario sent, in issuance order
#[derive(Debug, Clone, Serialize)]
pub struct SentMessage {
    pub seq: usize,
    pub sender: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// State recorded at a named point in the action phase
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    /// Number of messages sent before the checkpoint
    pub messages: usize,
    /// Decrypt marker count per participant at the checkpoint
    pub decrypts: HashMap<String, usize>,
}

/// Everything checks can look at
pub struct Observed<'a> {
    pub snapshots: &'a HashMap<String, Snapshot>,
    pub messages: &'a [SentMessage],
    pub checkpoints: &'a HashMap<String, Checkpoint>,
    pub bindings: &'a Bindings,
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub passed: bool,
    pub detail: Option<String>,
}

impl Outcome {
    fn pass() -> Self {
        Self {
            passed: true,
            detail: None,
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
        }
    }

    fn check(passed: bool, detail: impl FnOnce() -> String) -> Self {
        if passed {
            Self::pass()
        } else {
            Self::fail(detail())
        }
    }
}

impl Observed<'_> {
    fn snapshot(&self, who: &str) -> Result<&Snapshot, Outcome> {
        self.snapshots
            .get(who)
            .ok_or_else(|| Outcome::fail(format!("no output captured for {who}")))
    }

    fn render(&self, text: &str) -> Result<String, Outcome> {
        self.bindings
            .render(text)
            .map_err(|e| Outcome::fail(e.to_string()))
    }

    fn checkpoint(&self, name: &str) -> Result<&Checkpoint, Outcome> {
        self.checkpoints
            .get(name)
            .ok_or_else(|| Outcome::fail(format!("checkpoint '{name}' was never reached")))
    }

    /// Messages sent after `since`, optionally limited to one scope
    fn sent_after(&self, since: &Checkpoint, scope: Option<&str>) -> Vec<&SentMessage> {
        self.messages
            .iter()
            .skip(since.messages)
            .filter(|m| scope.is_none() || m.scope.as_deref() == scope)
            .collect()
    }
}

/// Evaluate a check
pub fn evaluate(check: &Check, observed: &Observed<'_>) -> Outcome {
    match try_evaluate(check, observed) {
        Ok(outcome) | Err(outcome) => outcome,
    }
}

fn try_evaluate(check: &Check, obs: &Observed<'_>) -> Result<Outcome, Outcome> {
    let outcome = match check {
        Check::Contains { who, text } => {
            let text = obs.render(text)?;
            let found = obs.snapshot(who)?.contains(&text);
            Outcome::check(found, || format!("{who} never saw \"{text}\""))
        }
        Check::NotContains { who, text } => {
            let text = obs.render(text)?;
            let found = obs.snapshot(who)?.contains(&text);
            Outcome::check(!found, || format!("{who} saw \"{text}\""))
        }
        Check::Matches { who, pattern } => {
            let source = obs.render(pattern)?;
            let pattern = Pattern::custom(&source).map_err(|e| Outcome::fail(e.to_string()))?;
            let found = pattern.exists(obs.snapshot(who)?);
            Outcome::check(found, || format!("no match for /{source}/ in {who}'s output"))
        }
        Check::Fact { who, fact, arg } => {
            let arg = arg.as_deref().map(|a| obs.render(a)).transpose()?;
            let pattern = fact
                .pattern(arg.as_deref())
                .map_err(|e| Outcome::fail(e.to_string()))?;
            let found = pattern.exists(obs.snapshot(who)?);
            Outcome::check(found, || format!("{} not found for {who}", pattern.name()))
        }
        Check::Bound { var } => Outcome::check(obs.bindings.contains(var), || {
            format!("'{var}' was never bound")
        }),
        Check::Decrypts { who, min, max } => {
            let count = obs.snapshot(who)?.decrypt_count();
            let low = min.map_or(true, |m| count >= m);
            let high = max.map_or(true, |m| count <= m);
            Outcome::check(low && high, || {
                format!("{who} decrypted {count}, expected {}", bounds(*min, *max))
            })
        }
        Check::DecryptsSince {
            who,
            checkpoint,
            max_increase,
        } => {
            let cp = obs.checkpoint(checkpoint)?;
            let before = cp.decrypts.get(who.as_str()).copied().unwrap_or(0);
            let now = obs.snapshot(who)?.decrypt_count();
            let increase = now.saturating_sub(before);
            Outcome::check(increase <= *max_increase, || {
                format!("{who} decrypted {increase} more since '{checkpoint}' ({before} -> {now})")
            })
        }
        Check::Revocation {
            removed,
            retained,
            since,
            scope,
        } => {
            let cp = obs.checkpoint(since)?;
            let messages = obs.sent_after(cp, scope.as_deref());
            if messages.is_empty() {
                return Err(Outcome::fail(format!("no messages were sent after '{since}'")));
            }
            let removed_snap = obs.snapshot(removed)?;
            let mut problems = Vec::new();
            for m in &messages {
                if &m.sender != removed && removed_snap.contains(&m.text) {
                    problems.push(format!("{removed} saw \"{}\"", m.text));
                }
            }
            for member in retained {
                let snap = obs.snapshot(member)?;
                for m in messages.iter().filter(|m| &m.sender != member) {
                    if !snap.contains(&m.text) {
                        problems.push(format!("{member} missed \"{}\"", m.text));
                    }
                }
            }
            Outcome::check(problems.is_empty(), || problems.join("; "))
        }
        Check::Continuity {
            member,
            since,
            scope,
        } => {
            let cp = obs.checkpoint(since)?;
            let messages = obs.sent_after(cp, scope.as_deref());
            if messages.is_empty() {
                return Err(Outcome::fail(format!("no messages were sent after '{since}'")));
            }
            let snap = obs.snapshot(member)?;
            let missed: Vec<_> = messages
                .iter()
                .filter(|m| &m.sender != member && !snap.contains(&m.text))
                .map(|m| format!("\"{}\"", m.text))
                .collect();
            Outcome::check(missed.is_empty(), || {
                format!("{member} missed {}", missed.join(", "))
            })
        }
        Check::All { checks } => {
            let failed: Vec<_> = checks
                .iter()
                .map(|c| evaluate(c, obs))
                .filter(|o| !o.passed)
                .filter_map(|o| o.detail)
                .collect();
            Outcome::check(failed.is_empty(), || failed.join("; "))
        }
        Check::Any { checks } => {
            let outcomes: Vec<_> = checks.iter().map(|c| evaluate(c, obs)).collect();
            let passed = outcomes.iter().any(|o| o.passed);
            Outcome::check(passed, || {
                let details: Vec<_> = outcomes.into_iter().filter_map(|o| o.detail).collect();
                format!("none held: {}", details.join("; "))
            })
        }
    };
    Ok(outcome)
}

fn bounds(min: Option<usize>, max: Option<usize>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("{lo}..={hi}"),
        (Some(lo), None) => format!(">= {lo}"),
        (None, Some(hi)) => format!("<= {hi}"),
        (None, None) => "any".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::Fact;

    struct Fixture {
        snapshots: HashMap<String, Snapshot>,
        messages: Vec<SentMessage>,
        checkpoints: HashMap<String, Checkpoint>,
        bindings: Bindings,
    }

    impl Fixture {
        fn observed(&self) -> Observed<'_> {
            Observed {
                snapshots: &self.snapshots,
                messages: &self.messages,
                checkpoints: &self.checkpoints,
                bindings: &self.bindings,
            }
        }

        fn eval(&self, check: Check) -> Outcome {
            evaluate(&check, &self.observed())
        }
    }

    fn msg(seq: usize, sender: &str, text: &str, scope: Option<&str>) -> SentMessage {
        SentMessage {
            seq,
            sender: sender.into(),
            text: text.into(),
            scope: scope.map(Into::into),
        }
    }

    /// Alice kicks Bob from channel "ch2" after three messages; Charlie stays
    fn kick_fixture() -> Fixture {
        let snapshots = HashMap::from([
            (
                "alice".to_string(),
                Snapshot::new("Successfully removed user\nDecrypted MLS message\nBob reply\n"),
            ),
            (
                "bob".to_string(),
                Snapshot::new(
                    "Decrypted MLS message\nDecrypted MLS message\nBefore kick\nCh1 after kick\n",
                ),
            ),
            (
                "charlie".to_string(),
                Snapshot::new("Before kick\nAfter kick\nCh1 after kick\n"),
            ),
        ]);
        let messages = vec![
            msg(1, "alice", "Before kick", Some("ch2")),
            msg(2, "bob", "Bob reply", Some("ch2")),
            msg(3, "alice", "After kick", Some("ch2")),
            msg(4, "alice", "Ch1 after kick", Some("ch1")),
        ];
        let checkpoints = HashMap::from([(
            "kicked".to_string(),
            Checkpoint {
                messages: 2,
                decrypts: HashMap::from([("bob".to_string(), 2)]),
            },
        )]);
        let mut bindings = Bindings::new();
        bindings.bind("space_id", "0123456789abcdef");
        Fixture {
            snapshots,
            messages,
            checkpoints,
            bindings,
        }
    }

    #[test]
    fn test_contains_and_not_contains() {
        let f = kick_fixture();
        assert!(f.eval(Check::Contains { who: "bob".into(), text: "Before kick".into() }).passed);
        let outcome = f.eval(Check::NotContains { who: "charlie".into(), text: "After kick".into() });
        assert!(!outcome.passed);
        assert_eq!(outcome.detail.as_deref(), Some("charlie saw \"After kick\""));
    }

    #[test]
    fn test_revocation_scoped_to_channel() {
        let f = kick_fixture();
        let outcome = f.eval(Check::Revocation {
            removed: "bob".into(),
            retained: vec!["charlie".into()],
            since: "kicked".into(),
            scope: Some("ch2".into()),
        });
        assert!(outcome.passed, "{outcome:?}");

        // Unscoped, Bob legitimately seeing the ch1 message breaks revocation
        let outcome = f.eval(Check::Revocation {
            removed: "bob".into(),
            retained: vec!["charlie".into()],
            since: "kicked".into(),
            scope: None,
        });
        assert!(!outcome.passed);
    }

    #[test]
    fn test_revocation_requires_retained_members_to_receive() {
        let f = kick_fixture();
        // Alice sent everything after the checkpoint, so nothing is expected of her
        let outcome = f.eval(Check::Revocation {
            removed: "bob".into(),
            retained: vec!["alice".into(), "charlie".into()],
            since: "kicked".into(),
            scope: Some("ch2".into()),
        });
        assert!(outcome.passed, "{outcome:?}");
    }

    #[test]
    fn test_revocation_without_messages_fails() {
        let mut f = kick_fixture();
        f.messages.truncate(2);
        let outcome = f.eval(Check::Revocation {
            removed: "bob".into(),
            retained: vec!["charlie".into()],
            since: "kicked".into(),
            scope: None,
        });
        assert!(!outcome.passed);
    }

    #[test]
    fn test_continuity_in_sibling_scope() {
        let f = kick_fixture();
        let ok = f.eval(Check::Continuity {
            member: "bob".into(),
            since: "kicked".into(),
            scope: Some("ch1".into()),
        });
        assert!(ok.passed);
        let broken = f.eval(Check::Continuity {
            member: "bob".into(),
            since: "kicked".into(),
            scope: Some("ch2".into()),
        });
        assert!(!broken.passed);
    }

    #[test]
    fn test_decrypt_counts() {
        let f = kick_fixture();
        assert!(f.eval(Check::Decrypts { who: "bob".into(), min: Some(2), max: Some(4) }).passed);
        let outcome = f.eval(Check::Decrypts { who: "charlie".into(), min: Some(1), max: None });
        assert_eq!(outcome.detail.as_deref(), Some("charlie decrypted 0, expected >= 1"));
        assert!(f
            .eval(Check::DecryptsSince {
                who: "bob".into(),
                checkpoint: "kicked".into(),
                max_increase: 0,
            })
            .passed);
    }

    #[test]
    fn test_missing_checkpoint_fails_instead_of_panicking() {
        let f = kick_fixture();
        let outcome = f.eval(Check::DecryptsSince {
            who: "bob".into(),
            checkpoint: "never".into(),
            max_increase: 0,
        });
        assert!(!outcome.passed);
    }

    #[test]
    fn test_fact_and_templated_matches() {
        let f = kick_fixture();
        assert!(f
            .eval(Check::Fact {
                who: "alice".into(),
                fact: Fact::RemovalConfirmation,
                arg: None,
            })
            .passed);
        let outcome = f.eval(Check::Matches {
            who: "alice".into(),
            pattern: "{missing}".into(),
        });
        assert!(!outcome.passed);
        assert!(f.eval(Check::Bound { var: "space_id".into() }).passed);
    }

    #[test]
    fn test_all_and_any() {
        let f = kick_fixture();
        let yes = || Check::Contains { who: "bob".into(), text: "Before kick".into() };
        let no = || Check::Contains { who: "bob".into(), text: "After kick".into() };
        assert!(f.eval(Check::Any { checks: vec![no(), yes()] }).passed);
        assert!(!f.eval(Check::All { checks: vec![yes(), no()] }).passed);
        assert!(f.eval(Check::All { checks: vec![yes(), yes()] }).passed);
    }
}
