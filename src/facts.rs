//! Named log fact patterns and extraction
//!
//! Every piece of information the runner pulls out of an engine's output
//! goes through one of the patterns registered here, so a change in the
//! engine's log format only needs to be followed in one place.
//!
//! Extraction always runs over a full [`Snapshot`] of a client's captured
//! output. The first match in the buffer wins.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// A semantic fact the engine reports in its log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fact {
    /// Short (16 hex) id of a created space, optionally for a given space name
    SpaceId,
    /// Full (64 hex) id of the current space from `context`
    FullSpaceId,
    /// Invite token from `invite create`
    InviteCode,
    /// libp2p peer id from `network`
    PeerId,
    /// 64 hex user id from `whoami`
    UserId,
    /// Emitted once per successfully decrypted message
    DecryptMarker,
    /// `<16-hex> - <channel-name>` row from `channels` (argument required)
    ChannelRow,
    /// `<16-hex> - "<title>"` row from `threads` (argument required)
    ThreadRow,
    /// Any of the owner-side confirmations that a removal rotated keys
    RemovalConfirmation,
    /// `Created thread: <title> (<16-hex>)`
    ThreadCreated,
    /// `Created channel: <name> (<16-hex>)`
    ChannelCreated,
    /// Space created with a space-level MLS group
    MlsSpace,
    /// Space created without a space-level MLS group
    LightweightSpace,
    /// Engine refused an operation for lack of permission
    PermissionDenied,
}

impl Fact {
    /// Every registered fact, in registry order
    pub const ALL: [Fact; 14] = [
        Fact::SpaceId,
        Fact::FullSpaceId,
        Fact::InviteCode,
        Fact::PeerId,
        Fact::UserId,
        Fact::DecryptMarker,
        Fact::ChannelRow,
        Fact::ThreadRow,
        Fact::RemovalConfirmation,
        Fact::ThreadCreated,
        Fact::ChannelCreated,
        Fact::MlsSpace,
        Fact::LightweightSpace,
        Fact::PermissionDenied,
    ];

    /// Registry name, as used in scenario files
    pub fn name(self) -> &'static str {
        match self {
            Fact::SpaceId => "space_id",
            Fact::FullSpaceId => "full_space_id",
            Fact::InviteCode => "invite_code",
            Fact::PeerId => "peer_id",
            Fact::UserId => "user_id",
            Fact::DecryptMarker => "decrypt_marker",
            Fact::ChannelRow => "channel_row",
            Fact::ThreadRow => "thread_row",
            Fact::RemovalConfirmation => "removal_confirmation",
            Fact::ThreadCreated => "thread_created",
            Fact::ChannelCreated => "channel_created",
            Fact::MlsSpace => "mls_space",
            Fact::LightweightSpace => "lightweight_space",
            Fact::PermissionDenied => "permission_denied",
        }
    }

    /// Look a fact up by registry name
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| Error::UnknownFact(name.to_string()))
    }

    /// Whether the pattern needs a name/title argument
    pub fn requires_arg(self) -> bool {
        matches!(self, Fact::ChannelRow | Fact::ThreadRow)
    }

    /// Regex source for this fact, with `arg` substituted where the pattern takes one
    ///
    /// Arguments are matched literally. Facts that take an optional argument
    /// fall back to a lazy wildcard when none is given.
    pub fn source(self, arg: Option<&str>) -> Result<String> {
        if self.requires_arg() && arg.is_none() {
            return Err(Error::InvalidPattern {
                pattern: self.name().to_string(),
                reason: "a channel name or thread title is required".to_string(),
            });
        }
        let arg = arg.map(regex::escape);
        let any = || ".+?".to_string();
        let source = match self {
            Fact::SpaceId => format!(
                r"Created space: {} \(([0-9a-f]{{16}})\)",
                arg.unwrap_or_else(any)
            ),
            Fact::FullSpaceId => r"Space: ([0-9a-f]{64})".to_string(),
            Fact::InviteCode => r"Created invite code: (\w+)".to_string(),
            Fact::PeerId => r"Peer ID: (\w+)".to_string(),
            Fact::UserId => r"User ID: ([0-9a-f]{64})".to_string(),
            Fact::DecryptMarker => r"Decrypted MLS message".to_string(),
            Fact::ChannelRow => format!(r"([0-9a-f]{{16}})\s+-\s+{}", arg.unwrap_or_else(any)),
            Fact::ThreadRow => format!(
                r#"([0-9a-f]{{16}})\s+-\s+"?{}"?"#,
                arg.unwrap_or_else(any)
            ),
            Fact::RemovalConfirmation => {
                r"Successfully removed user|MLS keys rotated|(?i:removed member can't decrypt)"
                    .to_string()
            }
            Fact::ThreadCreated => format!(
                r"Created thread: {} \(([0-9a-f]{{16}})\)",
                arg.unwrap_or_else(any)
            ),
            Fact::ChannelCreated => format!(
                r"Created channel: {} \(([0-9a-f]{{16}})\)",
                arg.unwrap_or_else(any)
            ),
            Fact::MlsSpace => r"Created MLS-encrypted space|space-level encryption enabled".to_string(),
            Fact::LightweightSpace => r"LIGHTWEIGHT space|no space-level MLS group".to_string(),
            Fact::PermissionDenied => r"Permission denied: ".to_string(),
        };
        Ok(source)
    }

    /// Compile the pattern for this fact
    pub fn pattern(self, arg: Option<&str>) -> Result<Pattern> {
        let source = self.source(arg)?;
        let label = match arg {
            Some(a) => format!("{}({})", self.name(), a),
            None => self.name().to_string(),
        };
        Pattern::compile(label, &source)
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A compiled, named pattern with at most one capture group
#[derive(Debug, Clone)]
pub struct Pattern {
    name: String,
    regex: Regex,
}

impl Pattern {
    /// Compile an ad-hoc pattern supplied by a scenario
    pub fn custom(source: &str) -> Result<Self> {
        Self::compile(source.to_string(), source)
    }

    fn compile(name: String, source: &str) -> Result<Self> {
        let regex = Regex::new(source).map_err(|e| Error::InvalidPattern {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { name, regex })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// First capture-group match in the snapshot, or the whole match when the
    /// pattern has no group
    pub fn extract_one(&self, snapshot: &Snapshot) -> Option<String> {
        let caps = self.regex.captures(snapshot.as_str())?;
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
    }

    /// Whether the pattern occurs anywhere in the snapshot
    pub fn exists(&self, snapshot: &Snapshot) -> bool {
        self.regex.is_match(snapshot.as_str())
    }

    /// Number of non-overlapping occurrences in the snapshot
    pub fn count(&self, snapshot: &Snapshot) -> usize {
        self.regex.find_iter(snapshot.as_str()).count()
    }
}

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid static regex")
    })
}

fn decrypt_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"Decrypted MLS message").expect("valid static regex")
    })
}

/// Immutable copy of a client's captured output at one instant
///
/// Terminal color sequences are stripped so patterns see plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    text: String,
}

impl Snapshot {
    pub fn new(raw: &str) -> Self {
        Self {
            text: ansi_escape().replace_all(raw, "").into_owned(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Plain substring containment, used for message text checks
    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }

    /// Number of decrypt markers seen so far
    pub fn decrypt_count(&self) -> usize {
        decrypt_marker().find_iter(&self.text).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_LOG: &str = "\
✓ Created space: kick-test (0123456789abcdef)
Current Context:
  Space: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
✓ Created invite code: Xy12ab34
Peer ID: 12D3KooWAbCdEf
Channels (2):
  → 1111111111111111 - general
    2222222222222222 - private
Threads (1):
    3333333333333333 - \"Kick Test\"
✓ Created space: second (fedcba9876543210)
  Space: bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
Decrypted MLS message
Decrypted MLS message
";

    #[test]
    fn test_canonical_extractions() {
        let snap = Snapshot::new(ALICE_LOG);
        let get = |fact: Fact, arg: Option<&str>| fact.pattern(arg).unwrap().extract_one(&snap);

        assert_eq!(get(Fact::SpaceId, Some("kick-test")).as_deref(), Some("0123456789abcdef"));
        assert_eq!(get(Fact::SpaceId, Some("second")).as_deref(), Some("fedcba9876543210"));
        assert_eq!(get(Fact::InviteCode, None).as_deref(), Some("Xy12ab34"));
        assert_eq!(get(Fact::PeerId, None).as_deref(), Some("12D3KooWAbCdEf"));
        assert_eq!(get(Fact::ChannelRow, Some("private")).as_deref(), Some("2222222222222222"));
        assert_eq!(get(Fact::ThreadRow, Some("Kick Test")).as_deref(), Some("3333333333333333"));
        assert_eq!(get(Fact::UserId, None), None);
    }

    #[test]
    fn test_first_match_wins() {
        let snap = Snapshot::new(ALICE_LOG);
        let full = Fact::FullSpaceId.pattern(None).unwrap().extract_one(&snap).unwrap();
        assert!(full.starts_with('a'));

        let any_space = Fact::SpaceId.pattern(None).unwrap().extract_one(&snap);
        assert_eq!(any_space.as_deref(), Some("0123456789abcdef"));
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let snap = Snapshot::new(ALICE_LOG);
        for fact in [Fact::SpaceId, Fact::InviteCode, Fact::PeerId, Fact::UserId] {
            let p = fact.pattern(None).unwrap();
            assert_eq!(p.extract_one(&snap), p.extract_one(&snap));
            assert_eq!(p.exists(&snap), p.exists(&snap));
        }
    }

    #[test]
    fn test_decrypt_marker_count() {
        let snap = Snapshot::new(ALICE_LOG);
        assert_eq!(snap.decrypt_count(), 2);
        let p = Fact::DecryptMarker.pattern(None).unwrap();
        assert_eq!(p.count(&snap), 2);
        assert_eq!(p.extract_one(&snap).as_deref(), Some("Decrypted MLS message"));
    }

    #[test]
    fn test_removal_confirmation_variants() {
        let p = Fact::RemovalConfirmation.pattern(None).unwrap();
        assert!(p.exists(&Snapshot::new("✓ Successfully removed user abc")));
        assert!(p.exists(&Snapshot::new("MLS keys rotated (epoch 3)")));
        assert!(p.exists(&Snapshot::new("Note: Removed member CAN'T DECRYPT new messages")));
        assert!(!p.exists(&Snapshot::new("Removing user abc")));
    }

    #[test]
    fn test_permission_denied_ignores_input_errors() {
        let p = Fact::PermissionDenied.pattern(None).unwrap();
        assert!(p.exists(&Snapshot::new(
            "✗ Permission denied: only space admins can remove members"
        )));
        assert!(p.exists(&Snapshot::new(
            "Error: Permission denied: Insufficient permissions to create invites"
        )));
        assert!(!p.exists(&Snapshot::new("✗ Channel name cannot be empty")));
        assert!(!p.exists(&Snapshot::new("✗ Thread title cannot be empty")));
        assert!(!p.exists(&Snapshot::new("Usage: kick <user_id> (not allowed without a space)")));
    }

    #[test]
    fn test_channel_row_escapes_argument() {
        let snap = Snapshot::new("  1111111111111111 - c++ talk\n");
        let p = Fact::ChannelRow.pattern(Some("c++ talk")).unwrap();
        assert_eq!(p.extract_one(&snap).as_deref(), Some("1111111111111111"));
        assert!(Fact::ChannelRow.pattern(None).is_err());
    }

    #[test]
    fn test_ansi_sequences_are_stripped() {
        let snap = Snapshot::new("\x1b[32m✓\x1b[0m Created invite code: \x1b[93mQQ77\x1b[0m\n");
        let p = Fact::InviteCode.pattern(None).unwrap();
        assert_eq!(p.extract_one(&snap).as_deref(), Some("QQ77"));
    }

    #[test]
    fn test_registry_names_round_trip() {
        for fact in Fact::ALL {
            assert_eq!(Fact::from_name(fact.name()).unwrap(), fact);
        }
        assert!(Fact::from_name("nope").is_err());
    }
}
