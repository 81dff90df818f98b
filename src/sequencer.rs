//! Scripted command issuance with settle waits
//!
//! The engine gives no completion signal for anything it does, so every
//! command is followed by a wait long enough for its asynchronous effects
//! to become visible in the logs. How long depends on what kind of
//! operation it was, which is what [`SettlePolicy`] encodes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientHandle;
use crate::common::config::SettleConfig;
use crate::facts::Pattern;

/// Operation classes with distinct asynchronous completion times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Local state query or simple CLI operation (2-3s)
    #[default]
    Query,
    /// Connect, join or key material publication (3-5s)
    Network,
    /// Membership add/kick, which rotates the group epoch (5-7s + follow-up)
    Membership,
    /// Message fan-out to other participants (5-15s)
    Propagation,
}

/// Settle durations keyed by operation class
#[derive(Debug, Clone)]
pub struct SettlePolicy {
    config: SettleConfig,
}

impl SettlePolicy {
    pub fn new(config: SettleConfig) -> Self {
        Self { config }
    }

    /// Default settle for a class, scaled
    ///
    /// Propagation uses the two-participant figure here; see [`Self::propagation`].
    pub fn settle(&self, class: OperationClass) -> Duration {
        let secs = match class {
            OperationClass::Query => self.config.query_secs,
            OperationClass::Network => self.config.network_secs,
            OperationClass::Membership => self.config.membership_secs,
            OperationClass::Propagation => self.config.propagation_base_secs,
        };
        self.scaled(secs)
    }

    /// Supplementary wait after the settle, for classes whose side effects
    /// keep arriving after the command returns
    pub fn followup(&self, class: OperationClass) -> Option<Duration> {
        match class {
            OperationClass::Membership => Some(self.scaled(self.config.membership_followup_secs)),
            _ => None,
        }
    }

    /// Propagation wait for a scenario with `participants` engines
    pub fn propagation(&self, participants: usize) -> Duration {
        let extra = participants.saturating_sub(2) as f64;
        let secs = self.config.propagation_base_secs
            + extra * self.config.propagation_per_participant_secs;
        self.scaled(secs.min(self.config.propagation_max_secs))
    }

    /// Apply the global time scale to an explicit number of seconds
    pub fn scaled(&self, secs: f64) -> Duration {
        Duration::from_secs_f64((secs * self.config.time_scale).max(0.0))
    }
}

/// Outcome of one scripted command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the engine and settled
    Delivered,
    /// Not written; the reason is recorded and the scenario carries on
    Failed { reason: String },
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// Issues commands to clients strictly one at a time
#[derive(Debug, Default)]
pub struct CommandSequencer {
    issued: usize,
}

impl CommandSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands written so far
    pub fn issued(&self) -> usize {
        self.issued
    }

    /// Send `command` to `client`, then hold the scenario for `settle`
    ///
    /// A failed write is returned as [`Delivery::Failed`] rather than an
    /// error, and skips the settle since nothing was started.
    pub async fn run(&mut self, client: &mut ClientHandle, command: &str, settle: Duration) -> Delivery {
        if let Err(e) = client.send(command).await {
            tracing::warn!(client = %client.name(), command = %command, "{e}");
            return Delivery::Failed {
                reason: e.to_string(),
            };
        }
        self.issued += 1;
        tokio::time::sleep(settle).await;
        Delivery::Delivered
    }

    /// Poll `client`'s output until `pattern` appears or `timeout` elapses
    ///
    /// Returns whether the pattern was seen. Gives up early when the engine
    /// exits, since nothing more will be written.
    pub async fn await_match(
        &self,
        client: &mut ClientHandle,
        pattern: &Pattern,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match client.snapshot() {
                Ok(snapshot) if pattern.exists(&snapshot) => return true,
                Ok(_) => {}
                Err(e) => tracing::debug!(client = %client.name(), "Snapshot failed: {e}"),
            }
            if !client.poll_state().is_live() || tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(time_scale: f64) -> SettlePolicy {
        SettlePolicy::new(SettleConfig {
            time_scale,
            ..SettleConfig::default()
        })
    }

    #[test]
    fn test_class_defaults_fall_in_calibrated_ranges() {
        let p = policy(1.0);
        let secs = |c| p.settle(c).as_secs_f64();
        assert!((2.0..=3.0).contains(&secs(OperationClass::Query)));
        assert!((3.0..=5.0).contains(&secs(OperationClass::Network)));
        assert!((5.0..=7.0).contains(&secs(OperationClass::Membership)));
        let followup = p.followup(OperationClass::Membership).unwrap().as_secs_f64();
        assert!((4.0..=10.0).contains(&followup));
        assert!(p.followup(OperationClass::Query).is_none());
    }

    #[test]
    fn test_propagation_scales_with_participants_and_is_capped() {
        let p = policy(1.0);
        assert_eq!(p.propagation(2), Duration::from_secs(5));
        assert_eq!(p.propagation(3), Duration::from_secs_f64(7.5));
        assert!(p.propagation(4) > p.propagation(3));
        assert_eq!(p.propagation(50), Duration::from_secs(15));
        // A single participant still waits the base amount
        assert_eq!(p.propagation(1), Duration::from_secs(5));
    }

    #[test]
    fn test_time_scale_applies_everywhere() {
        let p = policy(0.1);
        assert_eq!(p.settle(OperationClass::Query), Duration::from_secs_f64(0.2));
        assert_eq!(p.scaled(10.0), Duration::from_secs(1));
        assert_eq!(p.propagation(2), Duration::from_secs_f64(0.5));
    }

    #[test]
    fn test_class_names_in_yaml() {
        let class: OperationClass = serde_yaml::from_str("membership").unwrap();
        assert_eq!(class, OperationClass::Membership);
    }
}
