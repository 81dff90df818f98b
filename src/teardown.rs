//! Guaranteed engine shutdown

use std::time::Duration;

use serde::Serialize;

use crate::client::{ClientHandle, ClientState};
use crate::common::Error;

/// How each client went down
#[derive(Debug, Default, Clone, Serialize)]
pub struct TeardownReport {
    /// Exited within the grace period
    pub graceful: Vec<String>,
    /// Still alive after the grace period and killed
    pub forced: Vec<String>,
    /// Already gone before teardown started
    pub crashed: Vec<String>,
}

impl TeardownReport {
    pub fn total(&self) -> usize {
        self.graceful.len() + self.forced.len() + self.crashed.len()
    }
}

/// Stops every client, escalating to a kill after a bounded wait
#[derive(Debug, Clone)]
pub struct TeardownManager {
    grace: Duration,
}

impl TeardownManager {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Stop all clients
    ///
    /// Every client is asked to stop before any is waited on, so the grace
    /// period is shared rather than paid once per client. Timeouts are
    /// never surfaced; they become forced kills.
    pub async fn teardown_all(&self, clients: &mut [ClientHandle]) -> TeardownReport {
        let mut report = TeardownReport::default();
        let mut pending = Vec::new();

        for (i, client) in clients.iter_mut().enumerate() {
            match client.poll_state() {
                ClientState::Crashed | ClientState::Stopped => {
                    report.crashed.push(client.name().to_string());
                }
                _ => {
                    client.request_stop();
                    pending.push(i);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        for i in pending {
            let client = &mut clients[i];
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match client.wait_exit(remaining).await {
                Ok(()) => {
                    tracing::info!(client = %client.name(), "Engine stopped");
                    report.graceful.push(client.name().to_string());
                }
                Err(e) => {
                    if matches!(e, Error::TeardownTimeout { .. }) {
                        tracing::warn!("{e}, killing");
                    } else {
                        tracing::warn!(client = %client.name(), "Waiting for exit failed: {e}");
                    }
                    if let Err(e) = client.kill().await {
                        tracing::warn!(client = %client.name(), "Kill failed: {e}");
                    }
                    report.forced.push(client.name().to_string());
                }
            }
        }
        report
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::client::ClientSpec;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) -> ClientSpec {
        use std::os::unix::fs::PermissionsExt;
        let exe = dir.join(format!("{name}.sh"));
        std::fs::write(&exe, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        ClientSpec {
            name: name.to_string(),
            executable: exe,
            account: dir.join(format!("{name}.key")),
            port: 0,
            log: dir.join(format!("{name}.log")),
            work_dir: dir.to_path_buf(),
            extra_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_graceful_forced_and_crashed_are_told_apart() {
        let tmp = tempfile::tempdir().unwrap();
        let warmup = Duration::from_millis(200);

        let polite = ClientHandle::start(script(tmp.path(), "polite", "exec cat"), warmup)
            .await
            .unwrap();
        let stubborn = ClientHandle::start(
            script(tmp.path(), "stubborn", "trap '' TERM\nwhile true; do sleep 1; done"),
            warmup,
        )
        .await
        .unwrap();
        let mut gone = ClientHandle::spawn(script(tmp.path(), "gone", "exit 3")).unwrap();
        tokio::time::sleep(warmup).await;
        assert!(gone.confirm_running().is_err());

        let mut clients = vec![polite, stubborn, gone];
        let report = TeardownManager::new(Duration::from_millis(500))
            .teardown_all(&mut clients)
            .await;

        assert_eq!(report.graceful, vec!["polite"]);
        assert_eq!(report.forced, vec!["stubborn"]);
        assert_eq!(report.crashed, vec!["gone"]);
        assert!(clients.iter().all(|c| c.state().is_terminal()));
    }
}
