//! Engine process ownership
//!
//! A [`ClientHandle`] spawns one engine instance, feeds it line commands on
//! stdin and sends its merged stdout/stderr to a log file in the run
//! directory. The log file is the captured-output buffer: it only grows,
//! survives the process, and is what fact extraction reads.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use crate::common::{Error, Result};
use crate::facts::Snapshot;

use super::ClientState;

/// Everything needed to launch one engine instance
#[derive(Debug, Clone)]
pub struct ClientSpec {
    /// Identity label (participant name)
    pub name: String,
    /// Engine executable
    pub executable: PathBuf,
    /// Credential file passed as `--account`
    pub account: PathBuf,
    /// Listen port passed as `--port`
    pub port: u16,
    /// Captured output sink
    pub log: PathBuf,
    /// Working directory for the process
    pub work_dir: PathBuf,
    /// Extra engine arguments
    pub extra_args: Vec<String>,
}

/// One running (or formerly running) engine instance
pub struct ClientHandle {
    name: String,
    port: u16,
    account: PathBuf,
    log: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    state: ClientState,
    exit_code: Option<i32>,
}

impl ClientHandle {
    /// Spawn the engine and wait out the warm-up interval
    ///
    /// Returns a client in the `Running` state, or `ClientCrashed` if the
    /// process died during warm-up.
    pub async fn start(spec: ClientSpec, warmup: Duration) -> Result<Self> {
        let mut client = Self::spawn(spec)?;
        tokio::time::sleep(warmup).await;
        client.confirm_running()?;
        Ok(client)
    }

    /// Spawn the engine without waiting; the client stays `Starting`
    pub fn spawn(spec: ClientSpec) -> Result<Self> {
        let sink = File::create(&spec.log).map_err(|e| {
            Error::start_failed(
                &spec.name,
                format!("cannot create log {}: {}", spec.log.display(), e),
            )
        })?;
        let sink_err = sink
            .try_clone()
            .map_err(|e| Error::start_failed(&spec.name, e.to_string()))?;

        let mut cmd = Command::new(&spec.executable);
        cmd.arg("--account")
            .arg(&spec.account)
            .arg("--port")
            .arg(spec.port.to_string())
            .args(&spec.extra_args)
            .current_dir(&spec.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::from(sink_err))
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::start_failed(
                &spec.name,
                format!("failed to start {}: {}", spec.executable.display(), e),
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::start_failed(&spec.name, "failed to get engine stdin"))?;

        tracing::info!(
            client = %spec.name,
            port = spec.port,
            pid = child.id(),
            "Spawned engine"
        );

        Ok(Self {
            name: spec.name,
            port: spec.port,
            account: spec.account,
            log: spec.log,
            child,
            stdin: Some(stdin),
            state: ClientState::Starting,
            exit_code: None,
        })
    }

    /// Move from `Starting` to `Running` once warm-up is over
    pub fn confirm_running(&mut self) -> Result<()> {
        match self.poll_state() {
            ClientState::Starting => {
                self.transition(ClientState::Running);
                Ok(())
            }
            ClientState::Running => Ok(()),
            _ => Err(Error::ClientCrashed {
                client: self.name.clone(),
                code: self.exit_code,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn account(&self) -> &Path {
        &self.account
    }

    pub fn log_path(&self) -> &Path {
        &self.log
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Last known state, without touching the process
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Refresh the state from the process and return it
    ///
    /// A live client whose process has exited becomes `Crashed`.
    pub fn poll_state(&mut self) -> ClientState {
        if !self.state.is_terminal() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = status.code();
                match self.state {
                    ClientState::Stopping => self.transition(ClientState::Stopped),
                    _ => {
                        tracing::warn!(
                            client = %self.name,
                            code = ?self.exit_code,
                            "Engine exited unexpectedly"
                        );
                        self.transition(ClientState::Crashed);
                    }
                }
            }
        }
        self.state
    }

    /// Write one command line to the engine's stdin
    pub async fn send(&mut self, line: &str) -> Result<()> {
        match self.poll_state() {
            ClientState::Running => {}
            state => {
                return Err(Error::communication(
                    &self.name,
                    format!("engine is {state}"),
                ))
            }
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::communication(&self.name, "stdin already closed"))?;

        let mut payload = line.trim_end_matches(['\r', '\n']).to_string();
        payload.push('\n');

        let written = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            // A broken pipe usually means the process just went away
            self.poll_state();
            return Err(Error::communication(&self.name, e.to_string()));
        }
        tracing::debug!(client = %self.name, command = %line, "Sent command");
        Ok(())
    }

    /// Read the full captured output as it stands right now
    pub fn snapshot(&self) -> Result<Snapshot> {
        let bytes = std::fs::read(&self.log).map_err(|e| Error::FileRead {
            path: self.log.display().to_string(),
            error: e.to_string(),
        })?;
        Ok(Snapshot::new(&String::from_utf8_lossy(&bytes)))
    }

    /// Ask the engine to shut down: close stdin and send SIGTERM
    pub fn request_stop(&mut self) {
        if self.poll_state().is_terminal() {
            return;
        }
        self.transition(ClientState::Stopping);
        self.stdin.take();

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal delivery to a pid we spawned and still own
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                tracing::debug!(client = %self.name, "SIGTERM delivery failed");
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    /// Wait for the process to exit, up to `timeout`
    pub async fn wait_exit(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_code = status.code();
                if self.state == ClientState::Stopping {
                    self.transition(ClientState::Stopped);
                } else if self.state.is_live() {
                    self.transition(ClientState::Crashed);
                }
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::TeardownTimeout {
                client: self.name.clone(),
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Force-kill the process and reap it
    pub async fn kill(&mut self) -> Result<()> {
        self.stdin.take();
        if self.poll_state().is_terminal() {
            return Ok(());
        }
        self.child.kill().await?;
        if self.state == ClientState::Stopping {
            self.transition(ClientState::Stopped);
        } else if self.state.is_live() {
            self.transition(ClientState::Stopping);
            self.transition(ClientState::Stopped);
        }
        Ok(())
    }

    fn transition(&mut self, next: ClientState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(client = %self.name, from = %self.state, to = %next, "State change");
            self.state = next;
        } else {
            tracing::trace!(client = %self.name, from = %self.state, to = %next, "Ignored transition");
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        // Best-effort, we can't await in drop
        if !self.state.is_terminal() {
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(dir: &Path, name: &str, executable: &str) -> ClientSpec {
        ClientSpec {
            name: name.to_string(),
            executable: PathBuf::from(executable),
            account: dir.join(format!("{name}.key")),
            port: 0,
            log: dir.join(format!("{name}.log")),
            work_dir: dir.to_path_buf(),
            extra_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_start() {
        let tmp = tempfile::tempdir().unwrap();
        let result = ClientHandle::spawn(spec(tmp.path(), "ghost", "/nonexistent/engine"));
        assert!(matches!(result, Err(Error::ClientStartFailed { .. })));
    }

    #[tokio::test]
    async fn test_exited_process_is_detected_as_crashed() {
        // `true` ignores its arguments and exits immediately
        let tmp = tempfile::tempdir().unwrap();
        let result = ClientHandle::start(
            spec(tmp.path(), "shortlived", "true"),
            Duration::from_millis(300),
        )
        .await;
        assert!(matches!(result, Err(Error::ClientCrashed { .. })));
    }

    #[tokio::test]
    async fn test_send_after_exit_is_communication_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = ClientHandle::spawn(spec(tmp.path(), "shortlived", "true")).unwrap();
        client.transition(ClientState::Running);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = client.send("whoami").await.unwrap_err();
        assert!(matches!(err, Error::CommunicationFailure { .. }));
        assert_eq!(client.state(), ClientState::Crashed);
    }

    /// Write an executable shell script that ignores the engine arguments
    fn script(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-engine.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_output_is_captured_and_stop_is_graceful() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "exec cat");
        let mut client = ClientHandle::start(spec(tmp.path(), "echo", &exe), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(client.state(), ClientState::Running);

        client.send("hello engine").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.snapshot().unwrap().contains("hello engine"));

        client.request_stop();
        client.wait_exit(Duration::from_secs(3)).await.unwrap();
        assert_eq!(client.state(), ClientState::Stopped);

        // The buffer survives the process
        assert!(client.snapshot().unwrap().contains("hello engine"));
    }

    #[tokio::test]
    async fn test_stderr_is_merged_into_the_same_sink() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "echo out-line; echo err-line >&2; exec cat");
        let mut client = ClientHandle::start(spec(tmp.path(), "merged", &exe), Duration::from_millis(200))
            .await
            .unwrap();
        let snap = client.snapshot().unwrap();
        assert!(snap.contains("out-line"));
        assert!(snap.contains("err-line"));
        client.kill().await.unwrap();
        assert_eq!(client.state(), ClientState::Stopped);
    }
}
