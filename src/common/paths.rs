//! Configuration paths and per-run workspace layout
//!
//! Every scenario run gets its own directory under the workspace root.
//! The directory is purged at the start of the run so credential files and
//! engine history from an earlier run never leak into the next one. Run
//! directories and listen ports are claimed with pid lock files so that
//! concurrent invocations never share either.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};

/// Name used for the config directory
const APP_NAME: &str = "spaceway-e2e";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/spaceway-e2e/`
/// - macOS: `~/Library/Application Support/spaceway-e2e/`
/// - Windows: `%APPDATA%\spaceway-e2e\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Turn a scenario name into a directory-safe slug
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("scenario");
    }
    out
}

/// Files belonging to one participant inside a run directory
#[derive(Debug, Clone)]
pub struct ParticipantFiles {
    /// Credential file passed as `--account`
    pub account: PathBuf,
    /// Captured stdout/stderr of the engine
    pub log: PathBuf,
}

/// Exclusive claim on a path, held by this process until dropped
///
/// The lock file holds the owner's pid. A lock whose owner is gone is stale
/// and may be taken over.
#[derive(Debug)]
struct Lock {
    path: PathBuf,
}

impl Lock {
    /// Claim `path`, or `None` if a live process already holds it
    fn try_acquire(path: PathBuf) -> io::Result<Option<Self>> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(Some(Self { path }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let owner = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    // Empty or unreadable means the owner is still writing it
                    match owner {
                        Some(pid) if !process_alive(pid) => {
                            tracing::debug!(lock = %path.display(), pid, "Removing stale lock");
                            let _ = std::fs::remove_file(&path);
                        }
                        _ => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // 0 and negative values address process groups, not one process
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the pid exists
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Lock file name inside a claimed run directory
const RUN_LOCK: &str = ".run.lock";

/// Most directories tried for one scenario before giving up
const MAX_RUN_SLOTS: usize = 64;

/// Isolated working namespace for one scenario run
///
/// The directory stays locked to this run until the value is dropped, so a
/// concurrent run of the same scenario gets `<slug>-2`, `<slug>-3` and so on
/// instead of purging files under live engines.
#[derive(Debug)]
pub struct RunDir {
    root: PathBuf,
    _lock: Lock,
}

impl RunDir {
    /// Claim and purge a run directory for a scenario
    pub fn prepare(workspace_root: &Path, scenario_name: &str) -> io::Result<Self> {
        let base = slug(scenario_name);
        for slot in 1..=MAX_RUN_SLOTS {
            let name = match slot {
                1 => base.clone(),
                n => format!("{base}-{n}"),
            };
            let root = workspace_root.join(name);
            std::fs::create_dir_all(&root)?;
            let Some(lock) = Lock::try_acquire(root.join(RUN_LOCK))? else {
                tracing::debug!(dir = %root.display(), "Run directory in use, trying next");
                continue;
            };
            purge_except(&root, RUN_LOCK)?;
            let root = root.canonicalize()?;
            tracing::debug!(dir = %root.display(), "Prepared run directory");
            return Ok(Self { root, _lock: lock });
        }
        Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            format!("every run directory for '{base}' is in use"),
        ))
    }

    /// Directory the engines run in (their state directories land here)
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Credential and log file locations for a participant
    pub fn participant(&self, name: &str) -> ParticipantFiles {
        let name = slug(name);
        ParticipantFiles {
            account: self.root.join(format!("{name}.key")),
            log: self.root.join(format!("{name}.log")),
        }
    }
}

/// Remove everything in `dir` except the entry called `keep`
fn purge_except(dir: &Path, keep: &str) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == keep {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Machine-wide directory of port reservations
pub fn port_lock_dir() -> PathBuf {
    std::env::temp_dir().join(APP_NAME).join("ports")
}

/// Hands out listen ports for one run
///
/// Each port is reserved with a lock file shared by every invocation on the
/// machine and held until the allocator is dropped, which covers the window
/// between picking a port and the engine binding it. Ports already bound by
/// anything else are skipped.
#[derive(Debug)]
pub struct PortAllocator {
    next: u16,
    lock_dir: PathBuf,
    held: Vec<Lock>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self::with_lock_dir(base, port_lock_dir())
    }

    pub fn with_lock_dir(base: u16, lock_dir: PathBuf) -> Self {
        Self {
            next: base,
            lock_dir,
            held: Vec::new(),
        }
    }

    /// Next free port at or above the cursor, reserved until drop
    pub fn allocate(&mut self) -> io::Result<u16> {
        std::fs::create_dir_all(&self.lock_dir)?;
        while self.next < u16::MAX {
            let candidate = self.next;
            self.next += 1;
            let Some(lock) = Lock::try_acquire(self.lock_dir.join(format!("{candidate}.lock")))?
            else {
                tracing::debug!(port = candidate, "Port reserved by another run, skipping");
                continue;
            };
            if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                self.held.push(lock);
                return Ok(candidate);
            }
            tracing::debug!(port = candidate, "Port in use, skipping");
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free port left for engine instances",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_is_valid() {
        let dir = config_dir();
        assert!(dir.is_some());
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Three Members Kick"), "three-members-kick");
        assert_eq!(slug("channel_kick!"), "channel-kick");
        assert_eq!(slug("***"), "scenario");
    }

    #[test]
    fn test_prepare_purges_previous_run() {
        let tmp = tempfile::tempdir().unwrap();
        let first = RunDir::prepare(tmp.path(), "kick").unwrap();
        std::fs::write(first.participant("alice").account, "stale").unwrap();
        let first_path = first.path().to_path_buf();
        drop(first);

        let second = RunDir::prepare(tmp.path(), "kick").unwrap();
        assert!(!second.participant("alice").account.exists());
        assert_eq!(second.path(), first_path);
    }

    #[test]
    fn test_concurrent_runs_get_separate_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let first = RunDir::prepare(tmp.path(), "kick").unwrap();
        std::fs::write(first.participant("alice").log, "live output").unwrap();

        let second = RunDir::prepare(tmp.path(), "kick").unwrap();
        assert_ne!(first.path(), second.path());
        assert!(second.path().ends_with("kick-2"));
        // The live run's files are untouched
        let kept = std::fs::read_to_string(first.participant("alice").log).unwrap();
        assert_eq!(kept, "live output");
    }

    #[test]
    fn test_stale_run_lock_is_taken_over() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("kick");
        std::fs::create_dir_all(&dir).unwrap();
        // Far above any kernel's pid limit
        std::fs::write(dir.join(RUN_LOCK), i32::MAX.to_string()).unwrap();
        std::fs::write(dir.join("alice.key"), "stale").unwrap();

        let run = RunDir::prepare(tmp.path(), "kick").unwrap();
        assert!(run.path().ends_with("kick"));
        assert!(!run.participant("alice").account.exists());
    }

    #[test]
    fn test_port_allocator_skips_bound_port() {
        let tmp = tempfile::tempdir().unwrap();
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let mut ports = PortAllocator::with_lock_dir(port, tmp.path().to_path_buf());
        let got = ports.allocate().unwrap();
        assert!(got > port);
        let again = ports.allocate().unwrap();
        assert!(again > got);
    }

    #[test]
    fn test_reserved_ports_are_not_handed_out_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let free = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = free.local_addr().unwrap().port();
        drop(free);

        // Two runs starting together from the same base port
        let mut first = PortAllocator::with_lock_dir(base, tmp.path().to_path_buf());
        let mut second = PortAllocator::with_lock_dir(base, tmp.path().to_path_buf());
        let a = first.allocate().unwrap();
        let b = second.allocate().unwrap();
        assert_ne!(a, b);

        // Released once the first run is done
        drop(first);
        let mut third = PortAllocator::with_lock_dir(a, tmp.path().to_path_buf());
        assert_eq!(third.allocate().unwrap(), a);
    }
}
