use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use upkeep_core::{
    Clock, LockRecord, ProjectLayout, SystemClock, UpdateError, DEFAULT_LOCK_MAX_AGE_SECS,
};

/// PID-stamped lock file serializing update runs across processes.
pub struct LockManager {
    path: PathBuf,
    max_age_secs: u64,
    clock: Arc<dyn Clock>,
    held: Option<LockRecord>,
}

enum LockFile {
    Missing,
    Record(LockRecord),
    Unparseable,
}

impl LockManager {
    pub fn new(layout: &ProjectLayout) -> Self {
        Self {
            path: layout.lock_path(),
            max_age_secs: DEFAULT_LOCK_MAX_AGE_SECS,
            clock: Arc::new(SystemClock),
            held: None,
        }
    }

    pub fn with_max_age(mut self, max_age_secs: u64) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn acquire(&mut self) -> Result<LockRecord, UpdateError> {
        if self.held.is_some() {
            return Err(UpdateError::Other(anyhow::anyhow!(
                "update lock already held by this process: {}",
                self.path.display()
            )));
        }

        match self.read_lock_file()? {
            LockFile::Missing => {}
            LockFile::Record(existing) => {
                if self.record_is_valid(&existing) {
                    return Err(self.contention(existing));
                }
                warn!(
                    pid = existing.pid,
                    hostname = %existing.hostname,
                    age_secs = existing.age_secs(self.clock.now_unix()),
                    "replacing stale update lock"
                );
                remove_lock_file(&self.path)?;
            }
            LockFile::Unparseable => {
                warn!(path = %self.path.display(), "replacing unparseable update lock");
                remove_lock_file(&self.path)?;
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let record = LockRecord {
            pid: std::process::id(),
            timestamp: self.clock.now_unix(),
            hostname: local_hostname(),
        };
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let existing = self.current_holder()?.unwrap_or_else(|| LockRecord {
                    pid: 0,
                    timestamp: self.clock.now_unix(),
                    hostname: "unknown".to_string(),
                });
                return Err(self.contention(existing));
            }
            Err(err) => {
                return Err(UpdateError::Other(anyhow::Error::new(err).context(format!(
                    "failed to claim update lock: {}",
                    self.path.display()
                ))));
            }
        };

        let content = serde_json::to_string(&record).context("failed serializing lock record")?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.flush())
            .with_context(|| format!("failed to write update lock: {}", self.path.display()))?;

        self.held = Some(record.clone());
        info!(pid = record.pid, path = %self.path.display(), "update lock acquired");
        Ok(record)
    }

    /// Deletes the lock file if it still carries the record this instance wrote.
    /// Safe to call repeatedly.
    pub fn release(&mut self) -> Result<()> {
        let Some(ours) = self.held.take() else {
            return Ok(());
        };
        match self.read_lock_file()? {
            LockFile::Record(current) if current == ours => {
                remove_lock_file(&self.path)?;
                info!(path = %self.path.display(), "update lock released");
            }
            LockFile::Record(current) => {
                warn!(
                    pid = current.pid,
                    hostname = %current.hostname,
                    "update lock was taken over by another run; leaving it in place"
                );
            }
            LockFile::Missing | LockFile::Unparseable => {
                debug!(path = %self.path.display(), "update lock already gone");
            }
        }
        Ok(())
    }

    pub fn is_locked(&self) -> Result<bool> {
        Ok(self
            .current_holder()?
            .map(|record| self.record_is_valid(&record))
            .unwrap_or(false))
    }

    /// Parsed lock record, if a readable one exists. Unparseable files read as absent.
    pub fn current_holder(&self) -> Result<Option<LockRecord>> {
        Ok(match self.read_lock_file()? {
            LockFile::Record(record) => Some(record),
            LockFile::Missing | LockFile::Unparseable => None,
        })
    }

    fn read_lock_file(&self) -> Result<LockFile> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LockFile::Missing),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read update lock: {}", self.path.display())
                });
            }
        };
        match serde_json::from_str::<LockRecord>(&raw) {
            Ok(record) => Ok(LockFile::Record(record)),
            Err(err) => {
                debug!(error = %err, path = %self.path.display(), "unparseable update lock");
                Ok(LockFile::Unparseable)
            }
        }
    }

    /// Removes the lock file regardless of holder. Returns whether a file was removed.
    pub fn force_release(&mut self) -> Result<bool> {
        let existed = self.path.exists();
        remove_lock_file(&self.path)?;
        self.held = None;
        if existed {
            warn!(path = %self.path.display(), "update lock force-released");
        }
        Ok(existed)
    }

    pub fn record_is_valid(&self, record: &LockRecord) -> bool {
        process_is_alive(record.pid) && record.age_secs(self.clock.now_unix()) < self.max_age_secs
    }

    fn contention(&self, record: LockRecord) -> UpdateError {
        UpdateError::LockContention {
            age_secs: record.age_secs(self.clock.now_unix()),
            pid: record.pid,
            hostname: record.hostname,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if self.held.is_some() {
            if let Err(err) = self.release() {
                warn!(error = %err, "failed to release update lock on drop");
            }
        }
    }
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove update lock: {}", path.display()))
        }
    }
}

pub fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    pid_is_running(pid)
}

#[cfg(target_os = "linux")]
fn pid_is_running(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pid_is_running(pid: u32) -> bool {
    use std::process::{Command, Stdio};

    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn pid_is_running(pid: u32) -> bool {
    use std::process::Command;

    let Ok(output) = Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
        .output()
    else {
        return false;
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    output.status.success() && stdout.contains(&format!(",\"{pid}\""))
}

#[cfg(not(any(unix, windows)))]
fn pid_is_running(_pid: u32) -> bool {
    true
}

pub fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    for candidate in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(name) = fs::read_to_string(candidate) {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "unknown".to_string()
}
