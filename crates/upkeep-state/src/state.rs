use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use upkeep_core::{
    sha256_file_hex, CacheState, Clock, CommandRunner, CommandSpec, Database, ProjectLayout,
    ProjectSettings, SystemClock, SystemStateSnapshot, DEFAULT_SUBPROCESS_TIMEOUT_SECS,
};

pub const STATE_MAX_AGE_SECS: u64 = 86_400;
pub const DEFAULT_APP_VERSION: &str = "0.0.0";
pub const MIGRATIONS_TABLE: &str = "doctrine_migration_versions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub field: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

pub struct SystemStateManager {
    layout: ProjectLayout,
    settings: ProjectSettings,
    runner: Arc<dyn CommandRunner>,
    database: Option<Arc<dyn Database>>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    current: Mutex<Option<SystemStateSnapshot>>,
    clears: AtomicU64,
}

impl SystemStateManager {
    pub fn new(
        layout: ProjectLayout,
        settings: ProjectSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            layout,
            settings,
            runner,
            database: None,
            clock: Arc::new(SystemClock),
            timeout: Duration::from_secs(DEFAULT_SUBPROCESS_TIMEOUT_SECS),
            current: Mutex::new(None),
            clears: AtomicU64::new(0),
        }
    }

    pub fn with_database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state_path(&self) -> PathBuf {
        self.layout.state_path()
    }

    /// Gathers a snapshot, persists it as the current state and returns it.
    pub fn capture_system_state(&self) -> Result<SystemStateSnapshot> {
        let snapshot = self.inspect_system_state()?;
        self.persist(&snapshot)?;
        *self.current_guard()? = Some(snapshot.clone());
        info!(
            revision = snapshot.source_revision.as_deref().unwrap_or("unknown"),
            schema_version = snapshot.schema_version.as_deref().unwrap_or("unknown"),
            "system state captured"
        );
        Ok(snapshot)
    }

    /// Gathers a snapshot without touching the state file.
    pub fn inspect_system_state(&self) -> Result<SystemStateSnapshot> {
        Ok(SystemStateSnapshot {
            timestamp: self.clock.now_unix(),
            source_revision: self.git_output(&["rev-parse", "HEAD"]),
            source_branch: self.git_output(&["rev-parse", "--abbrev-ref", "HEAD"]),
            dependency_lock_hash: self.dependency_lock_hash(),
            schema_version: self.schema_version(),
            cache_state: self.cache_state()?,
            app_version: self.app_version(),
            runtime_version: self.runtime_version(),
            environment: self.environment(),
        })
    }

    pub fn get_system_state(&self) -> Result<Option<SystemStateSnapshot>> {
        let mut current = self.current_guard()?;
        if current.is_none() {
            *current = self.load()?;
        }
        Ok(current.clone())
    }

    pub fn has_valid_state(&self) -> bool {
        match self.get_system_state() {
            Ok(Some(snapshot)) => snapshot.age_secs(self.clock.now_unix()) < STATE_MAX_AGE_SECS,
            Ok(None) => false,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed loading saved system state");
                false
            }
        }
    }

    pub fn clear_state(&self) -> Result<()> {
        let path = self.state_path();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove state file: {}", path.display()));
            }
        }
        *self.current_guard()? = None;
        self.clears.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), "system state cleared");
        Ok(())
    }

    /// How many times `clear_state` has completed on this manager.
    pub fn clear_count(&self) -> u64 {
        self.clears.load(Ordering::Relaxed)
    }

    pub fn compare_states(
        before: &SystemStateSnapshot,
        after: &SystemStateSnapshot,
    ) -> Vec<StateChange> {
        before
            .identity_fields()
            .into_iter()
            .zip(after.identity_fields())
            .filter(|((_, left), (_, right))| left != right)
            .map(|((field, before), (_, after))| StateChange {
                field: field.to_string(),
                before,
                after,
            })
            .collect()
    }

    pub fn can_rollback_to(&self, state: &SystemStateSnapshot) -> bool {
        let (Some(revision), Some(_)) = (&state.source_revision, &state.schema_version) else {
            return false;
        };
        self.revision_exists(revision)
    }

    pub fn revision_exists(&self, revision: &str) -> bool {
        let target = format!("{revision}^{{commit}}");
        self.git_output_raw(&["cat-file", "-e", &target])
            .map(|output| output.success())
            .unwrap_or(false)
    }

    fn current_guard(&self) -> Result<std::sync::MutexGuard<'_, Option<SystemStateSnapshot>>> {
        self.current
            .lock()
            .map_err(|_| anyhow!("system state cache poisoned"))
    }

    fn persist(&self, snapshot: &SystemStateSnapshot) -> Result<()> {
        let path = self.state_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content =
            serde_json::to_string_pretty(snapshot).context("failed serializing system state")?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write state file: {}", path.display()))
    }

    fn load(&self) -> Result<Option<SystemStateSnapshot>> {
        let path = self.state_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read state file: {}", path.display()));
            }
        };
        let snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing state file: {}", path.display()))?;
        Ok(Some(snapshot))
    }

    fn git_output_raw(&self, args: &[&str]) -> Result<upkeep_core::CommandOutput> {
        let spec = CommandSpec::new(&self.settings.git_binary)
            .args(args.iter().copied())
            .current_dir(self.layout.root())
            .timeout(self.timeout);
        self.runner.run(&spec)
    }

    fn git_output(&self, args: &[&str]) -> Option<String> {
        match self.git_output_raw(args) {
            Ok(output) if output.success() => non_empty(output.stdout_trimmed()),
            Ok(output) => {
                debug!(args = ?args, detail = %output.failure_detail(), "git query failed");
                None
            }
            Err(err) => {
                debug!(args = ?args, error = %err, "git query could not run");
                None
            }
        }
    }

    fn dependency_lock_hash(&self) -> Option<String> {
        let path = self.layout.composer_lock_path();
        if !path.is_file() {
            return None;
        }
        match sha256_file_hex(&path) {
            Ok(hash) => Some(hash),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed hashing dependency lockfile");
                None
            }
        }
    }

    fn schema_version(&self) -> Option<String> {
        match self.schema_version_from_console() {
            Ok(Some(version)) => return Some(version),
            Ok(None) => debug!("migration status output had no recognizable version"),
            Err(err) => debug!(error = %format!("{err:#}"), "migration status command failed"),
        }
        self.schema_version_from_database()
    }

    fn schema_version_from_console(&self) -> Result<Option<String>> {
        let spec = CommandSpec::new(&self.settings.php_binary)
            .arg(&self.settings.console_path)
            .arg("doctrine:migrations:current")
            .arg("--no-interaction")
            .current_dir(self.layout.root())
            .timeout(self.timeout);
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(anyhow!(output.failure_detail()));
        }
        Ok(parse_schema_version(&output.stdout))
    }

    fn schema_version_from_database(&self) -> Option<String> {
        let database = self.database.as_ref()?;
        let sql = format!(
            "SELECT version FROM {MIGRATIONS_TABLE} ORDER BY executed_at DESC, version DESC LIMIT 1"
        );
        match database.query_scalar(&sql) {
            Ok(version) => version.and_then(|value| non_empty(&value)),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "schema version fallback query failed");
                None
            }
        }
    }

    fn cache_state(&self) -> Result<CacheState> {
        let cache_dir = self.layout.cache_dir();
        let metadata = match fs::metadata(&cache_dir) {
            Ok(metadata) if metadata.is_dir() => metadata,
            Ok(_) => return Ok(CacheState::default()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(CacheState::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to inspect {}", cache_dir.display()));
            }
        };
        Ok(CacheState {
            exists: true,
            writable: !metadata.permissions().readonly(),
            size_bytes: directory_size(&cache_dir)?,
        })
    }

    fn app_version(&self) -> String {
        self.git_output(&["describe", "--tags", "--exact-match"])
            .or_else(|| self.git_output(&["describe", "--tags", "--abbrev=0"]))
            .or_else(|| self.manifest_version())
            .unwrap_or_else(|| DEFAULT_APP_VERSION.to_string())
    }

    fn manifest_version(&self) -> Option<String> {
        let raw = fs::read_to_string(self.layout.composer_json_path()).ok()?;
        let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
        manifest
            .get("version")
            .and_then(serde_json::Value::as_str)
            .and_then(non_empty)
    }

    fn runtime_version(&self) -> Option<String> {
        let spec = CommandSpec::new(&self.settings.php_binary)
            .args(["-r", "echo PHP_VERSION;"])
            .timeout(self.timeout);
        match self.runner.run(&spec) {
            Ok(output) if output.success() => non_empty(output.stdout_trimmed()),
            _ => None,
        }
    }

    fn environment(&self) -> String {
        if let Ok(value) = std::env::var("APP_ENV") {
            if let Some(value) = non_empty(&value) {
                return value;
            }
        }
        for name in [".env.local", ".env"] {
            if let Some(value) = read_dotenv_value(&self.layout.root().join(name), "APP_ENV") {
                return value;
            }
        }
        "prod".to_string()
    }
}

/// Extracts the current migration version from migration tool output.
pub fn parse_schema_version(output: &str) -> Option<String> {
    let trimmed = output.trim();
    if trimmed == "0" {
        return Some("0".to_string());
    }

    let class_name = Regex::new(r"([A-Za-z_][A-Za-z0-9_\\]*\\)?Version\d{6,}").ok()?;
    if let Some(found) = class_name.find(trimmed) {
        return Some(found.as_str().to_string());
    }

    let status_line = Regex::new(r"Current Version:\s*(?:.*\(([^)\s]+)\)|(\S+))").ok()?;
    let captures = status_line.captures(trimmed)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|value| value.as_str().to_string())
        .filter(|value| !value.is_empty())
}

fn read_dotenv_value(path: &Path, key: &str) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(name, _)| name.trim() == key)
        .map(|(_, value)| value.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|value| !value.is_empty())
        .last()
}

fn directory_size(root: &Path) -> Result<u64> {
    let mut total = 0_u64;
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading directory {}", dir.display()));
            }
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                queue.push_back(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().map(|metadata| metadata.len()).unwrap_or(0);
            }
        }
    }

    Ok(total)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
