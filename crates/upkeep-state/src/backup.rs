use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use regex::Regex;
use tracing::{info, warn};
use upkeep_core::{
    run_checked, BackupArtifact, Clock, CommandRunner, Database, ProjectLayout, SystemClock,
    UpdateError, DEFAULT_SUBPROCESS_TIMEOUT_SECS,
};

pub const MIN_BACKUP_BYTES: u64 = 50;
const SNIFF_BYTES: usize = 2048;
const BACKUP_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const BACKUP_NAME_PATTERN: &str = r"^db_\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}(_\d+)?\.sql$";

const DUMP_MARKERS: &[&str] = &[
    "create table",
    "insert into",
    "mysqldump",
    "pg_dump",
    "drop table",
    "create database",
    "use ",
    "-- mysql dump",
    "-- postgresql database dump",
];

pub struct BackupService {
    layout: ProjectLayout,
    database: Arc<dyn Database>,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl BackupService {
    pub fn new(
        layout: ProjectLayout,
        database: Arc<dyn Database>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            layout,
            database,
            runner,
            clock: Arc::new(SystemClock),
            timeout: Duration::from_secs(DEFAULT_SUBPROCESS_TIMEOUT_SECS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.layout.backups_dir()
    }

    /// Dumps the database into a fresh timestamped file, validates it and prunes
    /// backups older than `retention_days`.
    pub fn create_database_backup(&self, retention_days: u32) -> Result<BackupArtifact, UpdateError> {
        self.create_backup_inner(retention_days)
            .map_err(|err| UpdateError::BackupFailure(format!("{err:#}")))
    }

    fn create_backup_inner(&self, retention_days: u32) -> Result<BackupArtifact> {
        let dir = self.backups_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create backup directory: {}", dir.display()))?;

        let path = self.unused_backup_path(&backup_stamp(self.clock.now_unix()));
        let url = self.database.url();
        let spec = url
            .dump_command()
            .stdout_file(&path)
            .timeout(self.timeout);

        info!(
            database = %url.redacted(),
            path = %path.display(),
            "creating database backup"
        );
        if let Err(err) = run_checked(self.runner.as_ref(), &spec, "database dump failed") {
            discard_file(&path);
            return Err(err);
        }

        let size_bytes = fs::metadata(&path).map(|metadata| metadata.len()).unwrap_or(0);
        if size_bytes == 0 {
            discard_file(&path);
            return Err(anyhow!("database dump produced no output"));
        }
        if !self.validate_backup(&path) {
            discard_file(&path);
            return Err(anyhow!(
                "database dump failed validation: {}",
                path.display()
            ));
        }

        let artifact = artifact_for(&path, true)?;
        match self.prune_backups(retention_days) {
            Ok(removed) if !removed.is_empty() => {
                info!(removed = removed.len(), retention_days, "pruned old backups");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %format!("{err:#}"), "failed pruning old backups"),
        }

        info!(
            path = %artifact.path.display(),
            size_bytes = artifact.size_bytes,
            "database backup created"
        );
        Ok(artifact)
    }

    /// `db_<stamp>.sql`, or `db_<stamp>_<n>.sql` when a backup from the same second exists.
    fn unused_backup_path(&self, stamp: &str) -> PathBuf {
        let mut path = self.layout.backup_path(stamp);
        let mut sequence = 2;
        while path.exists() {
            path = self.layout.backup_path(&format!("{stamp}_{sequence}"));
            sequence += 1;
        }
        path
    }

    pub fn restore_database_backup(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(anyhow!("backup file not found: {}", path.display()));
        }
        let url = self.database.url();
        let spec = url
            .restore_command()
            .stdin_file(path)
            .timeout(self.timeout);
        warn!(
            database = %url.redacted(),
            path = %path.display(),
            "restoring database from backup"
        );
        run_checked(
            self.runner.as_ref(),
            &spec,
            &format!("failed to restore database from {}", path.display()),
        )?;
        info!(path = %path.display(), "database restored");
        Ok(())
    }

    /// Heuristic check that `path` looks like a SQL dump.
    pub fn validate_backup(&self, path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() && metadata.len() >= MIN_BACKUP_BYTES => {}
            _ => return false,
        }
        let head = match read_head(path) {
            Ok(head) => head.to_ascii_lowercase(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), path = %path.display(), "failed reading backup");
                return false;
            }
        };
        DUMP_MARKERS.iter().any(|marker| head.contains(marker))
            || (head.contains("set") && head.contains("sql_mode"))
    }

    /// Backups in the backup directory, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupArtifact>> {
        let dir = self.backups_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading backup directory: {}", dir.display()));
            }
        };
        let pattern = backup_name_regex()?;

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed reading backup directory: {}", dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !pattern.is_match(name) || !entry.path().is_file() {
                continue;
            }
            let path = entry.path();
            let valid = self.validate_backup(&path);
            backups.push(artifact_for(&path, valid)?);
        }

        backups.sort_by(|left, right| {
            right
                .modified_unix
                .cmp(&left.modified_unix)
                .then_with(|| right.file_name().cmp(&left.file_name()))
        });
        Ok(backups)
    }

    pub fn latest_valid_backup(&self) -> Result<Option<BackupArtifact>> {
        Ok(self
            .list_backups()?
            .into_iter()
            .find(|backup| backup.valid))
    }

    /// Deletes backups whose modification time is older than `retention_days`.
    pub fn prune_backups(&self, retention_days: u32) -> Result<Vec<PathBuf>> {
        let cutoff = self
            .clock
            .now_unix()
            .saturating_sub(u64::from(retention_days) * 86_400);
        let mut removed = Vec::new();
        for backup in self.list_backups()? {
            if backup.modified_unix >= cutoff {
                continue;
            }
            fs::remove_file(&backup.path).with_context(|| {
                format!("failed to remove old backup: {}", backup.path.display())
            })?;
            removed.push(backup.path);
        }
        Ok(removed)
    }
}

fn backup_stamp(now_unix: u64) -> String {
    i64::try_from(now_unix)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now)
        .format(BACKUP_STAMP_FORMAT)
        .to_string()
}

fn backup_name_regex() -> Result<Regex> {
    Regex::new(BACKUP_NAME_PATTERN).context("failed compiling backup name pattern")
}

fn artifact_for(path: &Path, valid: bool) -> Result<BackupArtifact> {
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat backup: {}", path.display()))?;
    let modified_unix = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    Ok(BackupArtifact {
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        modified_unix,
        valid,
    })
}

fn read_head(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open backup: {}", path.display()))?;
    let mut buffer = Vec::with_capacity(SNIFF_BYTES);
    file.take(SNIFF_BYTES as u64)
        .read_to_end(&mut buffer)
        .with_context(|| format!("failed to read backup: {}", path.display()))?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn discard_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(error = %err, path = %path.display(), "failed removing invalid backup");
        }
    }
}
