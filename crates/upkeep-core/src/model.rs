use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
    pub exists: bool,
    pub writable: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStateSnapshot {
    pub timestamp: u64,
    pub source_revision: Option<String>,
    pub source_branch: Option<String>,
    pub dependency_lock_hash: Option<String>,
    pub schema_version: Option<String>,
    #[serde(default)]
    pub cache_state: CacheState,
    pub app_version: String,
    pub runtime_version: Option<String>,
    pub environment: String,
}

impl SystemStateSnapshot {
    pub fn age_secs(&self, now_unix: u64) -> u64 {
        now_unix.saturating_sub(self.timestamp)
    }

    /// Identity fields compared across snapshots, as `(name, value)` pairs.
    pub fn identity_fields(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("source_revision", self.source_revision.clone()),
            ("source_branch", self.source_branch.clone()),
            ("dependency_lock_hash", self.dependency_lock_hash.clone()),
            ("schema_version", self.schema_version.clone()),
            ("app_version", Some(self.app_version.clone())),
            ("runtime_version", self.runtime_version.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub timestamp: u64,
    pub hostname: String,
}

impl LockRecord {
    pub fn age_secs(&self, now_unix: u64) -> u64 {
        now_unix.saturating_sub(self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_unix: u64,
    pub valid: bool,
}

impl BackupArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Ok,
    Warning,
    Error,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Combines two statuses, keeping the more severe one.
    pub fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Error, _) | (_, Self::Error) => Self::Error,
            (Self::Warning, _) | (_, Self::Warning) => Self::Warning,
            _ => Self::Ok,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub check_name: String,
    pub status: ValidationStatus,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl ValidationResult {
    pub fn new(
        check_name: impl Into<String>,
        status: ValidationStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            status,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn ok(check_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check_name, ValidationStatus::Ok, message)
    }

    pub fn warning(check_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check_name, ValidationStatus::Warning, message)
    }

    pub fn error(check_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check_name, ValidationStatus::Error, message)
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub passed: usize,
    pub warnings: usize,
    pub failed: usize,
    pub can_proceed: bool,
}
