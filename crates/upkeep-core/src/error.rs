use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update already in progress: lock held by pid {pid} on {hostname} for {age_secs}s")]
    LockContention {
        pid: u32,
        hostname: String,
        age_secs: u64,
    },

    #[error("environment validation failed: {}", failures.join("; "))]
    EnvironmentValidation { failures: Vec<String> },

    #[error("database backup failed: {0}")]
    BackupFailure(String),

    #[error("failed to capture system state: {source:#}")]
    StateCapture {
        #[source]
        source: anyhow::Error,
    },

    #[error("step '{step}' failed: {source:#}")]
    StepExecution {
        step: String,
        #[source]
        source: anyhow::Error,
        rollback_warnings: Vec<String>,
        backup_path: Option<PathBuf>,
    },

    #[error("rollback finished with {} failure(s): {}", warnings.len(), warnings.join("; "))]
    RollbackFailure { warnings: Vec<String> },

    #[error("update aborted by operator")]
    Aborted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpdateError {
    /// Whether the failure happened after destructive steps began.
    pub fn rolled_back(&self) -> bool {
        matches!(self, Self::StepExecution { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LockContention { .. } => 2,
            Self::EnvironmentValidation { .. } => 3,
            Self::BackupFailure(_) => 4,
            Self::StateCapture { .. } => 5,
            Self::StepExecution { .. } => 6,
            Self::RollbackFailure { .. } => 7,
            Self::Aborted => 130,
            Self::Other(_) => 1,
        }
    }
}
