mod checksum;
mod clock;
mod command;
mod database;
mod error;
mod layout;
mod model;
mod options;

pub use checksum::{sha256_file_hex, sha256_hex};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{
    run_checked, CommandOutput, CommandRunner, CommandSpec, ProcessRunner, ScriptedRunner,
    DEFAULT_SUBPROCESS_TIMEOUT_SECS,
};
pub use database::{CliDatabase, Database, DatabaseDriver, DatabaseUrl};
pub use error::UpdateError;
pub use layout::ProjectLayout;
pub use model::{
    BackupArtifact, CacheState, LockRecord, SystemStateSnapshot, ValidationResult,
    ValidationStatus, ValidationSummary,
};
pub use options::{
    load_config, ProjectSettings, UpdateOptions, UpdateSection, UpkeepConfig,
    DEFAULT_BACKUP_RETENTION_DAYS, DEFAULT_LOCK_MAX_AGE_SECS,
};

#[cfg(test)]
mod tests;
