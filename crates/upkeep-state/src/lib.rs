mod backup;
mod lock;
mod state;

pub use backup::{BackupService, MIN_BACKUP_BYTES};
pub use lock::{local_hostname, process_is_alive, LockManager};
pub use state::{
    parse_schema_version, StateChange, SystemStateManager, DEFAULT_APP_VERSION, MIGRATIONS_TABLE,
    STATE_MAX_AGE_SECS,
};
