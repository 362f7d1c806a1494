mod checks;
mod service;

pub use checks::{
    classify_composer_failure, classify_disk_space, classify_memory_limit, parse_df_available_bytes,
    parse_memory_limit, parse_php_modules, DISK_ERROR_BYTES, DISK_WARNING_BYTES,
    MEMORY_ERROR_BYTES, MEMORY_WARNING_BYTES, RECOMMENDED_EXTENSIONS, REQUIRED_EXTENSIONS,
};
pub use service::{
    validation_summary, EnvironmentValidator, ValidationReport, ValidationService, CHECK_NAMES,
};
