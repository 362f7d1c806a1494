use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::command::DEFAULT_SUBPROCESS_TIMEOUT_SECS;

pub const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_LOCK_MAX_AGE_SECS: u64 = 3600;

/// Recognized option set for one update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    pub force_dependency_platform_override: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub skip_backup: bool,
    pub backup_retention_days: u32,
    pub subprocess_timeout_seconds: u64,
    pub assume_yes: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            force_dependency_platform_override: false,
            dry_run: false,
            verbose: false,
            skip_backup: false,
            backup_retention_days: DEFAULT_BACKUP_RETENTION_DAYS,
            subprocess_timeout_seconds: DEFAULT_SUBPROCESS_TIMEOUT_SECS,
            assume_yes: false,
        }
    }
}

impl UpdateOptions {
    pub fn from_section(section: &UpdateSection) -> Self {
        let defaults = Self::default();
        Self {
            force_dependency_platform_override: section
                .force_dependency_platform_override
                .unwrap_or(defaults.force_dependency_platform_override),
            dry_run: section.dry_run.unwrap_or(defaults.dry_run),
            verbose: section.verbose.unwrap_or(defaults.verbose),
            skip_backup: section.skip_backup.unwrap_or(defaults.skip_backup),
            backup_retention_days: section
                .backup_retention_days
                .unwrap_or(defaults.backup_retention_days),
            subprocess_timeout_seconds: section
                .subprocess_timeout_seconds
                .unwrap_or(defaults.subprocess_timeout_seconds),
            assume_yes: defaults.assume_yes,
        }
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UpdateSection {
    pub force_dependency_platform_override: Option<bool>,
    pub dry_run: Option<bool>,
    pub verbose: Option<bool>,
    pub skip_backup: Option<bool>,
    pub backup_retention_days: Option<u32>,
    pub subprocess_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProjectSettings {
    #[serde(default = "default_deploy_branch")]
    pub deploy_branch: String,
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    #[serde(default = "default_php_binary")]
    pub php_binary: String,
    #[serde(default = "default_composer_binary")]
    pub composer_binary: String,
    #[serde(default = "default_console_path")]
    pub console_path: String,
    #[serde(default)]
    pub web_user: Option<String>,
    #[serde(default = "default_lock_max_age_secs")]
    pub lock_max_age_secs: u64,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            deploy_branch: default_deploy_branch(),
            git_binary: default_git_binary(),
            php_binary: default_php_binary(),
            composer_binary: default_composer_binary(),
            console_path: default_console_path(),
            web_user: None,
            lock_max_age_secs: default_lock_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpkeepConfig {
    #[serde(default)]
    pub update: UpdateSection,
    #[serde(default)]
    pub project: ProjectSettings,
}

impl UpkeepConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse upkeep config")
    }
}

/// Loads the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<UpkeepConfig> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(UpkeepConfig::default()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading config file: {}", path.display()));
        }
    };
    UpkeepConfig::from_toml_str(&raw)
        .with_context(|| format!("failed parsing config file: {}", path.display()))
}

fn default_deploy_branch() -> String {
    "main".to_string()
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_php_binary() -> String {
    "php".to_string()
}

fn default_composer_binary() -> String {
    "composer".to_string()
}

fn default_console_path() -> String {
    "bin/console".to_string()
}

fn default_lock_max_age_secs() -> u64 {
    DEFAULT_LOCK_MAX_AGE_SECS
}
