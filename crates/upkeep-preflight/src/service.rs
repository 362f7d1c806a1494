use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use upkeep_core::{
    CommandOutput, CommandRunner, CommandSpec, Database, ProjectLayout, ProjectSettings,
    ValidationResult, ValidationStatus, ValidationSummary, DEFAULT_SUBPROCESS_TIMEOUT_SECS,
};

use crate::checks::{
    classify_composer_failure, classify_disk_space, classify_memory_limit,
    parse_df_available_bytes, parse_memory_limit, parse_php_modules, RECOMMENDED_EXTENSIONS,
    REQUIRED_EXTENSIONS,
};

/// Check names in execution order.
pub const CHECK_NAMES: &[&str] = &[
    "disk_space",
    "memory_limit",
    "permissions",
    "database",
    "git",
    "git_branch",
    "composer",
    "php_extensions",
    "console",
];

const MIGRATIONS_TABLE: &str = "doctrine_migration_versions";
const WRITE_PROBE_NAME: &str = ".upkeep_write_probe";
const MAX_LISTED_CHANGES: usize = 10;

/// Validation results keyed by check name, in the order the checks ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn push(&mut self, result: ValidationResult) {
        self.results.retain(|existing| existing.check_name != result.check_name);
        self.results.push(result);
    }

    pub fn get(&self, check_name: &str) -> Option<&ValidationResult> {
        self.results
            .iter()
            .find(|result| result.check_name == check_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn summary(&self) -> ValidationSummary {
        validation_summary(&self.results)
    }

    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|result| result.status == ValidationStatus::Error)
            .map(|result| format!("{}: {}", result.check_name, result.message))
            .collect()
    }

    pub fn into_vec(self) -> Vec<ValidationResult> {
        self.results
    }
}

impl FromIterator<ValidationResult> for ValidationReport {
    fn from_iter<I: IntoIterator<Item = ValidationResult>>(iter: I) -> Self {
        let mut report = Self::default();
        for result in iter {
            report.push(result);
        }
        report
    }
}

/// Source of preflight results consumed by the update pipeline.
pub trait EnvironmentValidator {
    fn validate_update_environment(&self) -> ValidationReport;
}

pub fn validation_summary(results: &[ValidationResult]) -> ValidationSummary {
    let count = |status: ValidationStatus| {
        results
            .iter()
            .filter(|result| result.status == status)
            .count()
    };
    let failed = count(ValidationStatus::Error);
    ValidationSummary {
        total: results.len(),
        passed: count(ValidationStatus::Ok),
        warnings: count(ValidationStatus::Warning),
        failed,
        can_proceed: failed == 0,
    }
}

pub struct ValidationService {
    layout: ProjectLayout,
    settings: ProjectSettings,
    runner: Arc<dyn CommandRunner>,
    database: Option<Arc<dyn Database>>,
    timeout: Duration,
}

impl ValidationService {
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
            timeout: Duration::from_secs(DEFAULT_SUBPROCESS_TIMEOUT_SECS),
        }
    }

    pub fn with_database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn run_all(&self) -> ValidationReport {
        let report: ValidationReport = CHECK_NAMES
            .iter()
            .map(|name| self.run_check(name))
            .collect();
        let summary = report.summary();
        info!(
            total = summary.total,
            passed = summary.passed,
            warnings = summary.warnings,
            failed = summary.failed,
            "environment validation finished"
        );
        report
    }

    pub fn run_check(&self, name: &str) -> ValidationResult {
        let result = match name {
            "disk_space" => self.check_disk_space(),
            "memory_limit" => self.check_memory_limit(),
            "permissions" => Ok(self.check_permissions()),
            "database" => Ok(self.check_database()),
            "git" => self.check_git(),
            "git_branch" => self.check_git_branch(),
            "composer" => self.check_composer(),
            "php_extensions" => self.check_php_extensions(),
            "console" => self.check_console(),
            other => Err(anyhow!("unknown validation check '{other}'")),
        };
        let result = result.unwrap_or_else(|err| {
            ValidationResult::error(name, format!("check could not run: {err:#}"))
        });
        match result.status {
            ValidationStatus::Ok => debug!(check = name, message = %result.message, "check passed"),
            ValidationStatus::Warning => {
                warn!(check = name, message = %result.message, "check reported a warning")
            }
            ValidationStatus::Error => {
                warn!(check = name, message = %result.message, "check failed")
            }
        }
        result
    }

    fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.runner.run(&spec.timeout(self.timeout))
    }

    fn php(&self) -> CommandSpec {
        CommandSpec::new(&self.settings.php_binary).current_dir(self.layout.root())
    }

    fn git(&self) -> CommandSpec {
        CommandSpec::new(&self.settings.git_binary).current_dir(self.layout.root())
    }

    fn composer(&self) -> CommandSpec {
        CommandSpec::new(&self.settings.composer_binary)
            .current_dir(self.layout.root())
            .env("COMPOSER_NO_INTERACTION", "1")
    }

    fn check_disk_space(&self) -> Result<ValidationResult> {
        let root = self.layout.root().to_string_lossy().into_owned();
        let output = self.run(CommandSpec::new("df").args(["-Pk", root.as_str()]))?;
        if !output.success() {
            return Ok(ValidationResult::error(
                "disk_space",
                format!("could not determine free space: {}", output.failure_detail()),
            ));
        }
        let free = parse_df_available_bytes(&output.stdout)?;
        Ok(classify_disk_space(free))
    }

    fn check_memory_limit(&self) -> Result<ValidationResult> {
        let output = self.run(self.php().args(["-r", "echo ini_get('memory_limit');"]))?;
        if !output.success() {
            return Ok(ValidationResult::error(
                "memory_limit",
                format!("could not read memory limit: {}", output.failure_detail()),
            ));
        }
        let limit = parse_memory_limit(output.stdout_trimmed())?;
        Ok(classify_memory_limit(limit))
    }

    fn check_permissions(&self) -> ValidationResult {
        let mut problems = Vec::new();
        for dir in self.layout.critical_dirs() {
            if let Err(err) = probe_directory(&dir) {
                problems.push(format!("{err:#}"));
            }
        }
        if let Err(err) = probe_writable(self.layout.root()) {
            problems.push(format!("{err:#}"));
        }

        if problems.is_empty() {
            ValidationResult::ok("permissions", "critical directories are readable and writable")
        } else {
            ValidationResult::error(
                "permissions",
                format!("{} permission problem(s) found", problems.len()),
            )
            .with_details(problems)
        }
    }

    fn check_database(&self) -> ValidationResult {
        let Some(database) = &self.database else {
            return ValidationResult::error("database", "DATABASE_URL is not configured");
        };
        let target = database.url().redacted();
        if let Err(err) = database.ping() {
            return ValidationResult::error(
                "database",
                format!("cannot connect to {target}: {err:#}"),
            );
        }
        match database.table_exists(MIGRATIONS_TABLE) {
            Ok(true) => ValidationResult::ok("database", format!("connected to {target}")),
            Ok(false) => ValidationResult::warning(
                "database",
                format!("connected to {target}, but {MIGRATIONS_TABLE} does not exist"),
            ),
            Err(err) => ValidationResult::warning(
                "database",
                format!("connected to {target}, but could not inspect {MIGRATIONS_TABLE}: {err:#}"),
            ),
        }
    }

    fn check_git(&self) -> Result<ValidationResult> {
        let version = match self.run(self.git().arg("--version")) {
            Ok(output) if output.success() => output.stdout_trimmed().to_string(),
            Ok(output) => {
                return Ok(ValidationResult::error(
                    "git",
                    format!("git is not usable: {}", output.failure_detail()),
                ));
            }
            Err(err) => {
                return Ok(ValidationResult::error(
                    "git",
                    format!("git is not available: {err:#}"),
                ));
            }
        };

        let inside = self.run(self.git().args(["rev-parse", "--is-inside-work-tree"]))?;
        if !inside.success() || inside.stdout_trimmed() != "true" {
            return Ok(ValidationResult::error(
                "git",
                "project root is not a git work tree",
            ));
        }

        let mut status = ValidationStatus::Ok;
        let mut notes = Vec::new();

        let remote = self.run(self.git().args(["ls-remote", "--heads", "origin"]))?;
        if !remote.success() {
            status = status.worst(ValidationStatus::Warning);
            notes.push(format!("remote unreachable: {}", remote.failure_detail()));
        }

        let changes = self.run(self.git().args(["status", "--porcelain"]))?;
        let changed: Vec<String> = changes
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if !changed.is_empty() {
            status = status.worst(ValidationStatus::Warning);
            notes.push(format!(
                "{} uncommitted change(s) will be stashed",
                changed.len()
            ));
            notes.extend(changed.into_iter().take(MAX_LISTED_CHANGES));
        }

        let message = match status {
            ValidationStatus::Ok => version,
            _ => format!("{version} with warnings"),
        };
        Ok(ValidationResult::new("git", status, message).with_details(notes))
    }

    fn check_git_branch(&self) -> Result<ValidationResult> {
        let output = self.run(self.git().args(["rev-parse", "--abbrev-ref", "HEAD"]))?;
        if !output.success() {
            return Ok(ValidationResult::error(
                "git_branch",
                format!("could not determine current branch: {}", output.failure_detail()),
            ));
        }
        let branch = output.stdout_trimmed();
        let required = &self.settings.deploy_branch;
        if branch == required {
            Ok(ValidationResult::ok(
                "git_branch",
                format!("on deployment branch {required}"),
            ))
        } else {
            Ok(ValidationResult::error(
                "git_branch",
                format!("on branch '{branch}', updates require '{required}'"),
            ))
        }
    }

    fn check_composer(&self) -> Result<ValidationResult> {
        match self.run(self.composer().arg("--version")) {
            Ok(output) if output.success() => {}
            Ok(output) => {
                return Ok(ValidationResult::error(
                    "composer",
                    format!("composer is not usable: {}", output.failure_detail()),
                ));
            }
            Err(err) => {
                return Ok(ValidationResult::error(
                    "composer",
                    format!("composer is not available: {err:#}"),
                ));
            }
        }

        let missing: Vec<String> = [
            self.layout.composer_json_path(),
            self.layout.composer_lock_path(),
        ]
        .iter()
        .filter(|path| !path.is_file())
        .map(|path| path.display().to_string())
        .collect();
        if !missing.is_empty() {
            return Ok(ValidationResult::error("composer", "composer files are missing")
                .with_details(missing));
        }

        let mut status = ValidationStatus::Ok;
        let mut details = Vec::new();

        let validate = self.run(
            self.composer()
                .args(["validate", "--no-check-publish", "--no-interaction"]),
        )?;
        if !validate.success() {
            let combined = validate.combined();
            status = status.worst(classify_composer_failure(&combined));
            details.push(format!("composer validate: {}", validate.failure_detail()));
        }

        let platform = self.run(self.composer().args(["check-platform-reqs", "--no-dev"]))?;
        if !platform.success() {
            let combined = platform.combined();
            status = status.worst(classify_composer_failure(&combined));
            let unmet: Vec<String> = combined
                .lines()
                .map(str::trim)
                .filter(|line| line.contains("failed") || line.contains("missing"))
                .map(str::to_string)
                .collect();
            if unmet.is_empty() {
                details.push(format!(
                    "composer check-platform-reqs: {}",
                    platform.failure_detail()
                ));
            } else {
                details.extend(unmet);
            }
        }

        let message = match status {
            ValidationStatus::Ok => "composer manifest and platform requirements are valid",
            ValidationStatus::Warning => "composer reported warnings",
            ValidationStatus::Error => "composer validation failed",
        };
        Ok(ValidationResult::new("composer", status, message).with_details(details))
    }

    fn check_php_extensions(&self) -> Result<ValidationResult> {
        let output = self.run(self.php().arg("-m"))?;
        if !output.success() {
            return Ok(ValidationResult::error(
                "php_extensions",
                format!("could not list php modules: {}", output.failure_detail()),
            ));
        }
        let loaded = parse_php_modules(&output.stdout);

        let mut required: Vec<&str> = REQUIRED_EXTENSIONS.to_vec();
        if let Some(database) = &self.database {
            required.push(database.url().driver.runtime_extension());
        }
        let missing_required: Vec<String> = required
            .iter()
            .filter(|name| !loaded.contains(**name))
            .map(|name| name.to_string())
            .collect();
        let missing_recommended: Vec<String> = RECOMMENDED_EXTENSIONS
            .iter()
            .filter(|name| !loaded.contains(**name))
            .map(|name| name.to_string())
            .collect();

        if !missing_required.is_empty() {
            let message = format!(
                "missing required extensions: {}",
                missing_required.join(", ")
            );
            let details = missing_recommended
                .into_iter()
                .map(|name| format!("recommended extension missing: {name}"))
                .collect();
            return Ok(ValidationResult::error("php_extensions", message).with_details(details));
        }
        if !missing_recommended.is_empty() {
            return Ok(ValidationResult::warning(
                "php_extensions",
                format!(
                    "missing recommended extensions: {}",
                    missing_recommended.join(", ")
                ),
            ));
        }
        Ok(ValidationResult::ok(
            "php_extensions",
            "all required and recommended extensions are loaded",
        ))
    }

    fn check_console(&self) -> Result<ValidationResult> {
        let console = self.layout.resolve(&self.settings.console_path);
        if !console.is_file() {
            return Ok(ValidationResult::error(
                "console",
                format!("console entry point not found: {}", console.display()),
            ));
        }
        let output = self.run(
            self.php()
                .arg(&self.settings.console_path)
                .args(["--version", "--no-interaction"]),
        )?;
        if !output.success() {
            return Ok(ValidationResult::error(
                "console",
                format!("console does not run: {}", output.failure_detail()),
            ));
        }
        let version = output
            .stdout_trimmed()
            .lines()
            .next()
            .unwrap_or("console available")
            .to_string();
        Ok(ValidationResult::ok("console", version))
    }
}

impl EnvironmentValidator for ValidationService {
    fn validate_update_environment(&self) -> ValidationReport {
        self.run_all()
    }
}

fn probe_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("missing directory: {}", dir.display());
    }
    fs::read_dir(dir).with_context(|| format!("not readable: {}", dir.display()))?;
    probe_writable(dir)
}

fn probe_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(WRITE_PROBE_NAME);
    fs::write(&probe, b"probe").with_context(|| format!("not writable: {}", dir.display()))?;
    fs::remove_file(&probe)
        .with_context(|| format!("failed to remove write probe: {}", probe.display()))?;
    Ok(())
}
