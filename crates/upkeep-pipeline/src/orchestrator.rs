use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};
use upkeep_core::{
    BackupArtifact, LockRecord, SystemStateSnapshot, UpdateError, UpdateOptions, ValidationResult,
    ValidationSummary,
};
use upkeep_ops::{DependencyOps, SchemaOps, SourceControlOps, SystemOps};
use upkeep_preflight::EnvironmentValidator;
use upkeep_state::{BackupService, LockManager, StateChange, SystemStateManager};

use crate::phase::UpdatePhase;
use crate::rollback::{RollbackService, RollbackSummary};
use crate::seams::{OperatorPrompt, StepReporter};

pub const STEP_STASH: &str = "Stashing local changes";
pub const STEP_PULL: &str = "Pulling latest code";
pub const STEP_DEPENDENCIES: &str = "Installing dependencies";
pub const STEP_MIGRATIONS: &str = "Running database migrations";
pub const STEP_CACHE: &str = "Clearing cache";
pub const STEP_PERMISSIONS: &str = "Adjusting permissions";
const STEP_BACKUP: &str = "Creating database backup";

/// Mutating steps in execution order, with the phase each one runs in.
pub const FORWARD_STEPS: &[(&str, UpdatePhase)] = &[
    (STEP_STASH, UpdatePhase::Pulling),
    (STEP_PULL, UpdatePhase::Pulling),
    (STEP_DEPENDENCIES, UpdatePhase::DependencyInstall),
    (STEP_MIGRATIONS, UpdatePhase::SchemaMigrate),
    (STEP_CACHE, UpdatePhase::CacheClear),
    (STEP_PERMISSIONS, UpdatePhase::PermissionFixup),
];

const INTERRUPT_WARNING: &str =
    "the update is about to modify code, dependencies and the database; do not interrupt it";
const CONFIRM_QUESTION: &str = "Proceed with the update?";

/// Everything an update run talks to.
pub struct UpdateServices {
    pub lock: LockManager,
    pub validator: Arc<dyn EnvironmentValidator>,
    pub state: Arc<SystemStateManager>,
    pub backups: Option<Arc<BackupService>>,
    pub source: Arc<dyn SourceControlOps>,
    pub dependencies: Arc<dyn DependencyOps>,
    pub schema: Arc<dyn SchemaOps>,
    pub system: Arc<dyn SystemOps>,
    pub reporter: Arc<dyn StepReporter>,
    pub prompt: Arc<dyn OperatorPrompt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub phase: UpdatePhase,
    pub snapshot: SystemStateSnapshot,
    pub backup: Option<BackupArtifact>,
    pub completed_steps: Vec<String>,
    pub changes: Vec<StateChange>,
    pub validation_warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunPreview {
    pub results: Vec<ValidationResult>,
    pub summary: ValidationSummary,
    pub snapshot: Option<SystemStateSnapshot>,
    pub lock_holder: Option<LockRecord>,
    pub backups: Vec<BackupArtifact>,
    pub planned_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Completed(UpdateReport),
    DryRun(DryRunPreview),
}

struct StepFailure {
    step: String,
    error: anyhow::Error,
}

pub struct Orchestrator {
    lock: LockManager,
    validator: Arc<dyn EnvironmentValidator>,
    state: Arc<SystemStateManager>,
    backups: Option<Arc<BackupService>>,
    source: Arc<dyn SourceControlOps>,
    dependencies: Arc<dyn DependencyOps>,
    schema: Arc<dyn SchemaOps>,
    system: Arc<dyn SystemOps>,
    reporter: Arc<dyn StepReporter>,
    prompt: Arc<dyn OperatorPrompt>,
    rollback: RollbackService,
    options: UpdateOptions,
    phase: UpdatePhase,
    completed: Vec<String>,
}

impl Orchestrator {
    pub fn new(services: UpdateServices, options: UpdateOptions) -> Self {
        let mut rollback = RollbackService::new(
            Arc::clone(&services.source),
            Arc::clone(&services.schema),
            Arc::clone(&services.system),
            Arc::clone(&services.state),
            Arc::clone(&services.prompt),
            Arc::clone(&services.reporter),
        );
        if let Some(backups) = &services.backups {
            rollback = rollback.with_backups(Arc::clone(backups));
        }
        Self {
            lock: services.lock,
            validator: services.validator,
            state: services.state,
            backups: services.backups,
            source: services.source,
            dependencies: services.dependencies,
            schema: services.schema,
            system: services.system,
            reporter: services.reporter,
            prompt: services.prompt,
            rollback,
            options,
            phase: UpdatePhase::Idle,
            completed: Vec::new(),
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed
    }

    pub fn rollback_summary(&self) -> RollbackSummary {
        self.rollback.rollback_summary()
    }

    /// Runs one update. The lock is released on every path out of a real run.
    pub fn run(&mut self) -> Result<UpdateOutcome, UpdateError> {
        if self.options.dry_run {
            return self.preview().map(UpdateOutcome::DryRun);
        }

        self.lock.acquire()?;
        let run_result = self.run_locked();
        if let Err(err) = self.lock.release() {
            warn!(error = %format!("{err:#}"), "failed to release update lock");
        }

        match run_result {
            Ok(report) => Ok(UpdateOutcome::Completed(report)),
            Err(err) => {
                if !matches!(err, UpdateError::Aborted) {
                    self.phase = UpdatePhase::Failed;
                }
                Err(err)
            }
        }
    }

    fn run_locked(&mut self) -> Result<UpdateReport, UpdateError> {
        self.phase = UpdatePhase::Validating;
        let report = self.validator.validate_update_environment();
        let summary = report.summary();
        if !summary.can_proceed {
            return Err(UpdateError::EnvironmentValidation {
                failures: report.failures(),
            });
        }
        let validation_warnings: Vec<String> = report
            .iter()
            .filter(|result| result.status == upkeep_core::ValidationStatus::Warning)
            .map(|result| format!("{}: {}", result.check_name, result.message))
            .collect();
        if self.options.verbose {
            for warning in &validation_warnings {
                self.reporter.warning(warning);
            }
        }

        self.reporter.warning(INTERRUPT_WARNING);
        if !self.options.assume_yes && !self.prompt.confirm(CONFIRM_QUESTION) {
            info!("update declined by operator");
            self.phase = UpdatePhase::Idle;
            return Err(UpdateError::Aborted);
        }

        let snapshot = match self.state.capture_system_state() {
            Ok(snapshot) => snapshot,
            Err(source) => {
                let outcome = self.rollback.perform_simple_rollback();
                for warning in &outcome.warnings {
                    self.reporter.warning(warning);
                }
                return Err(UpdateError::StateCapture { source });
            }
        };
        self.phase = UpdatePhase::StateCaptured;

        let backup = self.create_backup()?;

        match self.run_forward_steps(&snapshot) {
            Ok(()) => {}
            Err(StepFailure { step, error }) => {
                self.phase = UpdatePhase::RollingBack;
                let outcome = self.rollback.perform_complete_rollback();
                return Err(UpdateError::StepExecution {
                    step,
                    source: error,
                    rollback_warnings: outcome.warnings,
                    backup_path: backup.map(|artifact| artifact.path),
                });
            }
        }

        self.phase = UpdatePhase::Done;
        let changes = match self.state.inspect_system_state() {
            Ok(after) => SystemStateManager::compare_states(&snapshot, &after),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed inspecting state after update");
                Vec::new()
            }
        };
        if let Err(err) = self.state.clear_state() {
            warn!(error = %format!("{err:#}"), "failed clearing saved system state");
        }
        info!(steps = self.completed.len(), changes = changes.len(), "update completed");

        Ok(UpdateReport {
            phase: self.phase,
            snapshot,
            backup,
            completed_steps: self.completed.clone(),
            changes,
            validation_warnings,
        })
    }

    fn create_backup(&mut self) -> Result<Option<BackupArtifact>, UpdateError> {
        if self.options.skip_backup {
            self.reporter
                .warning("database backup skipped; a failed update cannot restore data");
            return Ok(None);
        }
        let Some(backups) = self.backups.clone() else {
            self.reporter
                .warning("no database configured for backups; continuing without one");
            return Ok(None);
        };

        self.phase = UpdatePhase::BackingUp;
        self.reporter.step_started(STEP_BACKUP);
        match backups.create_database_backup(self.options.backup_retention_days) {
            Ok(artifact) => {
                self.reporter.step_succeeded(STEP_BACKUP);
                self.rollback.set_last_backup(artifact.path.clone());
                Ok(Some(artifact))
            }
            Err(err) => {
                let shown = anyhow::anyhow!("{err}");
                self.reporter.step_failed(STEP_BACKUP, &shown);
                Err(err)
            }
        }
    }

    fn run_forward_steps(&mut self, snapshot: &SystemStateSnapshot) -> Result<(), StepFailure> {
        let source = Arc::clone(&self.source);
        let dependencies = Arc::clone(&self.dependencies);
        let schema = Arc::clone(&self.schema);
        let system = Arc::clone(&self.system);
        let force = self.options.force_dependency_platform_override;

        self.run_step(STEP_STASH, UpdatePhase::Pulling, || {
            source.ensure_safe_directory()?;
            source.stash().map(|_| ())
        })?;
        self.run_step(STEP_PULL, UpdatePhase::Pulling, || source.pull())?;
        self.rollback.note_source_changed();

        self.run_step(STEP_DEPENDENCIES, UpdatePhase::DependencyInstall, || {
            dependencies.install(force)
        })?;

        match &snapshot.schema_version {
            Some(version) => self.rollback.register_schema_rollback(version.clone()),
            None => debug!("no captured schema version, schema rollback not registered"),
        }
        self.run_step(STEP_MIGRATIONS, UpdatePhase::SchemaMigrate, || schema.migrate())?;

        self.run_step(STEP_CACHE, UpdatePhase::CacheClear, || system.clear_cache())?;

        self.rollback.register_ownership_restore();
        self.run_step(STEP_PERMISSIONS, UpdatePhase::PermissionFixup, || {
            system.adjust_permissions()?;
            system.restore_ownership()
        })?;
        Ok(())
    }

    /// Atomic step: uniform reporting around one forward action.
    fn run_step<F>(&mut self, label: &str, phase: UpdatePhase, action: F) -> Result<(), StepFailure>
    where
        F: FnOnce() -> Result<()>,
    {
        self.phase = phase;
        let span = info_span!("update_step", step = label, phase = %phase);
        let _entered = span.enter();

        self.reporter.step_started(label);
        match action() {
            Ok(()) => {
                self.reporter.step_succeeded(label);
                self.completed.push(label.to_string());
                Ok(())
            }
            Err(error) => {
                self.phase = UpdatePhase::Failed;
                self.reporter.step_failed(label, &error);
                Err(StepFailure {
                    step: label.to_string(),
                    error,
                })
            }
        }
    }

    fn preview(&mut self) -> Result<DryRunPreview, UpdateError> {
        self.phase = UpdatePhase::Validating;
        let report = self.validator.validate_update_environment();
        let summary = report.summary();

        let snapshot = match self.state.inspect_system_state() {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed inspecting current state");
                None
            }
        };
        let lock_holder = self
            .lock
            .current_holder()?
            .filter(|record| self.lock.record_is_valid(record));
        let backups = match &self.backups {
            Some(backups) => backups.list_backups()?,
            None => Vec::new(),
        };

        let mut planned_steps = Vec::new();
        if !self.options.skip_backup && self.backups.is_some() {
            planned_steps.push(STEP_BACKUP.to_string());
        }
        planned_steps.extend(FORWARD_STEPS.iter().map(|(label, _)| label.to_string()));

        self.phase = UpdatePhase::DryRunPreview;
        info!(
            can_proceed = summary.can_proceed,
            steps = planned_steps.len(),
            "dry run finished without changes"
        );
        Ok(DryRunPreview {
            results: report.into_vec(),
            summary,
            snapshot,
            lock_holder,
            backups,
            planned_steps,
        })
    }
}
