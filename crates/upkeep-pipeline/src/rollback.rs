use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};
use upkeep_ops::{SchemaOps, SourceControlOps, SystemOps};
use upkeep_state::{BackupService, SystemStateManager};

use crate::seams::{OperatorPrompt, StepReporter};

const MANUAL_VERIFICATION_NOTICE: &str =
    "rollback finished; verify the application, database and files manually before resuming service";

struct RollbackAction {
    label: String,
    action: Box<dyn FnOnce() -> Result<()>>,
}

/// What a rollback attempted and which parts of it failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub steps_run: Vec<String>,
    pub warnings: Vec<String>,
}

impl RollbackOutcome {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn record(&mut self, label: &str, result: Result<()>) {
        self.steps_run.push(label.to_string());
        if let Err(err) = result {
            warn!(step = label, error = %format!("{err:#}"), "rollback step failed");
            self.warnings.push(format!("{label}: {err:#}"));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackSummary {
    pub can_rollback: bool,
    pub source_rollback_available: bool,
    pub schema_rollback_available: bool,
    pub has_saved_state: bool,
    pub saved_revision: Option<String>,
    pub saved_schema_version: Option<String>,
    pub registered_actions: Vec<String>,
    pub last_backup: Option<PathBuf>,
}

pub struct RollbackService {
    source: Arc<dyn SourceControlOps>,
    schema: Arc<dyn SchemaOps>,
    system: Arc<dyn SystemOps>,
    state: Arc<SystemStateManager>,
    backups: Option<Arc<BackupService>>,
    prompt: Arc<dyn OperatorPrompt>,
    reporter: Arc<dyn StepReporter>,
    actions: Vec<RollbackAction>,
    last_backup: Option<PathBuf>,
    source_changed: bool,
}

impl RollbackService {
    pub fn new(
        source: Arc<dyn SourceControlOps>,
        schema: Arc<dyn SchemaOps>,
        system: Arc<dyn SystemOps>,
        state: Arc<SystemStateManager>,
        prompt: Arc<dyn OperatorPrompt>,
        reporter: Arc<dyn StepReporter>,
    ) -> Self {
        Self {
            source,
            schema,
            system,
            state,
            backups: None,
            prompt,
            reporter,
            actions: Vec::new(),
            last_backup: None,
            source_changed: false,
        }
    }

    pub fn with_backups(mut self, backups: Arc<BackupService>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Registers a compensating action. Actions run last-in first-out.
    pub fn add_rollback_action<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let label = label.into();
        debug!(action = %label, "registered rollback action");
        self.actions.push(RollbackAction {
            label,
            action: Box::new(action),
        });
    }

    /// Registers a migration back to `version` as a compensating action.
    pub fn register_schema_rollback(&mut self, version: String) {
        let schema = Arc::clone(&self.schema);
        self.add_rollback_action(format!("roll back schema to {version}"), move || {
            schema.rollback(Some(&version))
        });
    }

    pub fn register_ownership_restore(&mut self) {
        let system = Arc::clone(&self.system);
        self.add_rollback_action("restore file ownership", move || system.restore_ownership());
    }

    pub fn registered_actions(&self) -> Vec<String> {
        self.actions
            .iter()
            .map(|action| action.label.clone())
            .collect()
    }

    pub fn set_last_backup(&mut self, path: PathBuf) {
        self.last_backup = Some(path);
    }

    pub fn last_backup(&self) -> Option<&PathBuf> {
        self.last_backup.as_ref()
    }

    /// Records that the working tree moved during this run.
    pub fn note_source_changed(&mut self) {
        self.source_changed = true;
    }

    /// Undoes as much of the run as possible. Failures are collected, never raised.
    pub fn perform_complete_rollback(&mut self) -> RollbackOutcome {
        warn!(actions = self.actions.len(), "starting complete rollback");
        let mut outcome = RollbackOutcome::default();

        while let Some(RollbackAction { label, action }) = self.actions.pop() {
            self.reporter.step_started(&label);
            let result = action();
            match &result {
                Ok(()) => self.reporter.step_succeeded(&label),
                Err(err) => self.reporter.step_failed(&label, err),
            }
            outcome.record(&label, result);
        }

        self.restore_database(&mut outcome);
        self.restore_source(&mut outcome);

        if self.source.is_stashed() {
            let result = self.source.apply_stash();
            outcome.record("re-apply stashed changes", result);
        }

        let result = self.system.clear_cache();
        outcome.record("clear cache", result);

        self.reporter.warning(MANUAL_VERIFICATION_NOTICE);
        info!(
            steps = outcome.steps_run.len(),
            warnings = outcome.warnings.len(),
            "complete rollback finished"
        );
        outcome
    }

    /// Re-applies a stash and reverts source changes made in this run.
    pub fn perform_simple_rollback(&mut self) -> RollbackOutcome {
        let mut outcome = RollbackOutcome::default();
        if self.source.is_stashed() {
            let result = self.source.apply_stash();
            outcome.record("re-apply stashed changes", result);
        }
        if self.source_changed {
            let result = self.source.rollback(None);
            outcome.record("revert source changes", result);
            if outcome.warnings.is_empty() {
                self.source_changed = false;
            }
        }
        info!(steps = outcome.steps_run.len(), "simple rollback finished");
        outcome
    }

    pub fn can_rollback(&self) -> bool {
        self.source.can_rollback() || self.schema.can_rollback() || self.saved_state_exists()
    }

    pub fn rollback_summary(&self) -> RollbackSummary {
        let saved = self.state.get_system_state().ok().flatten();
        let source_rollback_available = self.source.can_rollback();
        let schema_rollback_available = self.schema.can_rollback();
        RollbackSummary {
            can_rollback: source_rollback_available
                || schema_rollback_available
                || saved.is_some(),
            source_rollback_available,
            schema_rollback_available,
            has_saved_state: saved.is_some(),
            saved_revision: saved
                .as_ref()
                .and_then(|snapshot| snapshot.source_revision.clone()),
            saved_schema_version: saved
                .as_ref()
                .and_then(|snapshot| snapshot.schema_version.clone()),
            registered_actions: self.registered_actions(),
            last_backup: self.last_backup.clone(),
        }
    }

    fn saved_state_exists(&self) -> bool {
        matches!(self.state.get_system_state(), Ok(Some(_)))
    }

    fn restore_database(&mut self, outcome: &mut RollbackOutcome) {
        let Some(backups) = self.backups.clone() else {
            return;
        };
        let candidate = match &self.last_backup {
            Some(path) if backups.validate_backup(path) => Some(path.clone()),
            Some(path) => {
                self.warn(outcome, format!("backup {} failed validation", path.display()));
                None
            }
            None => None,
        };
        let Some(path) = candidate else {
            self.warn(
                outcome,
                "no valid backup available; database was not restored".to_string(),
            );
            return;
        };

        let question = format!("Restore the database from {}?", path.display());
        if !self.prompt.confirm(&question) {
            self.warn(
                outcome,
                format!("database restore from {} skipped by operator", path.display()),
            );
            return;
        }
        let result = backups.restore_database_backup(&path);
        outcome.record("restore database backup", result);
    }

    fn restore_source(&mut self, outcome: &mut RollbackOutcome) {
        let saved_revision = match self.state.get_system_state() {
            Ok(Some(snapshot)) => snapshot.source_revision,
            Ok(None) => None,
            Err(err) => {
                self.warn(outcome, format!("could not load saved state: {err:#}"));
                None
            }
        };

        match saved_revision {
            Some(revision) if self.source.revision_exists(&revision) => {
                let result = self.source.rollback(Some(&revision));
                outcome.record("restore source revision", result);
            }
            Some(revision) => self.warn(
                outcome,
                format!("saved revision {revision} is no longer in local history; source not restored"),
            ),
            None if self.source_changed => {
                let result = self.source.rollback(None);
                outcome.record("restore source revision", result);
            }
            None => debug!("no saved revision and no source changes to revert"),
        }
    }

    fn warn(&self, outcome: &mut RollbackOutcome, message: String) {
        warn!("{message}");
        self.reporter.warning(&message);
        outcome.warnings.push(message);
    }
}
