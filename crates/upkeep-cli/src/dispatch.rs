use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use upkeep_core::{
    load_config, CliDatabase, Clock, CommandRunner, Database, DatabaseUrl, ProcessRunner,
    ProjectLayout, SystemClock, UpdateError, UpdateOptions, UpkeepConfig,
};
use upkeep_ops::{ComposerOps, ConsoleSchemaOps, GitOps, SystemMaintenanceOps};
use upkeep_pipeline::{
    FixedAnswerPrompt, OperatorPrompt, Orchestrator, RollbackService, StepReporter,
    TracingReporter, UpdateOutcome, UpdateServices,
};
use upkeep_preflight::ValidationService;
use upkeep_state::{BackupService, LockManager, SystemStateManager};

use crate::render::{
    format_backup_lines, format_change_lines, format_dry_run_lines, format_lock_lines,
    format_rollback_lines, format_rollback_summary_lines, format_snapshot_lines,
    format_update_report_lines, format_validation_lines, TerminalRenderer,
};
use crate::terminal::{TerminalPrompt, TerminalReporter};
use crate::{BackupCommands, Cli, Commands, LockCommands, StateCommands, UpdateArgs};

/// Everything a command needs, resolved from flags, environment and config.
pub(crate) struct CliContext {
    pub(crate) layout: ProjectLayout,
    pub(crate) config: UpkeepConfig,
    pub(crate) database: Option<Arc<dyn Database>>,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) timeout: Duration,
}

impl CliContext {
    fn state_manager(&self) -> SystemStateManager {
        let manager = SystemStateManager::new(
            self.layout.clone(),
            self.config.project.clone(),
            Arc::clone(&self.runner),
        )
        .with_timeout(self.timeout);
        match &self.database {
            Some(database) => manager.with_database(Arc::clone(database)),
            None => manager,
        }
    }

    fn validator(&self) -> ValidationService {
        let validator = ValidationService::new(
            self.layout.clone(),
            self.config.project.clone(),
            Arc::clone(&self.runner),
        )
        .with_timeout(self.timeout);
        match &self.database {
            Some(database) => validator.with_database(Arc::clone(database)),
            None => validator,
        }
    }

    fn backups(&self) -> Option<BackupService> {
        self.database.as_ref().map(|database| {
            BackupService::new(
                self.layout.clone(),
                Arc::clone(database),
                Arc::clone(&self.runner),
            )
            .with_timeout(self.timeout)
        })
    }

    fn require_backups(&self) -> Result<BackupService> {
        match self.backups() {
            Some(backups) => Ok(backups),
            None => bail!("no database configured; pass --database-url or set DATABASE_URL"),
        }
    }

    fn lock_manager(&self) -> LockManager {
        LockManager::new(&self.layout).with_max_age(self.config.project.lock_max_age_secs)
    }

    fn git(&self) -> GitOps {
        GitOps::new(
            self.layout.root(),
            &self.config.project,
            Arc::clone(&self.runner),
            self.timeout,
        )
    }

    fn schema(&self) -> ConsoleSchemaOps {
        ConsoleSchemaOps::new(
            self.layout.root(),
            &self.config.project,
            Arc::clone(&self.runner),
            self.timeout,
        )
    }

    fn system(&self) -> SystemMaintenanceOps {
        SystemMaintenanceOps::new(
            self.layout.clone(),
            &self.config.project,
            Arc::clone(&self.runner),
            self.timeout,
        )
    }
}

pub(crate) fn resolve_project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let root = match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    if !root.is_dir() {
        bail!("project root is not a directory: {}", root.display());
    }
    Ok(root)
}

pub(crate) fn load_cli_config(
    layout: &ProjectLayout,
    explicit: Option<&Path>,
) -> Result<UpkeepConfig> {
    match explicit {
        Some(path) => {
            if !path.is_file() {
                bail!("config file not found: {}", path.display());
            }
            load_config(path)
        }
        None => load_config(&layout.config_path()),
    }
}

/// `--verbose`, or `verbose = true` in the `[update]` section of the config.
/// Config problems are left for the command itself to report.
pub(crate) fn resolve_verbose(cli: &Cli) -> bool {
    if cli.verbose {
        return true;
    }
    let Ok(root) = resolve_project_root(cli.project_root.as_deref()) else {
        return false;
    };
    load_cli_config(&ProjectLayout::new(root), cli.config.as_deref())
        .map(|config| config.update.verbose.unwrap_or(false))
        .unwrap_or(false)
}

/// Where step progress goes for one command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ProgressSink {
    Terminal,
    /// Log events on stderr only, so stdout carries nothing but the JSON document.
    Log,
}

impl ProgressSink {
    pub(crate) fn for_output(json: bool) -> Self {
        if json {
            Self::Log
        } else {
            Self::Terminal
        }
    }

    fn reporter(self, renderer: TerminalRenderer) -> Arc<dyn StepReporter> {
        match self {
            Self::Terminal => Arc::new(TerminalReporter::new(renderer)),
            Self::Log => Arc::new(TracingReporter),
        }
    }
}

/// Layers command-line flags over the `[update]` config section.
pub(crate) fn update_options(
    config: &UpkeepConfig,
    args: &UpdateArgs,
    verbose: bool,
) -> UpdateOptions {
    let mut options = UpdateOptions::from_section(&config.update);
    options.dry_run |= args.dry_run;
    options.skip_backup |= args.skip_backup;
    options.force_dependency_platform_override |= args.force_platform;
    options.verbose |= verbose;
    if let Some(days) = args.backup_retention_days {
        options.backup_retention_days = days;
    }
    if let Some(secs) = args.timeout {
        options.subprocess_timeout_seconds = secs;
    }
    options.assume_yes = args.yes;
    options
}

fn build_context(cli: &Cli, timeout_secs: Option<u64>) -> Result<CliContext> {
    let root = resolve_project_root(cli.project_root.as_deref())?;
    let layout = ProjectLayout::new(root);
    let config = load_cli_config(&layout, cli.config.as_deref())?;
    let mut defaults = UpdateOptions::from_section(&config.update);
    if let Some(secs) = timeout_secs {
        defaults.subprocess_timeout_seconds = secs;
    }
    let timeout = defaults.subprocess_timeout();
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(timeout));

    let database = match cli.database_url.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            let url = DatabaseUrl::parse(raw).context("failed to parse database url")?;
            let database: Arc<dyn Database> =
                Arc::new(CliDatabase::new(url, Arc::clone(&runner), timeout));
            Some(database)
        }
        _ => None,
    };

    Ok(CliContext {
        layout,
        config,
        database,
        runner,
        timeout,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{rendered}");
    Ok(())
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let renderer = TerminalRenderer::current();

    match &cli.command {
        Commands::Update(args) => {
            let ctx = build_context(&cli, args.timeout)?;
            let options = update_options(&ctx.config, args, cli.verbose);
            run_update_command(&ctx, options, renderer, cli.json)?;
        }
        Commands::Check => {
            let ctx = build_context(&cli, None)?;
            let report = ctx.validator().run_all();
            let summary = report.summary();
            if cli.json {
                print_json(&report)?;
            } else {
                renderer.print_section("Environment checks");
                let results = report.iter().cloned().collect::<Vec<_>>();
                renderer.print_lines(&format_validation_lines(
                    &results,
                    &summary,
                    renderer.style(),
                ));
            }
            if !summary.can_proceed {
                return Err(UpdateError::EnvironmentValidation {
                    failures: report.failures(),
                }
                .into());
            }
        }
        Commands::State { command } => {
            let ctx = build_context(&cli, None)?;
            let state = ctx.state_manager();
            match command {
                StateCommands::Show => match state.get_system_state()? {
                    Some(snapshot) if cli.json => print_json(&snapshot)?,
                    Some(snapshot) => {
                        renderer.print_lines(&format_snapshot_lines(&snapshot));
                        let validity = if state.has_valid_state() {
                            "valid"
                        } else {
                            "expired"
                        };
                        println!("saved state: {validity}");
                    }
                    None => println!("no saved state"),
                },
                StateCommands::Diff => {
                    let Some(saved) = state.get_system_state()? else {
                        bail!("no saved state to compare against");
                    };
                    let current = state.inspect_system_state()?;
                    let changes = SystemStateManager::compare_states(&saved, &current);
                    if cli.json {
                        print_json(&changes)?;
                    } else {
                        renderer.print_lines(&format_change_lines(&changes));
                    }
                }
                StateCommands::Clear => {
                    state.clear_state()?;
                    renderer.print_status("ok", "saved state cleared");
                }
            }
        }
        Commands::Backup { command } => {
            let ctx = build_context(&cli, None)?;
            let backups = ctx.require_backups()?;
            match command {
                BackupCommands::Create { retention_days } => {
                    let retention = retention_days.unwrap_or_else(|| {
                        UpdateOptions::from_section(&ctx.config.update).backup_retention_days
                    });
                    if cli.json {
                        print_json(&backups.create_database_backup(retention)?)?;
                    } else {
                        let progress = renderer.start_step("Creating database backup");
                        match backups.create_database_backup(retention) {
                            Ok(artifact) => {
                                progress.finish_success();
                                println!("backup: {}", artifact.path.display());
                            }
                            Err(err) => {
                                progress.finish_failure(&err.to_string());
                                return Err(err.into());
                            }
                        }
                    }
                }
                BackupCommands::List => {
                    let list = backups.list_backups()?;
                    if cli.json {
                        print_json(&list)?;
                    } else {
                        renderer.print_lines(&format_backup_lines(&list));
                    }
                }
                BackupCommands::Restore { path, yes } => {
                    let prompt = operator_prompt(*yes, renderer);
                    let question = format!(
                        "Restore the database from {}? Current data will be replaced.",
                        path.display()
                    );
                    if !prompt.confirm(&question) {
                        return Err(UpdateError::Aborted.into());
                    }
                    backups.restore_database_backup(path)?;
                    renderer.print_status(
                        "ok",
                        &format!("database restored from {}", path.display()),
                    );
                }
                BackupCommands::Validate { path } => {
                    if !backups.validate_backup(path) {
                        bail!("backup failed validation: {}", path.display());
                    }
                    renderer.print_status("ok", &format!("backup looks valid: {}", path.display()));
                }
            }
        }
        Commands::Lock { command } => {
            let ctx = build_context(&cli, None)?;
            let mut lock = ctx.lock_manager();
            match command {
                LockCommands::Status => {
                    let holder = lock.current_holder()?;
                    let active = holder
                        .as_ref()
                        .is_some_and(|record| lock.record_is_valid(record));
                    if cli.json {
                        print_json(&holder)?;
                    } else {
                        renderer.print_lines(&format_lock_lines(
                            holder.as_ref(),
                            active,
                            SystemClock.now_unix(),
                        ));
                    }
                }
                LockCommands::Release { force } => {
                    let holder = lock.current_holder()?;
                    match holder {
                        Some(record) if lock.record_is_valid(&record) && !force => bail!(
                            "update lock held by running pid {} on {}; pass --force to remove it",
                            record.pid,
                            record.hostname
                        ),
                        _ => {
                            if lock.force_release()? {
                                renderer.print_status("ok", "update lock removed");
                            } else {
                                println!("no update lock present");
                            }
                        }
                    }
                }
            }
        }
        Commands::Rollback { yes } => {
            let ctx = build_context(&cli, None)?;
            run_rollback_command(&ctx, *yes, renderer, cli.json)?;
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn operator_prompt(assume_yes: bool, renderer: TerminalRenderer) -> Arc<dyn OperatorPrompt> {
    if assume_yes {
        Arc::new(FixedAnswerPrompt(true))
    } else {
        Arc::new(TerminalPrompt::new(renderer))
    }
}

fn run_update_command(
    ctx: &CliContext,
    options: UpdateOptions,
    renderer: TerminalRenderer,
    json: bool,
) -> Result<()> {
    let git = Arc::new(ctx.git());
    let schema = Arc::new(ctx.schema());
    let system = Arc::new(ctx.system());
    let services = UpdateServices {
        lock: ctx.lock_manager(),
        validator: Arc::new(ctx.validator()),
        state: Arc::new(ctx.state_manager()),
        backups: ctx.backups().map(Arc::new),
        source: git,
        dependencies: Arc::new(ComposerOps::new(
            ctx.layout.root(),
            &ctx.config.project,
            Arc::clone(&ctx.runner),
            ctx.timeout,
        )),
        schema,
        system,
        reporter: ProgressSink::for_output(json).reporter(renderer),
        prompt: Arc::new(TerminalPrompt::new(renderer)),
    };

    if !json {
        renderer.print_section("Update");
    }
    let mut orchestrator = Orchestrator::new(services, options);
    match orchestrator.run()? {
        UpdateOutcome::Completed(report) => {
            if json {
                print_json(&report)?;
            } else {
                renderer.print_lines(&format_update_report_lines(&report, renderer.style()));
            }
        }
        UpdateOutcome::DryRun(preview) => {
            if json {
                print_json(&preview)?;
            } else {
                renderer.print_lines(&format_dry_run_lines(&preview, renderer.style()));
            }
        }
    }
    Ok(())
}

/// Complete rollback to the snapshot saved by the last update.
fn run_rollback_command(
    ctx: &CliContext,
    assume_yes: bool,
    renderer: TerminalRenderer,
    json: bool,
) -> Result<()> {
    let mut lock = ctx.lock_manager();
    lock.acquire()?;

    let state = Arc::new(ctx.state_manager());
    let Some(saved) = state.get_system_state()? else {
        lock.release()?;
        bail!("no saved state found; nothing to roll back to");
    };

    let prompt = operator_prompt(assume_yes, renderer);
    let mut rollback = RollbackService::new(
        Arc::new(ctx.git()),
        Arc::new(ctx.schema()),
        Arc::new(ctx.system()),
        Arc::clone(&state),
        Arc::clone(&prompt),
        ProgressSink::for_output(json).reporter(renderer),
    );
    if let Some(backups) = ctx.backups() {
        if let Some(latest) = backups.latest_valid_backup()? {
            rollback.set_last_backup(latest.path);
        }
        rollback = rollback.with_backups(Arc::new(backups));
    }
    if let Some(version) = saved.schema_version.clone() {
        rollback.register_schema_rollback(version);
    }

    if !json {
        renderer.print_section("Rollback");
        renderer.print_lines(&format_rollback_summary_lines(&rollback.rollback_summary()));
    }
    let question = format!(
        "Roll back to revision {}?",
        saved.source_revision.as_deref().unwrap_or("unknown")
    );
    if !prompt.confirm(&question) {
        lock.release()?;
        return Err(UpdateError::Aborted.into());
    }

    let outcome = rollback.perform_complete_rollback();
    lock.release()?;
    if json {
        print_json(&outcome)?;
    } else {
        renderer.print_lines(&format_rollback_lines(&outcome, renderer.style()));
    }

    if !outcome.is_clean() {
        return Err(UpdateError::RollbackFailure {
            warnings: outcome.warnings,
        }
        .into());
    }
    state.clear_state()?;
    Ok(())
}
