use super::*;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::error::ErrorKind;
use clap::Parser;
use upkeep_core::{
    LockRecord, ProjectLayout, UpdateOptions, UpkeepConfig, ValidationResult, ValidationSummary,
};
use upkeep_pipeline::{DryRunPreview, RollbackOutcome};
use upkeep_state::StateChange;

use crate::dispatch::{
    load_cli_config, resolve_project_root, resolve_verbose, update_options, ProgressSink,
};
use crate::render::{
    format_change_lines, format_dry_run_lines, format_error_lines, format_lock_lines,
    format_rollback_lines, format_validation_lines, output_style_for, render_status_line,
    OutputStyle,
};
use crate::terminal::parse_confirmation;

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root(label: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "upkeep-cli-tests-{label}-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

#[test]
fn update_flags_parse_with_global_options() {
    let cli = Cli::try_parse_from([
        "upkeep",
        "--project-root",
        "/srv/panel",
        "update",
        "--dry-run",
        "--force-platform",
        "--backup-retention-days",
        "14",
        "--timeout",
        "900",
        "--verbose",
        "--yes",
    ])
    .expect("must parse update flags");

    assert_eq!(cli.project_root, Some(PathBuf::from("/srv/panel")));
    assert!(cli.verbose);
    let Commands::Update(args) = cli.command else {
        panic!("expected update command");
    };
    assert!(args.dry_run);
    assert!(args.force_platform);
    assert!(!args.skip_backup);
    assert_eq!(args.backup_retention_days, Some(14));
    assert_eq!(args.timeout, Some(900));
    assert!(args.yes);
}

#[test]
fn nested_subcommands_parse() {
    let cli = Cli::try_parse_from(["upkeep", "lock", "release", "--force"])
        .expect("must parse lock release");
    assert!(matches!(
        cli.command,
        Commands::Lock {
            command: LockCommands::Release { force: true }
        }
    ));

    let cli = Cli::try_parse_from(["upkeep", "backup", "restore", "var/backups/db.sql", "--yes"])
        .expect("must parse backup restore");
    match cli.command {
        Commands::Backup {
            command: BackupCommands::Restore { path, yes },
        } => {
            assert_eq!(path, PathBuf::from("var/backups/db.sql"));
            assert!(yes);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = Cli::try_parse_from(["upkeep", "state", "diff"]).expect("must parse state diff");
    assert!(matches!(
        cli.command,
        Commands::State {
            command: StateCommands::Diff
        }
    ));
}

#[test]
fn unknown_subcommand_is_rejected() {
    let err = Cli::try_parse_from(["upkeep", "upgrade"]).expect_err("must reject unknown command");
    assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
}

#[test]
fn backup_restore_requires_path() {
    let err = Cli::try_parse_from(["upkeep", "backup", "restore"])
        .expect_err("must require a backup path");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn update_options_layer_flags_over_config() {
    let config = UpkeepConfig::from_toml_str(
        r#"
[update]
skip-backup = true
backup-retention-days = 3
subprocess-timeout-seconds = 120
"#,
    )
    .expect("must parse config");

    let defaults = update_options(&config, &UpdateArgs::default(), false);
    assert!(defaults.skip_backup);
    assert_eq!(defaults.backup_retention_days, 3);
    assert_eq!(defaults.subprocess_timeout_seconds, 120);
    assert!(!defaults.assume_yes);

    let args = UpdateArgs {
        force_platform: true,
        backup_retention_days: Some(30),
        timeout: Some(45),
        yes: true,
        ..UpdateArgs::default()
    };
    let options = update_options(&config, &args, true);
    assert!(options.skip_backup, "config value must survive an unset flag");
    assert!(options.force_dependency_platform_override);
    assert_eq!(options.backup_retention_days, 30);
    assert_eq!(options.subprocess_timeout_seconds, 45);
    assert!(options.verbose);
    assert!(options.assume_yes);
}

#[test]
fn update_options_default_without_config() {
    let options = update_options(&UpkeepConfig::default(), &UpdateArgs::default(), false);
    assert_eq!(options, UpdateOptions::default());
}

#[test]
fn config_defaults_when_project_file_missing() {
    let root = test_root("config-missing");
    let layout = ProjectLayout::new(&root);
    let config = load_cli_config(&layout, None).expect("missing project config must default");
    assert_eq!(config, UpkeepConfig::default());

    let explicit = root.join("elsewhere.toml");
    let err = load_cli_config(&layout, Some(explicit.as_path())).expect_err("explicit path must exist");
    assert!(err.to_string().contains("config file not found"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn config_reads_project_section() {
    let root = test_root("config-project");
    let layout = ProjectLayout::new(&root);
    fs::write(
        layout.config_path(),
        "[project]\ndeploy-branch = \"stable\"\nweb-user = \"www-data\"\n",
    )
    .expect("must write config");

    let config = load_cli_config(&layout, None).expect("must load project config");
    assert_eq!(config.project.deploy_branch, "stable");
    assert_eq!(config.project.web_user.as_deref(), Some("www-data"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn project_root_must_be_a_directory() {
    let root = test_root("root-file");
    let file = root.join("not-a-dir");
    fs::write(&file, "x").expect("must write file");

    let err = resolve_project_root(Some(file.as_path())).expect_err("file root must be rejected");
    assert!(err.to_string().contains("not a directory"));
    assert_eq!(
        resolve_project_root(Some(root.as_path())).expect("directory root must resolve"),
        root
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn exit_codes_follow_error_kind() {
    let aborted = anyhow::Error::new(UpdateError::Aborted);
    assert_eq!(exit_code_for(&aborted), 130);

    let validation = anyhow::Error::new(UpdateError::EnvironmentValidation {
        failures: vec!["git: not a repository".to_string()],
    });
    assert_eq!(exit_code_for(&validation), 3);

    let plain = anyhow::anyhow!("something else");
    assert_eq!(exit_code_for(&plain), 1);
}

#[test]
fn confirmation_accepts_only_yes() {
    assert!(parse_confirmation("y\n"));
    assert!(parse_confirmation("  YES "));
    assert!(!parse_confirmation("\n"));
    assert!(!parse_confirmation("no"));
    assert!(!parse_confirmation("yep"));
}

#[test]
fn output_style_is_plain_without_terminal_or_with_no_color() {
    assert_eq!(output_style_for(true, false), OutputStyle::Rich);
    assert_eq!(output_style_for(false, false), OutputStyle::Plain);
    assert_eq!(output_style_for(true, true), OutputStyle::Plain);
}

#[test]
fn status_lines_render_badges_only_in_rich_mode() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "backup created"),
        "backup created"
    );
    assert_eq!(
        render_status_line(OutputStyle::Plain, "warn", "backup skipped"),
        "warning: backup skipped"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "backup created"),
        "[OK] backup created"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "fail", "migrations"),
        "[FAIL] migrations"
    );
}

#[test]
fn validation_lines_include_details_and_verdict() {
    let results = vec![
        ValidationResult::ok("disk_space", "2.0 GiB free"),
        ValidationResult::warning("git", "2 uncommitted change(s) will be stashed")
            .with_details(vec!["M config/app.yaml".to_string()]),
    ];
    let summary = ValidationSummary {
        total: 2,
        passed: 1,
        warnings: 1,
        failed: 0,
        can_proceed: true,
    };

    let lines = format_validation_lines(&results, &summary, OutputStyle::Rich);
    assert_eq!(lines[0], "[OK] disk_space: 2.0 GiB free");
    assert_eq!(lines[1], "[WARN] git: 2 uncommitted change(s) will be stashed");
    assert_eq!(lines[2], "    M config/app.yaml");
    assert_eq!(lines[3], "checks: 2 total, 1 passed, 1 warnings, 0 failed");
    assert_eq!(lines[4], "environment ready for update");
}

#[test]
fn change_lines_show_before_and_after() {
    assert_eq!(format_change_lines(&[]), vec!["no changes".to_string()]);
    let changes = vec![StateChange {
        field: "source_revision".to_string(),
        before: Some("abc123".to_string()),
        after: None,
    }];
    assert_eq!(
        format_change_lines(&changes),
        vec!["source_revision: abc123 -> unknown".to_string()]
    );
}

#[test]
fn lock_lines_distinguish_stale_holders() {
    assert_eq!(format_lock_lines(None, false, 100), vec!["unlocked".to_string()]);
    let record = LockRecord {
        pid: 4242,
        timestamp: 1_000,
        hostname: "web-1".to_string(),
    };
    assert_eq!(
        format_lock_lines(Some(&record), true, 1_090),
        vec!["locked: pid 4242 on web-1 for 90s".to_string()]
    );
    assert_eq!(
        format_lock_lines(Some(&record), false, 5_000),
        vec!["stale lock: pid 4242 on web-1 for 4000s".to_string()]
    );
}

#[test]
fn dry_run_lines_number_planned_steps() {
    let preview = DryRunPreview {
        results: vec![ValidationResult::ok("git", "clean")],
        summary: ValidationSummary {
            total: 1,
            passed: 1,
            warnings: 0,
            failed: 0,
            can_proceed: true,
        },
        snapshot: None,
        lock_holder: None,
        backups: Vec::new(),
        planned_steps: vec![
            "Creating database backup".to_string(),
            "Pulling latest code".to_string(),
        ],
    };

    let lines = format_dry_run_lines(&preview, OutputStyle::Plain);
    assert_eq!(lines[0], "dry run: no changes will be made");
    assert!(lines.contains(&"existing backups: 0".to_string()));
    assert!(lines.contains(&"  1. Creating database backup".to_string()));
    assert_eq!(lines.last().map(String::as_str), Some("  2. Pulling latest code"));
}

#[test]
fn rollback_lines_report_warnings() {
    let outcome = RollbackOutcome {
        steps_run: vec!["clear cache".to_string()],
        warnings: vec!["no valid backup available; database was not restored".to_string()],
    };
    let lines = format_rollback_lines(&outcome, OutputStyle::Plain);
    assert_eq!(lines[0], "ran: clear cache");
    assert_eq!(
        lines[1],
        "warning: no valid backup available; database was not restored"
    );
    assert_eq!(lines[2], "rollback completed with 1 warning(s)");
}

#[test]
fn verbose_can_come_from_config() {
    let root = test_root("verbose-config");
    let root_arg = root.to_string_lossy().into_owned();

    let cli = Cli::try_parse_from(["upkeep", "--project-root", &root_arg, "check"])
        .expect("must parse check");
    assert!(!resolve_verbose(&cli));

    fs::write(root.join("upkeep.toml"), "[update]\nverbose = true\n").expect("must write config");
    assert!(resolve_verbose(&cli));

    let flagged = Cli::try_parse_from(["upkeep", "--project-root", "/nonexistent/panel", "-v", "check"])
        .expect("must parse check");
    assert!(resolve_verbose(&flagged));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn json_output_keeps_progress_off_stdout() {
    assert_eq!(ProgressSink::for_output(true), ProgressSink::Log);
    assert_eq!(ProgressSink::for_output(false), ProgressSink::Terminal);
}

#[test]
fn step_failure_lines_show_rollback_warnings_and_backup() {
    let err = anyhow::Error::new(UpdateError::StepExecution {
        step: "Running database migrations".to_string(),
        source: anyhow::anyhow!("migration Version20240301 failed"),
        rollback_warnings: vec!["database restore from var/backups/db.sql skipped by operator".to_string()],
        backup_path: Some(PathBuf::from("var/backups/db_2024-03-01_12-00-00.sql")),
    });

    let lines = format_error_lines(&err, OutputStyle::Plain);
    assert_eq!(
        lines,
        vec![
            "error: step 'Running database migrations' failed: migration Version20240301 failed"
                .to_string(),
            "warning: rollback: database restore from var/backups/db.sql skipped by operator"
                .to_string(),
            "database backup kept at var/backups/db_2024-03-01_12-00-00.sql".to_string(),
        ]
    );

    let plain = anyhow::anyhow!("disk full").context("failed writing lock");
    assert_eq!(
        format_error_lines(&plain, OutputStyle::Plain),
        vec!["error: failed writing lock: disk full".to_string()]
    );
}
