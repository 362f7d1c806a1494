use super::*;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use upkeep_core::{ProjectLayout, ProjectSettings, ScriptedRunner};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "upkeep-ops-tests-{label}-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn git_ops(runner: Arc<ScriptedRunner>) -> GitOps {
    GitOps::new(
        "/srv/panel",
        &ProjectSettings::default(),
        runner,
        Duration::from_secs(30),
    )
}

#[test]
fn git_commands_disable_line_ending_conversion() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.succeed("git", &["rev-parse", "HEAD"], "abc123\n");
    let git = git_ops(runner.clone());

    assert_eq!(git.current_revision().expect("must read revision"), "abc123");
    let calls = runner.calls();
    assert!(calls[0].has_args(&["-c", "core.autocrlf=false"]));
    assert_eq!(
        calls[0].current_dir.as_deref(),
        Some(std::path::Path::new("/srv/panel"))
    );
}

#[test]
fn stash_only_when_working_tree_is_dirty() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.succeed("git", &["status", "--porcelain"], "");
    let git = git_ops(runner.clone());

    assert!(!git.stash().expect("clean stash must succeed"));
    assert!(!git.is_stashed());
    assert!(!runner.was_called("git", &["stash", "push"]));

    runner.succeed("git", &["status", "--porcelain"], " M config/packages/app.yaml\n");
    assert!(git.stash().expect("dirty stash must succeed"));
    assert!(git.is_stashed());
    assert!(runner.was_called("git", &["stash", "push", "--include-untracked"]));

    git.apply_stash().expect("must pop stash");
    assert!(!git.is_stashed());
    git.apply_stash().expect("second apply must be a no-op");
    assert_eq!(runner.call_count("git", &["stash", "pop"]), 1);
}

#[test]
fn pull_records_revision_for_rollback() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.succeed("git", &["rev-parse", "HEAD"], "1111111\n");
    runner.fail("git", &["rev-parse", "--verify", "--quiet", "HEAD~1"], "");
    let git = git_ops(runner.clone());

    assert!(!git.can_rollback());
    git.rollback(None)
        .expect_err("rollback without a recorded revision must fail");

    git.pull().expect("pull must succeed");
    assert!(runner.was_called("git", &["pull", "--ff-only", "origin", "main"]));
    assert_eq!(git.pre_pull_revision().as_deref(), Some("1111111"));
    assert!(git.can_rollback());

    git.rollback(None).expect("rollback must succeed");
    assert!(runner.was_called("git", &["reset", "--hard", "1111111"]));
}

#[test]
fn rollback_refuses_unknown_revision() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.fail("git", &["cat-file", "-e"], "fatal: Not a valid object name");
    let git = git_ops(runner.clone());

    let err = git
        .rollback(Some("deadbeef"))
        .expect_err("unknown revision must fail");
    assert!(err.to_string().contains("deadbeef"), "{err}");
    assert!(!runner.was_called("git", &["reset", "--hard"]));
}

#[test]
fn pull_failure_surfaces_git_stderr() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.succeed("git", &["rev-parse", "HEAD"], "1111111\n");
    runner.fail("git", &["pull"], "fatal: Not possible to fast-forward, aborting.");
    let git = git_ops(runner);

    let err = git.pull().expect_err("pull must fail");
    assert!(err.to_string().contains("fast-forward"), "{err}");
    assert!(git.pre_pull_revision().is_none());
}

#[test]
fn ensure_safe_directory_adds_missing_entry_once() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.succeed("git", &["--get-all", "safe.directory"], "/srv/other\n");
    let git = git_ops(runner.clone());
    git.ensure_safe_directory().expect("must register directory");
    assert!(runner.was_called("git", &["--add", "safe.directory", "/srv/panel"]));

    let runner = Arc::new(ScriptedRunner::new());
    runner.succeed("git", &["--get-all", "safe.directory"], "/srv/panel\n");
    let git = git_ops(runner.clone());
    git.ensure_safe_directory().expect("must accept registered directory");
    assert!(!runner.was_called("git", &["--add"]));
}

#[test]
fn composer_install_honors_platform_override() {
    let runner = Arc::new(ScriptedRunner::new());
    let composer = ComposerOps::new(
        "/srv/panel",
        &ProjectSettings::default(),
        runner.clone(),
        Duration::from_secs(30),
    );

    composer.install(false).expect("install must succeed");
    composer.install(true).expect("forced install must succeed");
    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].has_args(&["install", "--no-dev"]));
    assert!(!calls[0].has_args(&["--ignore-platform-reqs"]));
    assert!(calls[1].has_args(&["--ignore-platform-reqs"]));

    runner.fail("composer", &["install"], "Your requirements could not be resolved");
    let err = composer.install(false).expect_err("install must fail");
    assert!(err.to_string().contains("could not be resolved"), "{err}");
}

fn schema_ops(runner: Arc<ScriptedRunner>) -> ConsoleSchemaOps {
    ConsoleSchemaOps::new(
        "/srv/panel",
        &ProjectSettings::default(),
        runner,
        Duration::from_secs(30),
    )
}

#[test]
fn schema_migrate_and_rollback_use_console() {
    let runner = Arc::new(ScriptedRunner::new());
    let schema = schema_ops(runner.clone());

    schema.migrate().expect("migrate must succeed");
    schema
        .rollback(Some("DoctrineMigrations\\Version20240101000000"))
        .expect("targeted rollback must succeed");
    schema.rollback(None).expect("step rollback must succeed");

    assert!(runner.was_called(
        "php",
        &["bin/console", "doctrine:migrations:migrate", "--no-interaction"]
    ));
    assert!(runner.was_called(
        "php",
        &["doctrine:migrations:migrate", "DoctrineMigrations\\Version20240101000000"]
    ));
    assert!(runner.was_called("php", &["doctrine:migrations:migrate", "prev"]));
}

#[test]
fn schema_can_rollback_only_past_initial_version() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.succeed("php", &["doctrine:migrations:current"], "0\n");
    let schema = schema_ops(runner.clone());
    assert_eq!(
        schema.current_version().expect("must read version").as_deref(),
        Some("0")
    );
    assert!(!schema.can_rollback());

    runner.succeed(
        "php",
        &["doctrine:migrations:current"],
        "DoctrineMigrations\\Version20240101000000\n",
    );
    assert!(schema.can_rollback());

    runner.fail("php", &["doctrine:migrations:current"], "database unreachable");
    assert!(!schema.can_rollback());
}

#[test]
fn clear_cache_falls_back_to_removing_cache_dirs() {
    let root = test_root("clear-cache");
    let layout = ProjectLayout::new(&root);
    fs::create_dir_all(layout.cache_dir().join("prod/pools")).expect("must create cache");
    fs::write(layout.state_path(), "{}").expect("must write state file");

    let runner = Arc::new(ScriptedRunner::new());
    runner.fail("php", &["cache:clear"], "Fatal error: Allowed memory size exhausted");
    let ops = SystemMaintenanceOps::new(
        layout.clone(),
        &ProjectSettings::default(),
        runner.clone(),
        Duration::from_secs(30),
    );

    ops.clear_cache().expect("fallback must succeed");
    assert!(runner.was_called("php", &["bin/console", "cache:clear"]));
    assert!(!layout.cache_dir().join("prod").exists());
    assert!(layout.state_path().exists(), "state file must survive cache clear");

    let _ = fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn permission_fixup_targets_existing_dirs_and_web_user() {
    let root = test_root("permissions");
    let layout = ProjectLayout::new(&root);
    fs::create_dir_all(layout.public_dir()).expect("must create public dir");

    let runner = Arc::new(ScriptedRunner::new());
    let settings = ProjectSettings {
        web_user: Some("www-data".to_string()),
        ..ProjectSettings::default()
    };
    let ops = SystemMaintenanceOps::new(
        layout.clone(),
        &settings,
        runner.clone(),
        Duration::from_secs(30),
    );

    ops.adjust_permissions().expect("must adjust permissions");
    assert!(layout.cache_dir().is_dir());
    assert!(layout.log_dir().is_dir());
    let var_dir = layout.var_dir().to_string_lossy().into_owned();
    let public_dir = layout.public_dir().to_string_lossy().into_owned();
    assert!(runner.was_called("chmod", &["ug+rwX", &var_dir]));
    assert!(runner.was_called("chmod", &["a+rX", &public_dir]));

    ops.restore_ownership().expect("must restore ownership");
    assert!(runner.was_called("chown", &["-R", "www-data:", &var_dir, &public_dir]));

    let _ = fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn ownership_defaults_to_project_root_owner() {
    use std::os::unix::fs::MetadataExt;

    let root = test_root("ownership");
    let ops = SystemMaintenanceOps::new(
        ProjectLayout::new(&root),
        &ProjectSettings::default(),
        Arc::new(ScriptedRunner::new()),
        Duration::from_secs(30),
    );
    let metadata = fs::metadata(&root).expect("must stat root");
    assert_eq!(
        ops.ownership_target(),
        Some(format!("{}:{}", metadata.uid(), metadata.gid()))
    );

    let _ = fs::remove_dir_all(&root);
}
