use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info, warn};
use upkeep_core::{run_checked, CommandOutput, CommandRunner, CommandSpec, ProjectSettings};

use crate::SourceControlOps;

const STASH_MESSAGE: &str = "upkeep: local changes before update";

#[derive(Debug, Default)]
struct GitRunState {
    stashed: bool,
    pre_pull_revision: Option<String>,
}

pub struct GitOps {
    repo_root: PathBuf,
    git_binary: String,
    branch: String,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    run_state: Mutex<GitRunState>,
}

impl GitOps {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        settings: &ProjectSettings,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            git_binary: settings.git_binary.clone(),
            branch: settings.deploy_branch.clone(),
            runner,
            timeout,
            run_state: Mutex::new(GitRunState::default()),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Revision recorded right before the last successful `pull`.
    pub fn pre_pull_revision(&self) -> Option<String> {
        self.run_state
            .lock()
            .ok()
            .and_then(|state| state.pre_pull_revision.clone())
    }

    fn base_git_command(&self) -> CommandSpec {
        let mut command = CommandSpec::new(&self.git_binary)
            .args(["-c", "core.autocrlf=false", "-c", "core.eol=lf"]);
        if cfg!(windows) {
            command = command.args(["-c", "core.longpaths=true"]);
        }
        command.current_dir(&self.repo_root).timeout(self.timeout)
    }

    fn run_git(&self, args: &[&str]) -> Result<CommandOutput> {
        let spec = self.base_git_command().args(args.iter().copied());
        run_checked(
            self.runner.as_ref(),
            &spec,
            &format!("git {} failed", args.join(" ")),
        )
    }

    fn probe_git(&self, args: &[&str]) -> bool {
        let spec = self.base_git_command().args(args.iter().copied());
        match self.runner.run(&spec) {
            Ok(output) => output.success(),
            Err(err) => {
                debug!(args = ?args, error = %err, "git probe could not run");
                false
            }
        }
    }

    fn with_run_state<T>(&self, f: impl FnOnce(&mut GitRunState) -> T) -> Result<T> {
        let mut state = self
            .run_state
            .lock()
            .map_err(|_| anyhow!("git run state poisoned"))?;
        Ok(f(&mut state))
    }
}

impl SourceControlOps for GitOps {
    fn ensure_safe_directory(&self) -> Result<()> {
        let root = self.repo_root.to_string_lossy().into_owned();
        let spec = self
            .base_git_command()
            .args(["config", "--global", "--get-all", "safe.directory"]);
        let registered = match self.runner.run(&spec) {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .map(str::trim)
                .any(|entry| entry == "*" || entry == root),
            _ => false,
        };
        if registered {
            debug!(path = %root, "repository already marked safe");
            return Ok(());
        }
        self.run_git(&["config", "--global", "--add", "safe.directory", &root])?;
        info!(path = %root, "marked repository as safe directory");
        Ok(())
    }

    fn stash(&self) -> Result<bool> {
        if !self.has_uncommitted_changes()? {
            debug!("working tree clean, nothing to stash");
            return Ok(false);
        }
        self.run_git(&["stash", "push", "--include-untracked", "-m", STASH_MESSAGE])?;
        self.with_run_state(|state| state.stashed = true)?;
        info!("stashed local changes");
        Ok(true)
    }

    fn pull(&self) -> Result<()> {
        let before = self.current_revision()?;
        self.run_git(&["fetch", "origin", &self.branch])?;
        self.run_git(&["pull", "--ff-only", "origin", &self.branch])?;
        let after = self.current_revision()?;
        info!(from = %before, to = %after, branch = %self.branch, "pulled latest code");
        self.with_run_state(|state| state.pre_pull_revision = Some(before))?;
        Ok(())
    }

    fn apply_stash(&self) -> Result<()> {
        if !self.is_stashed() {
            return Ok(());
        }
        self.run_git(&["stash", "pop"])?;
        self.with_run_state(|state| state.stashed = false)?;
        info!("re-applied stashed changes");
        Ok(())
    }

    fn rollback(&self, to_revision: Option<&str>) -> Result<()> {
        let target = match to_revision {
            Some(revision) => revision.to_string(),
            None => match self.pre_pull_revision() {
                Some(revision) => revision,
                None => bail!("no revision recorded to roll back to"),
            },
        };
        if !self.revision_exists(&target) {
            bail!("revision {target} is not present in local history");
        }
        self.run_git(&["reset", "--hard", &target])?;
        warn!(revision = %target, "source reset to earlier revision");
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        self.pre_pull_revision().is_some()
            || self.probe_git(&["rev-parse", "--verify", "--quiet", "HEAD~1"])
    }

    fn is_stashed(&self) -> bool {
        self.run_state
            .lock()
            .map(|state| state.stashed)
            .unwrap_or(false)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        let output = self.run_git(&["status", "--porcelain"])?;
        Ok(!output.stdout_trimmed().is_empty())
    }

    fn current_revision(&self) -> Result<String> {
        let output = self.run_git(&["rev-parse", "HEAD"])?;
        let revision = output.stdout_trimmed();
        if revision.is_empty() {
            bail!("git rev-parse HEAD returned no revision");
        }
        Ok(revision.to_string())
    }

    fn current_branch(&self) -> Result<String> {
        let output = self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(output.stdout_trimmed().to_string())
    }

    fn revision_exists(&self, revision: &str) -> bool {
        self.probe_git(&["cat-file", "-e", &format!("{revision}^{{commit}}")])
    }
}
