use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use upkeep_core::{run_checked, CommandRunner, CommandSpec, ProjectLayout, ProjectSettings};

use crate::SystemOps;

pub struct SystemMaintenanceOps {
    layout: ProjectLayout,
    php_binary: String,
    console_path: String,
    web_user: Option<String>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SystemMaintenanceOps {
    pub fn new(
        layout: ProjectLayout,
        settings: &ProjectSettings,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            layout,
            php_binary: settings.php_binary.clone(),
            console_path: settings.console_path.clone(),
            web_user: settings.web_user.clone(),
            runner,
            timeout,
        }
    }

    /// Owner argument handed to `chown`: the configured web user, else the owner of
    /// the project root.
    pub fn ownership_target(&self) -> Option<String> {
        if let Some(user) = &self.web_user {
            return Some(format!("{user}:"));
        }
        root_owner(&self.layout)
    }

    fn existing(&self, dirs: Vec<PathBuf>) -> Vec<String> {
        dirs.into_iter()
            .filter(|dir| dir.is_dir())
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect()
    }

    fn purge_cache_dirs(&self) -> Result<usize> {
        let cache_dir = self.layout.cache_dir();
        let entries = match fs::read_dir(&cache_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading {}", cache_dir.display()));
            }
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed reading {}", cache_dir.display()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }
}

impl SystemOps for SystemMaintenanceOps {
    fn clear_cache(&self) -> Result<()> {
        let spec = CommandSpec::new(&self.php_binary)
            .arg(&self.console_path)
            .args(["cache:clear", "--no-warmup", "--no-interaction"])
            .current_dir(self.layout.root())
            .timeout(self.timeout);
        match run_checked(self.runner.as_ref(), &spec, "cache:clear failed") {
            Ok(_) => {
                info!("application cache cleared");
                Ok(())
            }
            Err(err) => {
                warn!(
                    error = %format!("{err:#}"),
                    "console cache clear failed, removing cache directories"
                );
                let removed = self.purge_cache_dirs()?;
                info!(removed, "cache directories removed");
                Ok(())
            }
        }
    }

    fn adjust_permissions(&self) -> Result<()> {
        for dir in [self.layout.cache_dir(), self.layout.log_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        if cfg!(windows) {
            debug!("skipping permission fix-up on windows");
            return Ok(());
        }

        let writable = self.existing(vec![self.layout.var_dir()]);
        if !writable.is_empty() {
            let spec = CommandSpec::new("chmod")
                .args(["-R", "ug+rwX"])
                .args(writable)
                .timeout(self.timeout);
            run_checked(self.runner.as_ref(), &spec, "failed to adjust permissions")?;
        }

        let readable = self.existing(vec![self.layout.public_dir(), self.layout.vendor_dir()]);
        if !readable.is_empty() {
            let spec = CommandSpec::new("chmod")
                .args(["-R", "a+rX"])
                .args(readable)
                .timeout(self.timeout);
            run_checked(self.runner.as_ref(), &spec, "failed to adjust permissions")?;
        }
        info!("permissions adjusted");
        Ok(())
    }

    fn restore_ownership(&self) -> Result<()> {
        if cfg!(windows) {
            return Ok(());
        }
        let Some(owner) = self.ownership_target() else {
            debug!("no ownership target known, leaving file ownership alone");
            return Ok(());
        };
        let targets = self.existing(vec![
            self.layout.var_dir(),
            self.layout.public_dir(),
            self.layout.vendor_dir(),
        ]);
        if targets.is_empty() {
            return Ok(());
        }
        let spec = CommandSpec::new("chown")
            .arg("-R")
            .arg(&owner)
            .args(targets)
            .timeout(self.timeout);
        run_checked(self.runner.as_ref(), &spec, "failed to restore file ownership")?;
        info!(owner = %owner, "file ownership restored");
        Ok(())
    }
}

#[cfg(unix)]
fn root_owner(layout: &ProjectLayout) -> Option<String> {
    use std::os::unix::fs::MetadataExt;

    let metadata = fs::metadata(layout.root()).ok()?;
    Some(format!("{}:{}", metadata.uid(), metadata.gid()))
}

#[cfg(not(unix))]
fn root_owner(_layout: &ProjectLayout) -> Option<String> {
    None
}
