use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use upkeep_core::{run_checked, CommandRunner, CommandSpec, ProjectSettings};

use crate::DependencyOps;

pub struct ComposerOps {
    project_root: PathBuf,
    composer_binary: String,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ComposerOps {
    pub fn new(
        project_root: impl Into<PathBuf>,
        settings: &ProjectSettings,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            composer_binary: settings.composer_binary.clone(),
            runner,
            timeout,
        }
    }

    pub fn install_command(&self, force_platform_override: bool) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.composer_binary)
            .args([
                "install",
                "--no-dev",
                "--optimize-autoloader",
                "--prefer-dist",
                "--no-interaction",
                "--no-progress",
            ])
            .current_dir(&self.project_root)
            .env("COMPOSER_NO_INTERACTION", "1")
            .timeout(self.timeout);
        if force_platform_override {
            spec = spec.arg("--ignore-platform-reqs");
        }
        spec
    }
}

impl DependencyOps for ComposerOps {
    fn install(&self, force_platform_override: bool) -> Result<()> {
        if force_platform_override {
            warn!("installing dependencies with platform requirements ignored");
        }
        let spec = self.install_command(force_platform_override);
        run_checked(self.runner.as_ref(), &spec, "composer install failed")?;
        info!("dependencies installed");
        Ok(())
    }
}
