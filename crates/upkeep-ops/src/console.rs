use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};
use upkeep_core::{run_checked, CommandRunner, CommandSpec, ProjectSettings};
use upkeep_state::parse_schema_version;

use crate::SchemaOps;

/// Schema migrations driven through the application console.
pub struct ConsoleSchemaOps {
    project_root: PathBuf,
    php_binary: String,
    console_path: String,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ConsoleSchemaOps {
    pub fn new(
        project_root: impl Into<PathBuf>,
        settings: &ProjectSettings,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            php_binary: settings.php_binary.clone(),
            console_path: settings.console_path.clone(),
            runner,
            timeout,
        }
    }

    fn console_command(&self, command: &str) -> CommandSpec {
        CommandSpec::new(&self.php_binary)
            .arg(&self.console_path)
            .arg(command)
            .current_dir(&self.project_root)
            .timeout(self.timeout)
    }
}

impl SchemaOps for ConsoleSchemaOps {
    fn migrate(&self) -> Result<()> {
        let spec = self
            .console_command("doctrine:migrations:migrate")
            .args(["--no-interaction", "--allow-no-migration"]);
        run_checked(self.runner.as_ref(), &spec, "database migration failed")?;
        info!("database migrations applied");
        Ok(())
    }

    fn rollback(&self, target_version: Option<&str>) -> Result<()> {
        let target = target_version.unwrap_or("prev");
        let spec = self
            .console_command("doctrine:migrations:migrate")
            .arg(target)
            .args(["--no-interaction", "--allow-no-migration"]);
        run_checked(
            self.runner.as_ref(),
            &spec,
            &format!("schema rollback to {target} failed"),
        )?;
        warn!(version = target, "database schema rolled back");
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        match self.current_version() {
            Ok(Some(version)) => version != "0",
            Ok(None) => false,
            Err(err) => {
                debug!(error = %format!("{err:#}"), "schema version unavailable");
                false
            }
        }
    }

    fn current_version(&self) -> Result<Option<String>> {
        let spec = self
            .console_command("doctrine:migrations:current")
            .arg("--no-interaction");
        let output = run_checked(
            self.runner.as_ref(),
            &spec,
            "failed reading current schema version",
        )?;
        Ok(parse_schema_version(&output.stdout))
    }
}
