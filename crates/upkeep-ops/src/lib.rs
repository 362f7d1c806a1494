//! Collaborators that perform the individual update operations.
//!
//! Each trait is the contract the pipeline consumes; the bundled
//! implementations shell out through a [`upkeep_core::CommandRunner`].

use anyhow::Result;

mod composer;
mod console;
mod git;
mod system;

pub use composer::ComposerOps;
pub use console::ConsoleSchemaOps;
pub use git::GitOps;
pub use system::SystemMaintenanceOps;

pub trait SourceControlOps {
    /// Marks the project root as a trusted repository for the current user.
    fn ensure_safe_directory(&self) -> Result<()>;
    /// Stashes local modifications. Returns whether anything was stashed.
    fn stash(&self) -> Result<bool>;
    fn pull(&self) -> Result<()>;
    /// Re-applies changes stashed by this instance; a no-op otherwise.
    fn apply_stash(&self) -> Result<()>;
    /// Hard-resets to `to_revision`, or to the revision recorded before `pull`.
    fn rollback(&self, to_revision: Option<&str>) -> Result<()>;
    fn can_rollback(&self) -> bool;
    fn is_stashed(&self) -> bool;
    fn has_uncommitted_changes(&self) -> Result<bool>;
    fn current_revision(&self) -> Result<String>;
    fn current_branch(&self) -> Result<String>;
    fn revision_exists(&self, revision: &str) -> bool;
}

pub trait DependencyOps {
    fn install(&self, force_platform_override: bool) -> Result<()>;
}

pub trait SchemaOps {
    fn migrate(&self) -> Result<()>;
    /// Migrates down to `target_version`, or one version back when `None`.
    fn rollback(&self, target_version: Option<&str>) -> Result<()>;
    fn can_rollback(&self) -> bool;
    fn current_version(&self) -> Result<Option<String>>;
}

pub trait SystemOps {
    fn clear_cache(&self) -> Result<()>;
    fn adjust_permissions(&self) -> Result<()>;
    fn restore_ownership(&self) -> Result<()>;
}

#[cfg(test)]
mod tests;
