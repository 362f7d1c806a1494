use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Validating,
    StateCaptured,
    BackingUp,
    Pulling,
    DependencyInstall,
    SchemaMigrate,
    CacheClear,
    PermissionFixup,
    Done,
    RollingBack,
    Failed,
    DryRunPreview,
}

impl UpdatePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::StateCaptured => "state_captured",
            Self::BackingUp => "backing_up",
            Self::Pulling => "pulling",
            Self::DependencyInstall => "dependency_install",
            Self::SchemaMigrate => "schema_migrate",
            Self::CacheClear => "cache_clear",
            Self::PermissionFixup => "permission_fixup",
            Self::Done => "done",
            Self::RollingBack => "rolling_back",
            Self::Failed => "failed",
            Self::DryRunPreview => "dry_run_preview",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::DryRunPreview)
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
