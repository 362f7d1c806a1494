mod orchestrator;
mod phase;
mod rollback;
mod seams;

pub use orchestrator::{
    DryRunPreview, Orchestrator, UpdateOutcome, UpdateReport, UpdateServices, FORWARD_STEPS,
    STEP_CACHE, STEP_DEPENDENCIES, STEP_MIGRATIONS, STEP_PERMISSIONS, STEP_PULL, STEP_STASH,
};
pub use phase::UpdatePhase;
pub use rollback::{RollbackOutcome, RollbackService, RollbackSummary};
pub use seams::{FixedAnswerPrompt, OperatorPrompt, StepReporter, TracingReporter};
