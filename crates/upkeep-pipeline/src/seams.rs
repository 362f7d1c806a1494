use tracing::{error, info, warn};

/// Receives progress of the atomic steps and operator-facing warnings.
pub trait StepReporter {
    fn step_started(&self, label: &str);
    fn step_succeeded(&self, label: &str);
    fn step_failed(&self, label: &str, error: &anyhow::Error);
    fn warning(&self, message: &str);
}

/// Asks the operator a yes/no question.
pub trait OperatorPrompt {
    fn confirm(&self, question: &str) -> bool;
}

/// Reporter that only emits log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl StepReporter for TracingReporter {
    fn step_started(&self, label: &str) {
        info!(step = label, "step started");
    }

    fn step_succeeded(&self, label: &str) {
        info!(step = label, "step finished");
    }

    fn step_failed(&self, label: &str, err: &anyhow::Error) {
        error!(step = label, error = %format!("{err:#}"), "step failed");
    }

    fn warning(&self, message: &str) {
        warn!("{message}");
    }
}

/// Prompt that answers every question the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswerPrompt(pub bool);

impl OperatorPrompt for FixedAnswerPrompt {
    fn confirm(&self, question: &str) -> bool {
        info!(question, answer = self.0, "operator prompt answered automatically");
        self.0
    }
}
