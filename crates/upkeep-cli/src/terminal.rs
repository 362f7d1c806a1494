use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Mutex;

use tracing::warn;
use upkeep_pipeline::{OperatorPrompt, StepReporter};

use crate::render::{render_status_line, StepProgress, TerminalRenderer};

/// Renders step progress on stdout.
pub(crate) struct TerminalReporter {
    renderer: TerminalRenderer,
    active: Mutex<Option<StepProgress>>,
}

impl TerminalReporter {
    pub(crate) fn new(renderer: TerminalRenderer) -> Self {
        Self {
            renderer,
            active: Mutex::new(None),
        }
    }

    fn take_active(&self, label: &str) -> Option<StepProgress> {
        let mut active = self.active.lock().ok()?;
        match active.take() {
            Some(progress) if progress.label() == label => Some(progress),
            other => {
                *active = other;
                None
            }
        }
    }
}

impl StepReporter for TerminalReporter {
    fn step_started(&self, label: &str) {
        let progress = self.renderer.start_step(label);
        if let Ok(mut active) = self.active.lock() {
            *active = Some(progress);
        }
    }

    fn step_succeeded(&self, label: &str) {
        match self.take_active(label) {
            Some(progress) => progress.finish_success(),
            None => self.renderer.print_status("ok", label),
        }
    }

    fn step_failed(&self, label: &str, err: &anyhow::Error) {
        let detail = format!("{err:#}");
        match self.take_active(label) {
            Some(progress) => progress.finish_failure(&detail),
            None => self
                .renderer
                .print_status("fail", &format!("{label}: {detail}")),
        }
    }

    fn warning(&self, message: &str) {
        self.renderer.print_status("warn", message);
    }
}

/// Asks on stderr and reads the answer from stdin. Without a terminal every
/// question is answered "no".
pub(crate) struct TerminalPrompt {
    renderer: TerminalRenderer,
}

impl TerminalPrompt {
    pub(crate) fn new(renderer: TerminalRenderer) -> Self {
        Self { renderer }
    }
}

impl OperatorPrompt for TerminalPrompt {
    fn confirm(&self, question: &str) -> bool {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            warn!(question, "no terminal attached, answering no");
            eprintln!(
                "{}",
                render_status_line(
                    self.renderer.style(),
                    "warn",
                    &format!("{question} (answered no: not a terminal, pass --yes to proceed)")
                )
            );
            return false;
        }

        let mut stderr = io::stderr();
        if write!(stderr, "{question} [y/N] ").is_err() || stderr.flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match stdin.lock().read_line(&mut answer) {
            Ok(_) => parse_confirmation(&answer),
            Err(err) => {
                warn!(error = %err, "failed reading confirmation");
                false
            }
        }
    }
}

pub(crate) fn parse_confirmation(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
