use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use upkeep_core::{
    BackupArtifact, LockRecord, SystemStateSnapshot, UpdateError, ValidationResult,
    ValidationStatus, ValidationSummary,
};
use upkeep_pipeline::{DryRunPreview, RollbackOutcome, RollbackSummary, UpdateReport};
use upkeep_state::StateChange;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

/// A running step: a spinner in rich mode, just a start time otherwise.
pub(crate) struct StepProgress {
    style: OutputStyle,
    label: String,
    spinner: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_step(self, label: &str) -> StepProgress {
        let spinner = if self.style == OutputStyle::Rich {
            let spinner = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}")
            {
                spinner.set_style(style.tick_chars(step_tick_chars(label)));
            }
            spinner.set_message(label.to_string());
            spinner.enable_steady_tick(Duration::from_millis(80));
            Some(spinner)
        } else {
            println!("{}", render_status_line(self.style, "step", label));
            None
        };

        StepProgress {
            style: self.style,
            label: label.to_string(),
            spinner,
            started_at: Instant::now(),
        }
    }
}

impl StepProgress {
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn finish_success(mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        let message = format!(
            "{} ({})",
            self.label,
            format_elapsed(self.started_at.elapsed())
        );
        println!("{}", render_status_line(self.style, "ok", &message));
    }

    pub(crate) fn finish_failure(mut self, detail: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        let message = format!("{}: {detail}", self.label);
        println!("{}", render_status_line(self.style, "fail", &message));
    }
}

impl Drop for StepProgress {
    fn drop(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    output_style_for(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty()),
    )
}

pub(crate) fn output_style_for(is_terminal: bool, no_color: bool) -> OutputStyle {
    if is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => match status {
            "warn" => format!("warning: {message}"),
            "error" | "fail" => format!("error: {message}"),
            _ => message.to_string(),
        },
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> String {
    match status {
        "ok" => "[OK]".to_string(),
        "warn" => "[WARN]".to_string(),
        "error" | "fail" => "[FAIL]".to_string(),
        "step" => "[..]".to_string(),
        "skip" => "[SKIP]".to_string(),
        other => format!("[{}]", other.to_ascii_uppercase()),
    }
}

fn validation_status_key(status: ValidationStatus) -> &'static str {
    match status {
        ValidationStatus::Ok => "ok",
        ValidationStatus::Warning => "warn",
        ValidationStatus::Error => "fail",
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn step_tick_chars(label: &str) -> &'static str {
    match label {
        "Pulling latest code" => "<^>v ",
        "Installing dependencies" => ".oO@* ",
        "Running database migrations" => "-=~* ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}

fn or_unknown(value: Option<&str>) -> &str {
    value.unwrap_or("unknown")
}

pub(crate) fn format_validation_lines(
    results: &[ValidationResult],
    summary: &ValidationSummary,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = Vec::new();
    for result in results {
        lines.push(render_status_line(
            style,
            validation_status_key(result.status),
            &format!("{}: {}", result.check_name, result.message),
        ));
        lines.extend(result.details.iter().map(|detail| format!("    {detail}")));
    }
    lines.push(format!(
        "checks: {} total, {} passed, {} warnings, {} failed",
        summary.total, summary.passed, summary.warnings, summary.failed
    ));
    lines.push(if summary.can_proceed {
        "environment ready for update".to_string()
    } else {
        "environment not ready for update".to_string()
    });
    lines
}

pub(crate) fn format_snapshot_lines(snapshot: &SystemStateSnapshot) -> Vec<String> {
    vec![
        format!("captured_at: {}", snapshot.timestamp),
        format!(
            "revision: {}",
            or_unknown(snapshot.source_revision.as_deref())
        ),
        format!("branch: {}", or_unknown(snapshot.source_branch.as_deref())),
        format!(
            "dependency_lock: {}",
            or_unknown(snapshot.dependency_lock_hash.as_deref())
        ),
        format!(
            "schema_version: {}",
            or_unknown(snapshot.schema_version.as_deref())
        ),
        format!("app_version: {}", snapshot.app_version),
        format!(
            "runtime_version: {}",
            or_unknown(snapshot.runtime_version.as_deref())
        ),
        format!("environment: {}", snapshot.environment),
        format!(
            "cache: exists={} writable={} size={}",
            snapshot.cache_state.exists,
            snapshot.cache_state.writable,
            HumanBytes(snapshot.cache_state.size_bytes)
        ),
    ]
}

pub(crate) fn format_change_lines(changes: &[StateChange]) -> Vec<String> {
    if changes.is_empty() {
        return vec!["no changes".to_string()];
    }
    changes
        .iter()
        .map(|change| {
            format!(
                "{}: {} -> {}",
                change.field,
                or_unknown(change.before.as_deref()),
                or_unknown(change.after.as_deref())
            )
        })
        .collect()
}

pub(crate) fn format_backup_lines(backups: &[BackupArtifact]) -> Vec<String> {
    if backups.is_empty() {
        return vec!["no backups".to_string()];
    }
    backups
        .iter()
        .map(|backup| {
            format!(
                "{} {} {}",
                backup.file_name(),
                HumanBytes(backup.size_bytes),
                if backup.valid { "valid" } else { "invalid" }
            )
        })
        .collect()
}

pub(crate) fn format_lock_lines(
    holder: Option<&LockRecord>,
    active: bool,
    now: u64,
) -> Vec<String> {
    match holder {
        None => vec!["unlocked".to_string()],
        Some(record) => vec![
            format!(
                "{}: pid {} on {} for {}s",
                if active { "locked" } else { "stale lock" },
                record.pid,
                record.hostname,
                record.age_secs(now)
            ),
        ],
    }
}

pub(crate) fn format_update_report_lines(report: &UpdateReport, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "update finished: {} step(s) completed",
            report.completed_steps.len()
        ),
    )];
    if let Some(backup) = &report.backup {
        lines.push(format!("backup: {}", backup.path.display()));
    }
    lines.extend(
        report
            .validation_warnings
            .iter()
            .map(|warning| render_status_line(style, "warn", warning)),
    );
    lines.push("changes:".to_string());
    lines.extend(
        format_change_lines(&report.changes)
            .into_iter()
            .map(|line| format!("  {line}")),
    );
    lines
}

pub(crate) fn format_dry_run_lines(preview: &DryRunPreview, style: OutputStyle) -> Vec<String> {
    let mut lines = vec!["dry run: no changes will be made".to_string()];
    lines.extend(format_validation_lines(
        &preview.results,
        &preview.summary,
        style,
    ));
    if let Some(holder) = &preview.lock_holder {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "update lock held by pid {} on {}",
                holder.pid, holder.hostname
            ),
        ));
    }
    if let Some(snapshot) = &preview.snapshot {
        lines.push("current state:".to_string());
        lines.extend(
            format_snapshot_lines(snapshot)
                .into_iter()
                .map(|line| format!("  {line}")),
        );
    }
    lines.push(format!("existing backups: {}", preview.backups.len()));
    lines.push("planned steps:".to_string());
    lines.extend(
        preview
            .planned_steps
            .iter()
            .enumerate()
            .map(|(index, step)| format!("  {}. {step}", index + 1)),
    );
    lines
}

pub(crate) fn format_rollback_lines(outcome: &RollbackOutcome, style: OutputStyle) -> Vec<String> {
    let mut lines: Vec<String> = outcome
        .steps_run
        .iter()
        .map(|step| format!("ran: {step}"))
        .collect();
    lines.extend(
        outcome
            .warnings
            .iter()
            .map(|warning| render_status_line(style, "warn", warning)),
    );
    lines.push(if outcome.is_clean() {
        "rollback completed".to_string()
    } else {
        format!("rollback completed with {} warning(s)", outcome.warnings.len())
    });
    lines
}

pub(crate) fn format_rollback_summary_lines(summary: &RollbackSummary) -> Vec<String> {
    vec![
        format!("saved state: {}", if summary.has_saved_state { "yes" } else { "no" }),
        format!(
            "saved revision: {}",
            or_unknown(summary.saved_revision.as_deref())
        ),
        format!(
            "saved schema version: {}",
            or_unknown(summary.saved_schema_version.as_deref())
        ),
        format!(
            "backup: {}",
            summary
                .last_backup
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        ),
    ]
}

/// The failure line, followed by what a failed run left behind.
pub(crate) fn format_error_lines(err: &anyhow::Error, style: OutputStyle) -> Vec<String> {
    let update_error = err.downcast_ref::<UpdateError>();
    let headline = match update_error {
        Some(UpdateError::Other(_)) | None => format!("{err:#}"),
        Some(typed) => typed.to_string(),
    };
    let mut lines = vec![render_status_line(style, "error", &headline)];
    if let Some(UpdateError::StepExecution {
        rollback_warnings,
        backup_path,
        ..
    }) = update_error
    {
        lines.extend(
            rollback_warnings
                .iter()
                .map(|warning| render_status_line(style, "warn", &format!("rollback: {warning}"))),
        );
        if let Some(path) = backup_path {
            lines.push(format!("database backup kept at {}", path.display()));
        }
    }
    lines
}
