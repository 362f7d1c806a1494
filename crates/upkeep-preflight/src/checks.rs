use std::collections::BTreeSet;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use upkeep_core::{ValidationResult, ValidationStatus};

const MIB: u64 = 1024 * 1024;

pub const DISK_ERROR_BYTES: u64 = 100 * MIB;
pub const DISK_WARNING_BYTES: u64 = 200 * MIB;
pub const MEMORY_ERROR_BYTES: u64 = 128 * MIB;
pub const MEMORY_WARNING_BYTES: u64 = 256 * MIB;

pub const REQUIRED_EXTENSIONS: &[&str] = &["ctype", "iconv", "json", "mbstring", "pdo", "xml"];
pub const RECOMMENDED_EXTENSIONS: &[&str] = &["curl", "intl", "opcache", "zip"];

pub fn classify_disk_space(free_bytes: u64) -> ValidationResult {
    let free = format_mib(free_bytes);
    if free_bytes < DISK_ERROR_BYTES {
        ValidationResult::error(
            "disk_space",
            format!("only {free} free, at least {} required", format_mib(DISK_ERROR_BYTES)),
        )
    } else if free_bytes < DISK_WARNING_BYTES {
        ValidationResult::warning(
            "disk_space",
            format!("{free} free, {} recommended", format_mib(DISK_WARNING_BYTES)),
        )
    } else {
        ValidationResult::ok("disk_space", format!("{free} free"))
    }
}

/// Available bytes from POSIX `df -Pk` output.
pub fn parse_df_available_bytes(output: &str) -> Result<u64> {
    let line = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| anyhow!("df produced no output"))?;
    let available = line
        .split_whitespace()
        .nth(3)
        .ok_or_else(|| anyhow!("unexpected df output line: '{line}'"))?;
    let kib = available
        .parse::<u64>()
        .with_context(|| format!("invalid available block count: '{available}'"))?;
    Ok(kib.saturating_mul(1024))
}

/// Parses a runtime memory limit such as `256M`. `Ok(None)` means unlimited.
pub fn parse_memory_limit(raw: &str) -> Result<Option<u64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty memory limit");
    }
    if raw.starts_with('-') {
        return Ok(None);
    }
    let (digits, multiplier) = match raw.chars().last().map(|ch| ch.to_ascii_uppercase()) {
        Some('K') => (&raw[..raw.len() - 1], 1024),
        Some('M') => (&raw[..raw.len() - 1], MIB),
        Some('G') => (&raw[..raw.len() - 1], 1024 * MIB),
        _ => (raw, 1),
    };
    let value = digits
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid memory limit: '{raw}'"))?;
    Ok(Some(value.saturating_mul(multiplier)))
}

pub fn classify_memory_limit(limit: Option<u64>) -> ValidationResult {
    let Some(bytes) = limit else {
        return ValidationResult::ok("memory_limit", "memory limit is unlimited");
    };
    let current = format_mib(bytes);
    if bytes < MEMORY_ERROR_BYTES {
        ValidationResult::error(
            "memory_limit",
            format!(
                "memory limit {current} is below the required {}",
                format_mib(MEMORY_ERROR_BYTES)
            ),
        )
    } else if bytes < MEMORY_WARNING_BYTES {
        ValidationResult::warning(
            "memory_limit",
            format!(
                "memory limit {current} is below the recommended {}",
                format_mib(MEMORY_WARNING_BYTES)
            ),
        )
    } else {
        ValidationResult::ok("memory_limit", format!("memory limit {current}"))
    }
}

/// Severity of a failed composer diagnostic. Output that only carries warnings
/// or a stale lock notice is downgraded to a warning.
pub fn classify_composer_failure(output: &str) -> ValidationStatus {
    let lower = output.to_ascii_lowercase();
    let zero_errors = Regex::new(r"\b0 errors?\b").ok();
    let mentions_error = lower.lines().any(|line| match &zero_errors {
        Some(pattern) => pattern.replace_all(line, "").contains("error"),
        None => line.contains("error"),
    });
    let benign = lower.contains("warning")
        || lower.contains("not up to date")
        || lower.contains("lock file");
    if !mentions_error && benign {
        ValidationStatus::Warning
    } else {
        ValidationStatus::Error
    }
}

/// Lowercased module names from `php -m`.
pub fn parse_php_modules(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('['))
        .map(|line| match line.to_ascii_lowercase().as_str() {
            "zend opcache" => "opcache".to_string(),
            other => other.to_string(),
        })
        .collect()
}

fn format_mib(bytes: u64) -> String {
    format!("{}MB", bytes / MIB)
}
