//! Output helpers for consistent CLI formatting

use crate::monitor::Severity;
use console::{style, StyledObject};

/// Display a section header
pub fn section(title: &str) {
    println!();
    println!("{}", style(title).bold());
}

/// Display a success step
pub fn step_ok(message: &str) {
    println!("  {} {}", style("[OK]").green(), message);
}

/// Display a success step with detail
pub fn step_ok_detail(message: &str, detail: &str) {
    println!("  {} {} ({})", style("[OK]").green(), message, style(detail).dim());
}

/// Display an info step
pub fn step_info(message: &str) {
    println!("  {} {}", style("[INFO]").cyan(), message);
}

/// Display a warning step with hint
pub fn step_warn_hint(message: &str, hint: &str) {
    println!("  {} {} - {}", style("[WARN]").yellow(), message, style(hint).dim());
}

/// Display an aligned key/value line
pub fn key_value(key: &str, value: &str) {
    println!("  {:<18} {}", style(key).dim(), value);
}

/// Severity label colored by gravity
pub fn severity_label(severity: Severity) -> StyledObject<String> {
    let label = severity.to_string().to_uppercase();
    match severity {
        Severity::Info => style(label).cyan(),
        Severity::Warning => style(label).yellow(),
        Severity::Error => style(label).red(),
        Severity::Fatal => style(label).red().bold(),
    }
}
