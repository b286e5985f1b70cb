use anyhow::{Context, Result};
use colored::Colorize;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.len()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a step indicator
pub fn step(num: usize, total: usize, msg: &str) {
    println!("{} {}", format!("[{}/{}]", num, total).blue().bold(), msg);
}

/// Ask the operator to confirm before mutating the host.
///
/// Unattended runs never prompt and always proceed.
pub fn confirm(prompt: &str, unattended: bool) -> Result<bool> {
    if unattended {
        return Ok(true);
    }

    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

/// Singular/plural label for a count, e.g. "1 warning" / "3 warnings"
pub fn count_label(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_label_singular() {
        assert_eq!(count_label(1, "warning"), "1 warning");
    }

    #[test]
    fn test_count_label_plural() {
        assert_eq!(count_label(0, "finding"), "0 findings");
        assert_eq!(count_label(3, "finding"), "3 findings");
    }

    #[test]
    fn test_confirm_unattended_never_prompts() {
        assert!(confirm("proceed?", true).unwrap());
    }
}
