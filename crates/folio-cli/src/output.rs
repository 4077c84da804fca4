//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use folio_core::{ChapterSummary, TranslationVersion};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    /// Print the chapter listing
    pub fn print_summaries(&self, summaries: &[ChapterSummary]) {
        match self.format {
            OutputFormat::Human => {
                if summaries.is_empty() {
                    println!("No chapters found.");
                    return;
                }
                for summary in summaries {
                    let number = summary
                        .chapter_number
                        .map(|n| format!("{:>4}", n))
                        .unwrap_or_else(|| "   -".to_string());
                    let marker = match (summary.has_translation, summary.has_images) {
                        (true, true) => "T+I",
                        (true, false) => "T  ",
                        _ => "   ",
                    };
                    let title = summary
                        .translated_title
                        .as_deref()
                        .unwrap_or(&summary.title);
                    println!("{} | {} | {}", number, marker, truncate(title, 60));
                }
                println!("\n{} chapter(s)", summaries.len());
            }
            OutputFormat::Json => self.print_json(summaries),
            OutputFormat::Quiet => {
                for summary in summaries {
                    println!("{}", summary.stable_id);
                }
            }
        }
    }

    /// Print a chapter's translation history
    pub fn print_versions(&self, versions: &[TranslationVersion]) {
        match self.format {
            OutputFormat::Human => {
                if versions.is_empty() {
                    println!("No translations found.");
                    return;
                }
                for version in versions {
                    println!(
                        "{} v{:<3} {} | {}/{} | {}",
                        if version.is_active { "*" } else { " " },
                        version.version,
                        version.created_at.format("%Y-%m-%d %H:%M"),
                        version.provider,
                        version.model,
                        truncate(&version.translated_title, 40)
                    );
                }
                println!("\n{} version(s)", versions.len());
            }
            OutputFormat::Json => self.print_json(versions),
            OutputFormat::Quiet => {
                for version in versions {
                    println!("{}", version.id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer chapter title", 10), "a longe...");
        // Multi-byte titles are cut on character boundaries
        assert_eq!(truncate("第一章 始まりの物語", 6), "第一章...");
    }
}
