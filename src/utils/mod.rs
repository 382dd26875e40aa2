//! Utilities module for logging, error handling, and formatting helpers
//!
//! This module provides:
//! - Structured logging with tracing
//! - Error handling types
//! - General helper functions used by the CLI and round logger

pub mod error;
pub mod logging;

// Re-export main types for convenience
pub use error::{MilError, Result, ResultExt};
pub use logging::init_logging;

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}

/// Format a fraction as a percentage of a count, e.g. `"12 (4.0%)"`
pub fn format_share(count: usize, total: usize) -> String {
    if total == 0 {
        return format!("{} (0.0%)", count);
    }
    format!("{} ({:.1}%)", count, 100.0 * count as f64 / total as f64)
}

/// Format a percentage with a progress bar
pub fn format_progress_bar(progress: f64, width: usize) -> String {
    let filled = (progress.clamp(0.0, 1.0) * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);

    format!(
        "[{}{}] {:.1}%",
        "█".repeat(filled),
        "░".repeat(empty),
        progress * 100.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.5), "30.5s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m");
    }

    #[test]
    fn test_format_share() {
        assert_eq!(format_share(1, 4), "1 (25.0%)");
        assert_eq!(format_share(0, 0), "0 (0.0%)");
    }

    #[test]
    fn test_format_progress_bar() {
        let bar = format_progress_bar(0.5, 10);
        assert!(bar.contains("50.0%"));
        assert!(bar.contains("█████"));
    }
}
