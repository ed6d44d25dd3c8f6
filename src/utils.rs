//! # Utility Functions Module
//!
//! Small helpers shared by the orchestrator: session identifiers, human
//! readable durations, port validation and the optional-value formatting
//! used by every report artifact.

use anyhow::Result;
use std::time::Duration;

/// Generate a short unique identifier for a benchmark session
///
/// The identifier is the first eight hex digits of a v4 UUID. It is appended
/// to the timestamped session directory so two sessions started within the
/// same second never share an output directory.
pub fn generate_session_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Format a duration for log output
///
/// Chooses the largest unit that keeps the value readable:
/// - below one second: milliseconds
/// - below one minute: seconds with two decimals
/// - otherwise: minutes and seconds
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60.0 {
        format!("{:.2}s", secs)
    } else {
        let minutes = duration.as_secs() / 60;
        let rest = duration.as_secs() % 60;
        format!("{}m{:02}s", minutes, rest)
    }
}

/// Validate that a port number is usable without privileges
///
/// Ports below 1024 need root to bind; variants started without elevation
/// could never come up on them, so they are rejected at configuration time.
pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        anyhow::bail!("Port number {} is too low (below 1024)", port);
    }
    Ok(())
}

/// Render an optional measurement for CSV and text output
///
/// Absent values become an empty string. They are never rendered as zero,
/// which downstream plotting would read as a real measurement.
pub fn format_optional(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.4}", v),
        _ => String::new(),
    }
}
