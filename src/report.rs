//! Report artifacts written into the session directory.
//!
//! Rendering is pure (`render_*` return strings); [`ReportWriter::write_all`]
//! only puts them on disk. Missing values are empty CSV cells and `-` in the
//! text report, never zero.

use crate::aggregate::{AggregatedPoint, ScalingAnalysis};
use crate::results::{RawResults, ScalingLaw, VariantStatus};
use crate::utils::format_optional;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

pub const STRONG_CSV: &str = "strong_scaling.csv";
pub const WEAK_CSV: &str = "weak_scaling.csv";
pub const STARTUP_CSV: &str = "startup_times.csv";
pub const TEXT_REPORT: &str = "report.txt";

const SCALING_COLUMNS: &str = "num_clients,variant,throughput_mean,throughput_stdev,latency_mean,latency_stdev,speedup_throughput,speedup_latency,efficiency_throughput,efficiency_latency";

/// Per-law CSV; the weak table additionally carries `total_messages`.
pub fn render_scaling_csv(points: &[AggregatedPoint], law: ScalingLaw) -> String {
    let mut out = String::from(SCALING_COLUMNS);
    if law == ScalingLaw::Weak {
        out.push_str(",total_messages");
    }
    out.push('\n');

    for p in points.iter().filter(|p| p.scaling_law == law) {
        let _ = write!(
            out,
            "{},{},{},{},{},{},{},{},{},{}",
            p.num_clients,
            p.variant,
            format_optional(p.throughput_mean),
            format_optional(p.throughput_stdev),
            format_optional(p.latency_mean),
            format_optional(p.latency_stdev),
            format_optional(p.speedup_throughput),
            format_optional(p.speedup_latency),
            format_optional(p.efficiency_throughput),
            format_optional(p.efficiency_latency),
        );
        if law == ScalingLaw::Weak {
            let _ = write!(out, ",{}", p.total_messages);
        }
        out.push('\n');
    }
    out
}

/// `variant,startup_time_seconds` for every variant that did not fail.
pub fn render_startup_csv(raw: &RawResults) -> String {
    let mut out = String::from("variant,startup_time_seconds\n");
    for outcome in raw.outcomes.iter().filter(|o| !o.is_failed()) {
        let _ = writeln!(
            out,
            "{},{}",
            outcome.variant,
            format_optional(outcome.startup_time_seconds)
        );
    }
    out
}

fn cell(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.*}", precision, v),
        _ => "-".to_string(),
    }
}

fn heading(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{}", title);
    let _ = writeln!(out, "{}", "-".repeat(title.len()));
}

fn scaling_table(out: &mut String, title: &str, points: &[AggregatedPoint]) {
    heading(out, title);
    if points.is_empty() {
        let _ = writeln!(out, "  (no data)");
        return;
    }
    let _ = writeln!(
        out,
        "{:>7}  {:<18} {:>8} {:>14} {:>10} {:>12} {:>9} {:>10} {:>10} {:>8} {:>8} {:>6}",
        "clients",
        "variant",
        "total",
        "throughput",
        "stdev",
        "latency_ms",
        "stdev",
        "speedup_t",
        "speedup_l",
        "eff_t",
        "eff_l",
        "failed"
    );
    for p in points {
        let _ = writeln!(
            out,
            "{:>7}  {:<18} {:>8} {:>14} {:>10} {:>12} {:>9} {:>10} {:>10} {:>8} {:>8} {:>6}",
            p.num_clients,
            p.variant,
            p.total_messages,
            cell(p.throughput_mean, 2),
            cell(p.throughput_stdev, 2),
            cell(p.latency_mean, 3),
            cell(p.latency_stdev, 3),
            cell(p.speedup_throughput, 3),
            cell(p.speedup_latency, 3),
            cell(p.efficiency_throughput, 3),
            cell(p.efficiency_latency, 3),
            format!("{}/{}", p.failed_runs, p.run_count),
        );
    }
}

/// Human-readable summary of a session.
pub fn render_text_report(raw: &RawResults, analysis: &ScalingAnalysis) -> String {
    let meta = &raw.metadata;
    let settings = &meta.settings;
    let mut out = String::new();

    let _ = writeln!(out, "Scaling Benchmark Report");
    let _ = writeln!(out, "========================");
    let _ = writeln!(out, "Generated:        {}", meta.timestamp.to_rfc3339());
    let _ = writeln!(out, "Tool version:     {}", meta.version);
    let _ = writeln!(
        out,
        "System:           {} {} ({} cores)",
        meta.system_info.os, meta.system_info.architecture, meta.system_info.cpu_cores
    );
    let _ = writeln!(out, "Host:             {}", settings.host);
    let _ = writeln!(out, "Baseline:         {}", settings.baseline);
    let _ = writeln!(out, "Repetitions:      {}", settings.repetitions);
    let _ = writeln!(out, "Strong total:     {} messages", settings.strong_total);
    let _ = writeln!(out, "Weak per client:  {} messages", settings.weak_per_client);
    let _ = writeln!(
        out,
        "Client counts:    {}",
        settings
            .client_counts
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = writeln!(out, "Total runs:       {}", meta.total_runs);

    heading(&mut out, "Variant status");
    for outcome in &raw.outcomes {
        match &outcome.status {
            VariantStatus::Completed => {
                let _ = writeln!(
                    out,
                    "  {:<18} completed ({} runs)",
                    outcome.variant, outcome.run_count
                );
            }
            VariantStatus::Failed { stage, reason } => {
                let _ = writeln!(
                    out,
                    "  {:<18} FAILED at {} after {} runs: {}",
                    outcome.variant, stage, outcome.run_count, reason
                );
            }
        }
    }
    if raw.outcomes.iter().any(|o| o.is_failed()) {
        let _ = writeln!(out, "  Failed variants are excluded from the scaling tables.");
    }

    heading(&mut out, &format!("Startup overhead (vs {})", analysis.baseline));
    let _ = writeln!(
        out,
        "  {:<18} {:>12} {:>13} {:>8}",
        "variant", "startup_s", "overhead_s", "ratio"
    );
    for s in &analysis.startup {
        let _ = writeln!(
            out,
            "  {:<18} {:>12} {:>13} {:>8}",
            s.variant,
            cell(s.startup_time_seconds, 2),
            cell(s.overhead_seconds, 2),
            cell(s.ratio, 2),
        );
    }

    scaling_table(&mut out, "Strong scaling (constant total work)", &analysis.strong);
    scaling_table(&mut out, "Weak scaling (constant work per client)", &analysis.weak);

    let _ = writeln!(
        out,
        "\nSpeedup above 1 means the variant outperformed {} at the same client count.",
        analysis.baseline
    );
    out
}

/// Writes the CSV and text artifacts of a session.
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.output_dir.join(name);
        std::fs::write(&path, contents).with_context(|| format!("cannot write {}", path.display()))?;
        Ok(path)
    }

    /// Write every derived artifact and return their paths.
    pub fn write_all(&self, raw: &RawResults, analysis: &ScalingAnalysis) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("cannot create {}", self.output_dir.display()))?;

        let written = vec![
            self.write(STRONG_CSV, &render_scaling_csv(&analysis.strong, ScalingLaw::Strong))?,
            self.write(WEAK_CSV, &render_scaling_csv(&analysis.weak, ScalingLaw::Weak))?,
            self.write(STARTUP_CSV, &render_startup_csv(raw))?,
            self.write(TEXT_REPORT, &render_text_report(raw, analysis))?,
        ];
        for path in &written {
            info!("Wrote {}", path.display());
        }
        Ok(written)
    }
}
