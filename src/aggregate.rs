//! # Aggregation
//!
//! Reduces repeated runs to one [`AggregatedPoint`] per
//! `(variant, scaling law, client count)` and compares every point with the
//! baseline variant's point for the same law and client count.
//!
//! - Mean and stdev are computed per metric over that metric's non-null
//!   samples only. Stdev is the sample stdev (n - 1); a single sample has
//!   stdev 0.
//! - Throughput speedup is `variant / baseline`, latency speedup is
//!   `baseline / variant`, so above 1 always means the variant did better.
//! - Efficiency is `speedup / num_clients`.
//! - Anything that cannot be computed stays `None`. Nothing defaults to 0 or 1.

use crate::results::{RunRecord, ScalingLaw, VariantOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Aggregate of all runs sharing `(variant, scaling_law, num_clients)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPoint {
    pub variant: String,
    pub scaling_law: ScalingLaw,
    pub num_clients: u32,
    /// Configured total for this grid point
    pub total_messages: u64,
    /// All contributing runs, failed ones included
    pub run_count: usize,
    pub failed_runs: usize,
    pub throughput_mean: Option<f64>,
    pub throughput_stdev: Option<f64>,
    pub latency_mean: Option<f64>,
    pub latency_stdev: Option<f64>,
    pub speedup_throughput: Option<f64>,
    pub speedup_latency: Option<f64>,
    pub efficiency_throughput: Option<f64>,
    pub efficiency_latency: Option<f64>,
}

/// Mean and sample standard deviation; `None` for no samples.
pub fn mean_stdev(samples: &[f64]) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() == 1 {
        return Some((mean, 0.0));
    }
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, variance.sqrt()))
}

fn split(stats: Option<(f64, f64)>) -> (Option<f64>, Option<f64>) {
    match stats {
        Some((mean, stdev)) => (Some(mean), Some(stdev)),
        None => (None, None),
    }
}

/// Group records and reduce each group.
///
/// Output is ordered by first appearance of the variant, then strong before
/// weak, then ascending client count.
pub fn aggregate(records: &[RunRecord]) -> Vec<AggregatedPoint> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: BTreeMap<(usize, ScalingLaw, u32), Vec<&RunRecord>> = BTreeMap::new();

    for record in records {
        let index = match order.iter().position(|v| *v == record.variant) {
            Some(i) => i,
            None => {
                order.push(&record.variant);
                order.len() - 1
            }
        };
        groups
            .entry((index, record.scaling_law, record.num_clients))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|((index, law, num_clients), runs)| {
            let throughput: Vec<f64> = runs.iter().filter_map(|r| r.metrics.throughput).collect();
            let latency: Vec<f64> = runs.iter().filter_map(|r| r.metrics.avg_latency_ms).collect();
            let (throughput_mean, throughput_stdev) = split(mean_stdev(&throughput));
            let (latency_mean, latency_stdev) = split(mean_stdev(&latency));

            AggregatedPoint {
                variant: order[index].to_string(),
                scaling_law: law,
                num_clients,
                total_messages: runs.iter().map(|r| r.total_messages).max().unwrap_or(0),
                run_count: runs.len(),
                failed_runs: runs.iter().filter(|r| !r.succeeded).count(),
                throughput_mean,
                throughput_stdev,
                latency_mean,
                latency_stdev,
                speedup_throughput: None,
                speedup_latency: None,
                efficiency_throughput: None,
                efficiency_latency: None,
            }
        })
        .collect()
}

/// Higher is better: `variant / baseline`.
pub fn speedup_throughput(variant: Option<f64>, baseline: Option<f64>) -> Option<f64> {
    match (variant, baseline) {
        (Some(v), Some(b)) if b > 0.0 && v.is_finite() => Some(v / b),
        _ => None,
    }
}

/// Lower is better: `baseline / variant`.
pub fn speedup_latency(variant: Option<f64>, baseline: Option<f64>) -> Option<f64> {
    match (variant, baseline) {
        (Some(v), Some(b)) if v > 0.0 && b.is_finite() => Some(b / v),
        _ => None,
    }
}

pub fn efficiency(speedup: Option<f64>, num_clients: u32) -> Option<f64> {
    match speedup {
        Some(s) if num_clients > 0 => Some(s / f64::from(num_clients)),
        _ => None,
    }
}

/// The baseline variant's points indexed by `(law, num_clients)`.
#[derive(Debug, Clone, Default)]
pub struct BaselineReference {
    pub variant: String,
    points: HashMap<(ScalingLaw, u32), AggregatedPoint>,
}

impl BaselineReference {
    pub fn from_points(variant: &str, points: &[AggregatedPoint]) -> Self {
        Self {
            variant: variant.to_string(),
            points: points
                .iter()
                .filter(|p| p.variant == variant)
                .map(|p| ((p.scaling_law, p.num_clients), p.clone()))
                .collect(),
        }
    }

    pub fn get(&self, law: ScalingLaw, num_clients: u32) -> Option<&AggregatedPoint> {
        self.points.get(&(law, num_clients))
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Second pass: fill speedup and efficiency from the baseline.
pub fn apply_baseline(points: &mut [AggregatedPoint], baseline: &BaselineReference) {
    for point in points.iter_mut() {
        let reference = baseline.get(point.scaling_law, point.num_clients);
        let base_throughput = reference.and_then(|b| b.throughput_mean);
        let base_latency = reference.and_then(|b| b.latency_mean);

        point.speedup_throughput = speedup_throughput(point.throughput_mean, base_throughput);
        point.speedup_latency = speedup_latency(point.latency_mean, base_latency);
        point.efficiency_throughput = efficiency(point.speedup_throughput, point.num_clients);
        point.efficiency_latency = efficiency(point.speedup_latency, point.num_clients);
    }
}

/// Startup time of one variant next to the baseline's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupComparison {
    pub variant: String,
    pub startup_time_seconds: Option<f64>,
    /// `variant - baseline`
    pub overhead_seconds: Option<f64>,
    /// `variant / baseline`
    pub ratio: Option<f64>,
}

pub fn compare_startup(outcomes: &[VariantOutcome], baseline: &str) -> Vec<StartupComparison> {
    let base = outcomes
        .iter()
        .find(|o| o.variant == baseline)
        .and_then(|o| o.startup_time_seconds);

    outcomes
        .iter()
        .map(|o| {
            let startup = o.startup_time_seconds;
            let (overhead_seconds, ratio) = match (startup, base) {
                (Some(s), Some(b)) => (Some(s - b), if b > 0.0 { Some(s / b) } else { None }),
                _ => (None, None),
            };
            StartupComparison {
                variant: o.variant.clone(),
                startup_time_seconds: startup,
                overhead_seconds,
                ratio,
            }
        })
        .collect()
}

/// Everything the report writer renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingAnalysis {
    pub baseline: String,
    pub strong: Vec<AggregatedPoint>,
    pub weak: Vec<AggregatedPoint>,
    pub startup: Vec<StartupComparison>,
}

/// Aggregate, compare with the baseline and split by scaling law.
///
/// Variants whose outcome is `Failed` are left out entirely; a failed
/// baseline therefore leaves every speedup empty.
pub fn analyze(records: &[RunRecord], outcomes: &[VariantOutcome], baseline: &str) -> ScalingAnalysis {
    let failed: HashSet<&str> = outcomes
        .iter()
        .filter(|o| o.is_failed())
        .map(|o| o.variant.as_str())
        .collect();
    let usable: Vec<RunRecord> = records
        .iter()
        .filter(|r| !failed.contains(r.variant.as_str()))
        .cloned()
        .collect();

    let mut points = aggregate(&usable);
    let reference = BaselineReference::from_points(baseline, &points);
    apply_baseline(&mut points, &reference);

    let (strong, weak): (Vec<_>, Vec<_>) = points
        .into_iter()
        .partition(|p| p.scaling_law == ScalingLaw::Strong);

    ScalingAnalysis {
        baseline: baseline.to_string(),
        strong,
        weak,
        startup: compare_startup(outcomes, baseline),
    }
}
