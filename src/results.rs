use crate::config::BenchConfig;
use crate::extract::MetricsRecord;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File names of the artifacts written into a session directory.
pub const RAW_RESULTS_FILE: &str = "raw_results.json";
pub const RAW_STREAM_FILE: &str = "raw_results.jsonl";

/// The two scaling laws a sweep measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingLaw {
    /// Total work constant, split across clients
    Strong,
    /// Work per client constant
    Weak,
}

impl std::fmt::Display for ScalingLaw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalingLaw::Strong => write!(f, "strong"),
            ScalingLaw::Weak => write!(f, "weak"),
        }
    }
}

/// Outcome of one client invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub variant: String,
    pub num_clients: u32,
    pub messages_per_client: u64,
    /// Always `num_clients * messages_per_client`
    pub total_messages: u64,
    pub run_index: usize,
    pub scaling_law: ScalingLaw,
    pub succeeded: bool,
    #[serde(flatten)]
    pub metrics: MetricsRecord,
    pub raw_output: String,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Wall time of the invocation as seen by the orchestrator
    pub elapsed_ms: f64,
}

impl RunRecord {
    /// Create a record; `total_messages` is derived, never passed in.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        variant: &str,
        scaling_law: ScalingLaw,
        num_clients: u32,
        messages_per_client: u64,
        run_index: usize,
        succeeded: bool,
        metrics: MetricsRecord,
        raw_output: String,
        error: Option<String>,
        elapsed_ms: f64,
    ) -> Self {
        Self {
            variant: variant.to_string(),
            num_clients,
            messages_per_client,
            total_messages: u64::from(num_clients) * messages_per_client,
            run_index,
            scaling_law,
            succeeded,
            metrics,
            raw_output,
            error,
            timestamp: chrono::Utc::now(),
            elapsed_ms,
        }
    }
}

/// What happened to a variant as a whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum VariantStatus {
    Completed,
    Failed { stage: String, reason: String },
}

/// Per-variant summary kept next to the raw records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantOutcome {
    pub variant: String,
    #[serde(flatten)]
    pub status: VariantStatus,
    pub startup_time_seconds: Option<f64>,
    pub run_count: usize,
}

impl VariantOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, VariantStatus::Failed { .. })
    }
}

/// Result of one variant's full sweep
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRun {
    pub variant: String,
    pub startup_time_seconds: f64,
    pub strong_runs: Vec<RunRecord>,
    pub weak_runs: Vec<RunRecord>,
}

/// System information for reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub hostname: Option<String>,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            hostname: std::env::var("HOSTNAME").ok(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Session parameters echoed into the raw dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub host: String,
    pub baseline: String,
    pub variants: Vec<String>,
    pub repetitions: usize,
    pub strong_total: u64,
    pub weak_per_client: u64,
    pub client_counts: Vec<u32>,
}

impl From<&BenchConfig> for SessionSettings {
    fn from(config: &BenchConfig) -> Self {
        Self {
            host: config.host.clone(),
            baseline: config.baseline.clone(),
            variants: config.variants.iter().map(|v| v.name.clone()).collect(),
            repetitions: config.plan.repetitions,
            strong_total: config.plan.strong_total,
            weak_per_client: config.plan.weak_per_client,
            client_counts: config.plan.client_counts.clone(),
        }
    }
}

/// Benchmark metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_runs: usize,
    pub system_info: SystemInfo,
    pub settings: SessionSettings,
}

/// Complete, unfiltered dump of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResults {
    pub metadata: SessionMetadata,
    pub outcomes: Vec<VariantOutcome>,
    pub records: Vec<RunRecord>,
}

impl RawResults {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))
    }
}

/// Owner of the append-only raw collection.
///
/// Each record is appended to `raw_results.jsonl` as soon as it is produced,
/// so an interrupted session still leaves every completed measurement on
/// disk. [`ResultsManager::finalize`] writes the consolidated
/// `raw_results.json`.
pub struct ResultsManager {
    output_dir: PathBuf,
    stream: File,
    records: Vec<RunRecord>,
    outcomes: Vec<VariantOutcome>,
}

impl ResultsManager {
    /// Create the session directory and open the record stream
    pub fn new(output_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("cannot create {}", output_dir.display()))?;
        let stream_path = output_dir.join(RAW_STREAM_FILE);
        let stream = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&stream_path)
            .with_context(|| format!("cannot open {}", stream_path.display()))?;

        debug!("Streaming raw records to {:?}", stream_path);
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            stream,
            records: Vec::new(),
            outcomes: Vec::new(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Append a record and stream it to disk
    ///
    /// The record is kept in memory even when the stream write fails, so the
    /// final dump stays complete.
    pub fn add_record(&mut self, record: RunRecord) -> Result<()> {
        let line = serde_json::to_string(&record)?;
        self.records.push(record);
        writeln!(self.stream, "{}", line)
            .and_then(|_| self.stream.flush())
            .with_context(|| format!("cannot stream record to {}", RAW_STREAM_FILE))
    }

    /// Record the final status of a variant, replacing an earlier entry
    pub fn add_outcome(&mut self, outcome: VariantOutcome) {
        self.outcomes.retain(|o| o.variant != outcome.variant);
        self.outcomes.push(outcome);
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    pub fn outcomes(&self) -> &[VariantOutcome] {
        &self.outcomes
    }

    /// Number of records produced for `variant` so far
    pub fn run_count(&self, variant: &str) -> usize {
        self.records.iter().filter(|r| r.variant == variant).count()
    }

    /// Write the consolidated dump and return it
    pub fn finalize(&self, settings: SessionSettings) -> Result<RawResults> {
        info!("Finalizing benchmark results");

        let raw = RawResults {
            metadata: SessionMetadata {
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                total_runs: self.records.len(),
                system_info: SystemInfo::default(),
                settings,
            },
            outcomes: self.outcomes.clone(),
            records: self.records.clone(),
        };

        let path = self.output_dir.join(RAW_RESULTS_FILE);
        let json = serde_json::to_string_pretty(&raw)?;
        std::fs::write(&path, json).with_context(|| format!("cannot write {}", path.display()))?;

        info!("Raw results written to: {:?}", path);
        Ok(raw)
    }
}
