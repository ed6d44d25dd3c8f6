use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// Scaling Benchmark - strong/weak scaling comparison of server variants
#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Variants to benchmark (space-separated catalog names)
    #[clap(long = "variants", alias = "variant", num_args = 1.., help_heading = "Variant Selection")]
    pub variants: Vec<String>,

    /// Benchmark every variant in the catalog
    #[clap(long, conflicts_with = "variants", help_heading = "Variant Selection")]
    pub all: bool,

    /// Variant that speedup and efficiency are computed against
    /// (default: jvm-local, or the recorded one with --report-only)
    #[clap(long, help_heading = "Variant Selection")]
    pub baseline: Option<String>,

    /// JSON file replacing the built-in variant catalog
    #[clap(long, help_heading = "Variant Selection")]
    pub variants_file: Option<PathBuf>,

    /// Print the variant catalog and exit
    #[clap(long, help_heading = "Variant Selection")]
    pub list_variants: bool,

    /// Runs per (variant, scaling law, client count)
    #[clap(short = 'r', long, default_value_t = crate::defaults::REPETITIONS, help_heading = "Sweep")]
    pub repetitions: usize,

    /// Total messages for strong scaling, split across clients
    #[clap(long, default_value_t = crate::defaults::STRONG_TOTAL, help_heading = "Sweep")]
    pub strong_total: u64,

    /// Messages each client sends during weak scaling
    #[clap(long, default_value_t = crate::defaults::WEAK_PER_CLIENT, help_heading = "Sweep")]
    pub weak_per_client: u64,

    /// Largest client count; the grid is every power of two up to it
    #[clap(long, default_value_t = crate::defaults::MAX_CLIENTS, help_heading = "Sweep")]
    pub max_clients: u32,

    /// Host the servers listen on
    #[clap(long, default_value = "localhost", help_heading = "Client")]
    pub host: String,

    /// Command line of the load client (arguments are appended)
    #[clap(long, default_value = crate::defaults::CLIENT_COMMAND, help_heading = "Client")]
    pub client_command: String,

    /// Truststore passed to the client
    #[clap(long, default_value = "client.truststore", help_heading = "Client")]
    pub truststore: PathBuf,

    /// Password of the truststore
    #[clap(long, default_value = "changeit", help_heading = "Client")]
    pub truststore_password: String,

    /// Hard timeout of one client invocation (e.g. "300s", "5m")
    #[clap(long, default_value = "300s", value_parser = parse_duration, help_heading = "Client")]
    pub client_timeout: Duration,

    /// Run a short client round trip after readiness before measuring
    #[clap(long, help_heading = "Client")]
    pub health_check: bool,

    /// Working directory for servers, build steps and the client
    #[clap(long, default_value = ".", help_heading = "Output")]
    pub project_dir: PathBuf,

    /// Parent directory of the per-session result directory
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_DIR, help_heading = "Output")]
    pub output_dir: PathBuf,

    /// Regenerate CSV and text reports from an existing raw_results.json
    #[clap(long, help_heading = "Output")]
    pub report_only: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Logging")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, conflicts_with = "verbose", help_heading = "Logging")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Baseline variant, falling back to the built-in default
    pub fn baseline(&self) -> &str {
        self.baseline.as_deref().unwrap_or(crate::defaults::BASELINE)
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() {
        return Err(format!("Duration must be a finite number: {}", s));
    }
    if num < 0.0 {
        return Err(format!("Duration cannot be negative: {}", s));
    }

    let secs = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(secs).map_err(|_| format!("Duration out of range: {}", s))
}
