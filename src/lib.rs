//! # Scaling Benchmark Library
//!
//! Orchestrates repeatable performance comparisons between deployable
//! variants of a TLS echo server (a plain JVM process, the same JVM under
//! Gramine, the same JVM inside an SGX enclave) and computes how each one
//! scales with the number of concurrent clients.
//!
//! ## Architecture Overview
//!
//! - `supervisor`: build, start, readiness polling and graceful-then-forced
//!   stop of one server process at a time
//! - `executor`: a single invocation of the external load client, bounded by
//!   a timeout, turned into a `RunRecord`
//! - `extract`: tolerant parsing of the client's free-form output
//! - `scaling`: strong/weak grids and the per-variant lifecycle
//! - `aggregate`: mean/stdev per configuration, speedup and efficiency
//!   against a baseline variant
//! - `report`: CSV and text artifacts
//! - `results`: the append-only raw record collection
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use scaling_bench::{analyze, builtin_variants, extract};
//!
//! let record = extract("Total time: 2000 ms\nTotal messages sent: 400\n");
//! assert_eq!(record.throughput, Some(200.0));
//!
//! let catalog = builtin_variants();
//! let analysis = analyze(&[], &[], &catalog[0].name);
//! assert!(analysis.strong.is_empty());
//! ```

/// Mean/stdev reduction and comparison against the baseline variant
pub mod aggregate;

/// Command-line interface
pub mod cli;

/// Variant catalog and the immutable session configuration
pub mod config;

/// Error taxonomy of the variant lifecycle
pub mod error;

/// Invocation of the external load client
pub mod executor;

/// Parsing of client output into metrics
pub mod extract;

pub mod logging;

/// Clock abstraction, cancellation token and poll-with-timeout
pub mod poll;

/// Non-interactive `sudo` handling for enclave variants
pub mod privilege;

/// CSV and text report rendering
pub mod report;

/// Run records, variant outcomes and the streaming results manager
pub mod results;

/// Scaling grids and the per-variant sweep lifecycle
pub mod scaling;

/// Server process lifecycle
pub mod supervisor;

pub mod utils;

pub use aggregate::{analyze, AggregatedPoint, ScalingAnalysis};
pub use cli::Args;
pub use config::{builtin_variants, BenchConfig, VariantDescriptor};
pub use error::{BenchError, BenchResult};
pub use extract::{extract, MetricsRecord};
pub use results::{ResultsManager, RunRecord, ScalingLaw, VariantOutcome, VariantStatus};
pub use scaling::ScalingDriver;
pub use supervisor::{ProcessSupervisor, ServerControl};

/// The current version of the scaling benchmark
///
/// Written into `raw_results.json` and the text report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Variant every other one is compared against
    pub const BASELINE: &str = "jvm-local";

    /// Runs per grid point
    ///
    /// Three runs give a usable sample stdev without turning a full
    /// three-variant session into an hour-long job.
    pub const REPETITIONS: usize = 3;

    /// Total messages of a strong scaling point
    pub const STRONG_TOTAL: u64 = 1000;

    /// Messages per client of a weak scaling point
    pub const WEAK_PER_CLIENT: u64 = 100;

    /// Largest client count of the grid (1, 2, 4, 8, 16)
    pub const MAX_CLIENTS: u32 = 16;

    /// Load client invocation relative to the project directory
    pub const CLIENT_COMMAND: &str = "java -cp target/classes client.BenchClient";

    /// Parent of all session directories
    pub const OUTPUT_DIR: &str = "scaling-results";

    /// Messages of the unrecorded warmup invocation
    pub const WARMUP_MESSAGES: u64 = 10;

    /// Seconds between SIGTERM and SIGKILL
    pub const GRACE_PERIOD_SECS: u64 = 10;

    /// Hard timeout of one client invocation
    pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);

    /// How often cached sudo credentials are refreshed during a session
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
}
