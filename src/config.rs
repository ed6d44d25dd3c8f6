//! # Configuration
//!
//! Everything the orchestrator needs is resolved once, up front, into an
//! immutable [`BenchConfig`]. Components receive the pieces they need at
//! construction time; nothing reads global state afterwards.
//!
//! The variant catalog is either the built-in one (native JVM, Gramine
//! direct, Gramine SGX) or a JSON array of [`VariantDescriptor`] loaded with
//! `--variants-file`.

use crate::cli::Args;
use crate::error::{BenchError, BenchResult};
use crate::utils::validate_port;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Placeholder substituted with the listen port in start commands.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// One deployable configuration of the server under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub listen_port: u16,

    /// argv of the server; `{port}` is replaced by `listen_port`
    pub start_command: Vec<String>,

    /// Run the start command (and signals) through `sudo -n`
    #[serde(default)]
    pub needs_privilege_elevation: bool,

    /// Commands run once before the server is started
    #[serde(default)]
    pub build_steps: Vec<Vec<String>>,

    /// When this file exists the build steps are skipped
    #[serde(default)]
    pub build_marker: Option<PathBuf>,

    pub startup_timeout_seconds: u64,

    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u64,
}

fn default_grace_period_seconds() -> u64 {
    crate::defaults::GRACE_PERIOD_SECS
}

impl VariantDescriptor {
    /// Server argv with the port substituted.
    pub fn resolved_start_command(&self) -> Vec<String> {
        let port = self.listen_port.to_string();
        self.start_command
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    fn validate(&self) -> BenchResult<()> {
        if self.name.trim().is_empty() {
            return Err(BenchError::InvalidConfig("variant with empty name".into()));
        }
        // Names become CSV cells and log file names.
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(BenchError::InvalidConfig(format!(
                "variant name '{}' may only contain letters, digits, '_', '.' and '-'",
                self.name
            )));
        }
        if self.start_command.is_empty() {
            return Err(BenchError::InvalidConfig(format!(
                "variant '{}' has an empty start command",
                self.name
            )));
        }
        if self.build_steps.iter().any(|step| step.is_empty()) {
            return Err(BenchError::InvalidConfig(format!(
                "variant '{}' declares an empty build step",
                self.name
            )));
        }
        validate_port(self.listen_port)
            .map_err(|e| BenchError::InvalidConfig(format!("variant '{}': {}", self.name, e)))
    }
}

fn server_args(classpath: &str) -> Vec<String> {
    vec![
        "-cp".into(),
        classpath.into(),
        "server.BenchServer".into(),
        "--port".into(),
        PORT_PLACEHOLDER.into(),
        "--keystore".into(),
        "server.keystore".into(),
        "--password".into(),
        "changeit".into(),
    ]
}

/// The catalog used when no `--variants-file` is given.
pub fn builtin_variants() -> Vec<VariantDescriptor> {
    let mut jvm = vec!["java".to_string()];
    jvm.extend(server_args("target/classes"));

    let mut direct = vec!["gramine-direct".to_string(), "bench".to_string()];
    direct.extend(server_args("/app/classes"));

    let mut sgx = vec!["gramine-sgx".to_string(), "bench".to_string()];
    sgx.extend(server_args("/app/classes"));

    vec![
        VariantDescriptor {
            name: "jvm-local".into(),
            description: "Plain JVM process on the host".into(),
            listen_port: 9443,
            start_command: jvm,
            needs_privilege_elevation: false,
            build_steps: Vec::new(),
            build_marker: None,
            startup_timeout_seconds: 60,
            grace_period_seconds: 10,
        },
        VariantDescriptor {
            name: "gramine-direct".into(),
            description: "JVM under Gramine without SGX (library OS only)".into(),
            listen_port: 9445,
            start_command: direct,
            needs_privilege_elevation: false,
            build_steps: vec![vec!["make".into(), "all".into()]],
            build_marker: Some(PathBuf::from("bench.manifest")),
            startup_timeout_seconds: 120,
            grace_period_seconds: 10,
        },
        VariantDescriptor {
            name: "gramine-sgx".into(),
            description: "JVM inside an SGX enclave via Gramine".into(),
            listen_port: 9444,
            start_command: sgx,
            needs_privilege_elevation: true,
            build_steps: vec![vec!["make".into(), "all".into(), "SGX=1".into()]],
            build_marker: Some(PathBuf::from("bench.manifest.sgx")),
            startup_timeout_seconds: 360,
            grace_period_seconds: 15,
        },
    ]
}

/// Load a catalog from a JSON array of variant descriptors.
pub fn load_variants(path: &Path) -> BenchResult<Vec<VariantDescriptor>> {
    let text = std::fs::read_to_string(path)?;
    let variants: Vec<VariantDescriptor> = serde_json::from_str(&text).map_err(|e| {
        BenchError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
    })?;
    validate_catalog(&variants)?;
    debug!("Loaded {} variants from {}", variants.len(), path.display());
    Ok(variants)
}

fn validate_catalog(variants: &[VariantDescriptor]) -> BenchResult<()> {
    if variants.is_empty() {
        return Err(BenchError::InvalidConfig("variant catalog is empty".into()));
    }
    for (i, variant) in variants.iter().enumerate() {
        variant.validate()?;
        if variants[..i].iter().any(|v| v.name == variant.name) {
            return Err(BenchError::InvalidConfig(format!(
                "duplicate variant name '{}'",
                variant.name
            )));
        }
    }
    Ok(())
}

/// Resolve the requested variant names against the catalog.
///
/// Every name is checked before anything is returned, so a typo never
/// results in a partially started sweep. Catalog order is preserved for
/// `--all`; otherwise the order given on the command line is kept.
pub fn select_variants(
    catalog: &[VariantDescriptor],
    requested: &[String],
    all: bool,
) -> BenchResult<Vec<VariantDescriptor>> {
    if all {
        return Ok(catalog.to_vec());
    }
    if requested.is_empty() {
        return Err(BenchError::InvalidConfig(
            "no variants selected; pass --all or --variants <name>...".into(),
        ));
    }

    let known = || {
        catalog
            .iter()
            .map(|v| v.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut selected: Vec<VariantDescriptor> = Vec::with_capacity(requested.len());
    for name in requested {
        let variant = catalog
            .iter()
            .find(|v| &v.name == name)
            .ok_or_else(|| BenchError::UnknownVariant {
                name: name.clone(),
                known: known(),
            })?;
        if !selected.iter().any(|v| v.name == variant.name) {
            selected.push(variant.clone());
        }
    }
    Ok(selected)
}

/// How the load client is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// argv prefix, e.g. `java -cp target/classes client.BenchClient`
    pub command: Vec<String>,
    pub truststore: PathBuf,
    pub truststore_password: String,
    pub timeout: Duration,
}

/// Fixed waits of the lifecycle. Tests shrink these to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Interval between readiness probes
    pub poll_interval: Duration,
    /// Per-attempt connect timeout of a readiness probe
    pub probe_timeout: Duration,
    /// Extra wait after the first successful probe
    pub settle_delay: Duration,
    /// Wait after a server exits so the port is released
    pub port_release_delay: Duration,
    /// Pause between the strong and the weak sweep
    pub sweep_cooldown: Duration,
    /// Pause between repetitions of one configuration
    pub run_pause: Duration,
    /// Budget of the post-readiness health check
    pub health_check_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            port_release_delay: Duration::from_secs(2),
            sweep_cooldown: Duration::from_secs(3),
            run_pause: Duration::from_secs(1),
            health_check_timeout: Duration::from_secs(10),
        }
    }
}

impl Timings {
    /// All waits collapsed to zero except the probe timeout.
    pub fn immediate() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            probe_timeout: Duration::from_millis(200),
            settle_delay: Duration::ZERO,
            port_release_delay: Duration::ZERO,
            sweep_cooldown: Duration::ZERO,
            run_pause: Duration::ZERO,
            health_check_timeout: Duration::from_secs(1),
        }
    }
}

/// Parameters of the strong/weak sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPlan {
    pub strong_total: u64,
    pub weak_per_client: u64,
    pub repetitions: usize,
    pub client_counts: Vec<u32>,
    pub warmup_clients: u32,
    pub warmup_messages: u64,
}

/// Immutable configuration of a whole session.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub host: String,
    pub variants: Vec<VariantDescriptor>,
    pub baseline: String,
    pub plan: SweepPlan,
    pub client: ClientConfig,
    pub timings: Timings,
    /// Working directory of servers, builds and the client
    pub project_dir: PathBuf,
    /// Directory that receives every artifact of this session
    pub output_dir: PathBuf,
    pub health_check: bool,
}

impl BenchConfig {
    /// Build the session configuration from parsed CLI arguments.
    ///
    /// Fails on unknown variant names and inconsistent numbers before any
    /// external process is touched.
    pub fn from_args(args: &Args) -> BenchResult<Self> {
        let catalog = match &args.variants_file {
            Some(path) => load_variants(path)?,
            None => builtin_variants(),
        };
        let variants = select_variants(&catalog, &args.variants, args.all)?;

        if args.repetitions == 0 {
            return Err(BenchError::InvalidConfig(
                "repetitions must be at least 1".into(),
            ));
        }
        let client_counts = crate::scaling::client_counts(args.max_clients);
        if client_counts.is_empty() {
            return Err(BenchError::InvalidConfig(
                "max-clients must be at least 1".into(),
            ));
        }
        let largest = *client_counts.last().unwrap_or(&1) as u64;
        if args.strong_total < largest {
            return Err(BenchError::InvalidConfig(format!(
                "strong-total {} leaves no messages per client at {} clients",
                args.strong_total, largest
            )));
        }
        if args.weak_per_client == 0 {
            return Err(BenchError::InvalidConfig(
                "weak-per-client must be at least 1".into(),
            ));
        }

        let baseline = args.baseline();
        if !catalog.iter().any(|v| v.name == baseline) {
            return Err(BenchError::UnknownVariant {
                name: baseline.to_string(),
                known: catalog
                    .iter()
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        if !variants.iter().any(|v| v.name == baseline) {
            warn!(
                "Baseline '{}' is not part of this run; speedup and efficiency will be empty",
                baseline
            );
        }

        let client_command: Vec<String> = args
            .client_command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if client_command.is_empty() {
            return Err(BenchError::InvalidConfig("client command is empty".into()));
        }

        let session = format!(
            "{}_{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            crate::utils::generate_session_id()
        );

        Ok(Self {
            host: args.host.clone(),
            variants,
            baseline: baseline.to_string(),
            plan: SweepPlan {
                strong_total: args.strong_total,
                weak_per_client: args.weak_per_client,
                repetitions: args.repetitions,
                client_counts,
                warmup_clients: 1,
                warmup_messages: crate::defaults::WARMUP_MESSAGES,
            },
            client: ClientConfig {
                command: client_command,
                truststore: args.truststore.clone(),
                truststore_password: args.truststore_password.clone(),
                timeout: args.client_timeout,
            },
            timings: Timings::default(),
            project_dir: args.project_dir.clone(),
            output_dir: args.output_dir.join(session),
            health_check: args.health_check,
        })
    }

    pub fn needs_elevation(&self) -> bool {
        self.variants.iter().any(|v| v.needs_privilege_elevation)
    }
}
