//! # Run Executor
//!
//! Executes one `(variant, clients, messages per client)` configuration by
//! invoking the external load client once and turning the result into a
//! [`RunRecord`].
//!
//! A run never fails the sweep: a client that times out, cannot be spawned
//! or exits non-zero produces a record with `succeeded == false` and an error
//! text. The only error that leaves [`RunExecutor::run_once`] is
//! [`BenchError::Cancelled`]; the client process is killed before it is
//! returned.

use crate::config::{ClientConfig, VariantDescriptor};
use crate::error::{BenchError, BenchResult};
use crate::extract::{extract, MetricsRecord};
use crate::poll::{Clock, Shutdown};
use crate::results::{RunRecord, ScalingLaw};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error text stored on records whose invocation hit the hard timeout.
pub const TIMEOUT_ERROR: &str = "timeout";

/// One invocation of the load client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub host: String,
    pub port: u16,
    pub messages: u64,
    pub clients: u32,
    pub timeout: Duration,
}

impl ClientRequest {
    /// Full argv: the configured prefix followed by the client flags.
    ///
    /// `--load-test --clients N` is only passed when more than one client is
    /// requested; the single-connection mode reports acknowledgments instead.
    pub fn argv(&self, client: &ClientConfig) -> Vec<String> {
        let mut argv = client.command.clone();
        argv.extend([
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--messages".to_string(),
            self.messages.to_string(),
            "--truststore".to_string(),
            client.truststore.display().to_string(),
            "--truststore-password".to_string(),
            client.truststore_password.clone(),
        ]);
        if self.clients > 1 {
            argv.extend([
                "--load-test".to_string(),
                "--clients".to_string(),
                self.clients.to_string(),
            ]);
        }
        argv
    }
}

/// Captured result of a client process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    /// Exit status as printed by the OS
    pub status: String,
}

/// Why an invocation produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    Timeout,
    Failed(String),
    Cancelled,
}

/// Seam between the executor and the client program.
#[async_trait]
pub trait ClientInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: &ClientRequest,
        shutdown: &Shutdown,
    ) -> Result<ClientOutput, InvocationError>;
}

/// Invokes the real client as a child process.
#[derive(Debug, Clone)]
pub struct ProcessClient {
    config: ClientConfig,
    working_dir: PathBuf,
}

impl ProcessClient {
    pub fn new(config: ClientConfig, working_dir: PathBuf) -> Self {
        Self {
            config,
            working_dir,
        }
    }
}

#[async_trait]
impl ClientInvoker for ProcessClient {
    async fn invoke(
        &self,
        request: &ClientRequest,
        shutdown: &Shutdown,
    ) -> Result<ClientOutput, InvocationError> {
        let argv = request.argv(&self.config);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| InvocationError::Failed("client command is empty".into()))?;
        debug!("Invoking client: {}", argv.join(" "));

        let child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvocationError::Failed(format!("failed to spawn `{}`: {}", program, e)))?;

        // Dropping the wait future drops the child, which kills it.
        tokio::select! {
            waited = tokio::time::timeout(request.timeout, child.wait_with_output()) => match waited {
                Ok(Ok(output)) => Ok(ClientOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    success: output.status.success(),
                    status: output.status.to_string(),
                }),
                Ok(Err(e)) => Err(InvocationError::Failed(e.to_string())),
                Err(_) => Err(InvocationError::Timeout),
            },
            _ = shutdown.cancelled() => Err(InvocationError::Cancelled),
        }
    }
}

/// Last non-empty line of `text`, used to summarize client failures.
fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Runs single configurations against the currently live server.
pub struct RunExecutor {
    invoker: Arc<dyn ClientInvoker>,
    host: String,
    client_timeout: Duration,
    run_pause: Duration,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
}

impl RunExecutor {
    pub fn new(
        invoker: Arc<dyn ClientInvoker>,
        host: String,
        client_timeout: Duration,
        run_pause: Duration,
        clock: Arc<dyn Clock>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            invoker,
            host,
            client_timeout,
            run_pause,
            clock,
            shutdown,
        }
    }

    fn request(&self, variant: &VariantDescriptor, clients: u32, messages: u64) -> ClientRequest {
        ClientRequest {
            host: self.host.clone(),
            port: variant.listen_port,
            messages,
            clients,
            timeout: self.client_timeout,
        }
    }

    /// Invoke the client once and record the outcome.
    pub async fn run_once(
        &self,
        variant: &VariantDescriptor,
        law: ScalingLaw,
        num_clients: u32,
        messages_per_client: u64,
        run_index: usize,
    ) -> BenchResult<RunRecord> {
        if self.shutdown.is_cancelled() {
            return Err(BenchError::Cancelled);
        }

        let request = self.request(variant, num_clients, messages_per_client);
        let started = self.clock.now();
        let invoked = self.invoker.invoke(&request, &self.shutdown).await;
        let elapsed_ms = self.clock.now().saturating_duration_since(started).as_secs_f64() * 1000.0;

        let (succeeded, metrics, raw_output, error) = match invoked {
            Ok(output) => {
                let metrics = extract(&output.stdout);
                let error = if output.success {
                    None
                } else {
                    let detail = last_line(&output.stderr)
                        .or_else(|| last_line(&output.stdout))
                        .unwrap_or("no output");
                    Some(format!("client exited with {}: {}", output.status, detail))
                };
                (output.success, metrics, output.stdout, error)
            }
            Err(InvocationError::Timeout) => (
                false,
                MetricsRecord::default(),
                String::new(),
                Some(TIMEOUT_ERROR.to_string()),
            ),
            Err(InvocationError::Failed(detail)) => {
                (false, MetricsRecord::default(), String::new(), Some(detail))
            }
            Err(InvocationError::Cancelled) => return Err(BenchError::Cancelled),
        };

        let record = RunRecord::new(
            &variant.name,
            law,
            num_clients,
            messages_per_client,
            run_index,
            succeeded,
            metrics,
            raw_output,
            error,
            elapsed_ms,
        );

        if record.succeeded {
            info!(
                "{} {} clients={} msgs/client={} run={}: throughput={} msg/s",
                record.variant,
                record.scaling_law,
                record.num_clients,
                record.messages_per_client,
                record.run_index + 1,
                crate::utils::format_optional(record.metrics.throughput),
            );
        } else {
            warn!(
                "{} {} clients={} run={} failed: {}",
                record.variant,
                record.scaling_law,
                record.num_clients,
                record.run_index + 1,
                record.error.as_deref().unwrap_or("unknown error"),
            );
        }
        Ok(record)
    }

    /// Unrecorded invocation that warms up the server's JIT and TLS caches.
    pub async fn warmup(&self, variant: &VariantDescriptor, clients: u32, messages: u64) -> BenchResult<()> {
        info!("Warming up '{}' with {} messages", variant.name, messages);
        let request = self.request(variant, clients, messages);
        match self.invoker.invoke(&request, &self.shutdown).await {
            Ok(output) if output.success => Ok(()),
            Ok(output) => {
                warn!("Warmup for '{}' exited with {}", variant.name, output.status);
                Ok(())
            }
            Err(InvocationError::Cancelled) => Err(BenchError::Cancelled),
            Err(e) => {
                warn!("Warmup for '{}' failed: {:?}", variant.name, e);
                Ok(())
            }
        }
    }

    /// Fixed pause separating repetitions of one configuration.
    pub async fn pause_between_runs(&self) -> BenchResult<()> {
        self.shutdown.sleep(self.clock.as_ref(), self.run_pause).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::builtin_variants;
    use crate::poll::ManualClock;
    use std::sync::Mutex;

    /// Invoker that replays canned results and records every request.
    pub(crate) struct ScriptedClient {
        pub results: Mutex<Vec<Result<ClientOutput, InvocationError>>>,
        pub requests: Mutex<Vec<ClientRequest>>,
        pub fallback: Result<ClientOutput, InvocationError>,
    }

    impl ScriptedClient {
        pub(crate) fn always(result: Result<ClientOutput, InvocationError>) -> Self {
            Self {
                results: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                fallback: result,
            }
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ClientInvoker for ScriptedClient {
        async fn invoke(
            &self,
            request: &ClientRequest,
            _shutdown: &Shutdown,
        ) -> Result<ClientOutput, InvocationError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                self.fallback.clone()
            } else {
                results.remove(0)
            }
        }
    }

    pub(crate) fn ok_output(stdout: &str) -> Result<ClientOutput, InvocationError> {
        Ok(ClientOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
            status: "exit status: 0".into(),
        })
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            command: vec!["java".into(), "-cp".into(), "target/classes".into(), "client.BenchClient".into()],
            truststore: PathBuf::from("client.truststore"),
            truststore_password: "changeit".into(),
            timeout: Duration::from_secs(300),
        }
    }

    fn executor(invoker: Arc<dyn ClientInvoker>) -> RunExecutor {
        RunExecutor::new(
            invoker,
            "localhost".into(),
            Duration::from_secs(300),
            Duration::from_secs(1),
            Arc::new(ManualClock::new()),
            Shutdown::never(),
        )
    }

    #[test]
    fn test_argv_single_client() {
        let request = ClientRequest {
            host: "localhost".into(),
            port: 9443,
            messages: 1000,
            clients: 1,
            timeout: Duration::from_secs(300),
        };
        let argv = request.argv(&client_config());
        assert_eq!(&argv[..4], &["java", "-cp", "target/classes", "client.BenchClient"]);
        assert!(argv.windows(2).any(|w| w == ["--port", "9443"]));
        assert!(argv.windows(2).any(|w| w == ["--messages", "1000"]));
        assert!(!argv.contains(&"--load-test".to_string()));
    }

    #[test]
    fn test_argv_load_test() {
        let request = ClientRequest {
            host: "10.0.0.2".into(),
            port: 9444,
            messages: 250,
            clients: 4,
            timeout: Duration::from_secs(300),
        };
        let argv = request.argv(&client_config());
        assert!(argv.windows(2).any(|w| w == ["--host", "10.0.0.2"]));
        assert_eq!(&argv[argv.len() - 3..], &["--load-test", "--clients", "4"]);
    }

    #[tokio::test]
    async fn test_successful_run_is_extracted() {
        let client = Arc::new(ScriptedClient::always(ok_output(
            "Total messages processed: 1000\nTotal time: 2000 ms\nThroughput: 500.0 messages/second\n",
        )));
        let variant = &builtin_variants()[0];

        let record = executor(client.clone())
            .run_once(variant, ScalingLaw::Strong, 4, 250, 2)
            .await
            .unwrap();

        assert!(record.succeeded);
        assert_eq!(record.total_messages, 1000);
        assert_eq!(record.run_index, 2);
        assert_eq!(record.metrics.throughput, Some(500.0));
        assert!(record.error.is_none());

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[0].port, variant.listen_port);
        assert_eq!(requests[0].clients, 4);
        assert_eq!(requests[0].messages, 250);
    }

    #[tokio::test]
    async fn test_timeout_yields_failed_record() {
        let client = Arc::new(ScriptedClient::always(Err(InvocationError::Timeout)));
        let record = executor(client)
            .run_once(&builtin_variants()[0], ScalingLaw::Weak, 8, 100, 0)
            .await
            .unwrap();
        assert!(!record.succeeded);
        assert_eq!(record.error.as_deref(), Some(TIMEOUT_ERROR));
        assert!(record.metrics.is_empty());
        assert_eq!(record.total_messages, 800);
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_metrics() {
        let client = Arc::new(ScriptedClient::always(Ok(ClientOutput {
            stdout: "Total time: 100 ms\nTotal messages sent: 10\n".into(),
            stderr: "Connection reset by peer\n".into(),
            success: false,
            status: "exit status: 1".into(),
        })));
        let record = executor(client)
            .run_once(&builtin_variants()[0], ScalingLaw::Strong, 1, 10, 0)
            .await
            .unwrap();
        assert!(!record.succeeded);
        assert_eq!(record.metrics.throughput, Some(100.0));
        assert!(record.error.unwrap().contains("Connection reset"));
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let client = Arc::new(ScriptedClient::always(Err(InvocationError::Cancelled)));
        let result = executor(client)
            .run_once(&builtin_variants()[0], ScalingLaw::Strong, 1, 10, 0)
            .await;
        assert!(matches!(result, Err(BenchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_warmup_failure_is_not_fatal() {
        let client = Arc::new(ScriptedClient::always(Err(InvocationError::Failed("refused".into()))));
        executor(client.clone())
            .warmup(&builtin_variants()[0], 1, 10)
            .await
            .unwrap();
        assert_eq!(client.request_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_client_captures_stdout() {
        let config = ClientConfig {
            command: vec![
                "sh".into(),
                "-c".into(),
                "echo 'Throughput: 42.5 messages/second'".into(),
                "bench-client".into(),
            ],
            ..client_config()
        };
        let client = ProcessClient::new(config, std::env::temp_dir());
        let request = ClientRequest {
            host: "localhost".into(),
            port: 9443,
            messages: 1,
            clients: 1,
            timeout: Duration::from_secs(10),
        };
        let output = client.invoke(&request, &Shutdown::never()).await.unwrap();
        assert!(output.success);
        assert_eq!(extract(&output.stdout).throughput, Some(42.5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_client_times_out() {
        let config = ClientConfig {
            command: vec!["sh".into(), "-c".into(), "sleep 10".into(), "bench-client".into()],
            ..client_config()
        };
        let client = ProcessClient::new(config, std::env::temp_dir());
        let request = ClientRequest {
            host: "localhost".into(),
            port: 9443,
            messages: 1,
            clients: 1,
            timeout: Duration::from_millis(200),
        };
        let started = std::time::Instant::now();
        let result = client.invoke(&request, &Shutdown::never()).await;
        assert_eq!(result, Err(InvocationError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
