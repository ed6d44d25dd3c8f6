//! # Process Supervisor
//!
//! Owns the lifecycle of one server variant at a time:
//!
//! - **build**: run the declared build steps unless the build marker exists
//! - **start**: refuse when the port is already live, then spawn the server
//!   with stdout/stderr redirected to `<output>/<variant>_server.log`
//! - **await_ready**: poll a TCP connect until it succeeds, the timeout
//!   expires or the process exits
//! - **stop**: SIGTERM, bounded grace period, SIGKILL, reap, then wait for
//!   the port to be released and check that it is
//!
//! Servers run in their own process group and signals go to the whole
//! group. Elevated variants are spawned and signalled through `sudo -n`.
//!
//! The [`ServerControl`] trait is the seam the scaling driver depends on, so
//! the sweep logic can be exercised without real servers.

use crate::config::{Timings, VariantDescriptor};
use crate::error::{BenchError, BenchResult};
use crate::executor::{ClientInvoker, ClientRequest, InvocationError};
use crate::poll::{poll_until, Clock, PollOutcome, PollStep, Shutdown};
use crate::privilege;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Messages sent by the post-readiness health check.
pub const HEALTH_CHECK_MESSAGES: u64 = 3;

/// Live server of one variant. Dropping it kills the process.
#[derive(Debug)]
pub struct ServerHandle {
    pub variant: String,
    pub port: u16,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Spawned through `sudo -n`; signals must be elevated too
    pub elevated: bool,
    pub grace_period: Duration,
    child: Option<Child>,
}

impl ServerHandle {
    /// Handle without an OS process, for controls that manage servers
    /// some other way.
    pub fn detached(variant: &VariantDescriptor) -> Self {
        Self {
            variant: variant.name.clone(),
            port: variant.listen_port,
            started_at: chrono::Utc::now(),
            elevated: false,
            grace_period: variant.grace_period(),
            child: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

/// Result of waiting for a server to accept connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    /// Time until the first successful probe, or until giving up
    pub elapsed: Duration,
}

/// Lifecycle operations the scaling driver needs.
#[async_trait]
pub trait ServerControl: Send + Sync {
    async fn build(&self, variant: &VariantDescriptor) -> BenchResult<()>;

    async fn start(&self, variant: &VariantDescriptor) -> BenchResult<ServerHandle>;

    async fn await_ready(&self, handle: &mut ServerHandle, timeout: Duration) -> BenchResult<Readiness>;

    /// Must run to completion even after cancellation.
    async fn stop(&self, handle: ServerHandle) -> BenchResult<()>;

    /// Fails with `PrivilegeUnavailable` when `variant` cannot be elevated
    /// without a prompt.
    async fn check_elevation(&self, variant: &VariantDescriptor) -> BenchResult<()> {
        privilege::ensure_noninteractive_elevation(&variant.name).await
    }
}

/// True when something accepts TCP connections on `host:port`.
pub async fn port_is_live(host: &str, port: u16, probe_timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(probe_timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// [`ServerControl`] backed by real child processes.
pub struct ProcessSupervisor {
    host: String,
    working_dir: PathBuf,
    log_dir: PathBuf,
    timings: Timings,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
    health_check: Option<Arc<dyn ClientInvoker>>,
}

impl ProcessSupervisor {
    pub fn new(
        host: String,
        working_dir: PathBuf,
        log_dir: PathBuf,
        timings: Timings,
        clock: Arc<dyn Clock>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            host,
            working_dir,
            log_dir,
            timings,
            clock,
            shutdown,
            health_check: None,
        }
    }

    /// Complete a short client round trip after readiness.
    pub fn with_health_check(mut self, invoker: Arc<dyn ClientInvoker>) -> Self {
        self.health_check = Some(invoker);
        self
    }

    pub fn server_log_path(&self, variant: &str) -> PathBuf {
        server_log_file(&self.log_dir, variant)
    }

    async fn run_health_check(&self, handle: &ServerHandle) -> BenchResult<()> {
        let Some(invoker) = &self.health_check else {
            return Ok(());
        };
        debug!("Running health check against '{}'", handle.variant);
        let request = ClientRequest {
            host: self.host.clone(),
            port: handle.port,
            messages: HEALTH_CHECK_MESSAGES,
            clients: 1,
            timeout: self.timings.health_check_timeout,
        };
        let failed = |detail: String| BenchError::HealthCheck {
            variant: handle.variant.clone(),
            detail,
        };
        match invoker.invoke(&request, &self.shutdown).await {
            Ok(output) if output.success => {
                info!("Health check for '{}' passed", handle.variant);
                Ok(())
            }
            Ok(output) => Err(failed(format!("client exited with {}", output.status))),
            Err(InvocationError::Timeout) => Err(failed("client timed out".into())),
            Err(InvocationError::Failed(detail)) => Err(failed(detail)),
            Err(InvocationError::Cancelled) => Err(BenchError::Cancelled),
        }
    }

    async fn send_terminate(&self, handle: &ServerHandle, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        if handle.elevated {
            elevated_group_kill(pid, "-TERM").await;
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("SIGTERM to process group {} failed: {}", pid, e);
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = child.start_kill() {
                warn!("Terminating pid {} failed: {}", pid, e);
            }
        }
    }

    /// SIGKILL the whole process group. Killing only the leader would orphan
    /// whatever it spawned, e.g. the enclave behind `sudo`.
    async fn force_kill(&self, handle: &ServerHandle, child: &mut Child) {
        if let Some(pid) = child.id() {
            if handle.elevated {
                elevated_group_kill(pid, "-KILL").await;
            } else {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid;

                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        warn!("SIGKILL to process group {} failed: {}", pid, e);
                    }
                }
            }
        }
        if let Err(e) = child.start_kill() {
            debug!("Force kill of '{}' leader: {}", handle.variant, e);
        }
    }
}

/// Signal the process group led by `pgid` through `sudo -n kill`.
async fn elevated_group_kill(pgid: u32, signal: &str) {
    let argv = privilege::elevate(vec![
        "kill".into(),
        signal.into(),
        "--".into(),
        format!("-{}", pgid),
    ]);
    let Some((program, args)) = argv.split_first() else {
        return;
    };
    match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("`{}` exited with {}", argv.join(" "), status),
        Err(e) => warn!("`{}` could not run: {}", argv.join(" "), e),
    }
}

fn summarize_failure(stderr: &[u8], status: ExitStatus) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string())
}

#[async_trait]
impl ServerControl for ProcessSupervisor {
    async fn build(&self, variant: &VariantDescriptor) -> BenchResult<()> {
        if variant.build_steps.is_empty() {
            return Ok(());
        }
        if let Some(marker) = &variant.build_marker {
            if self.working_dir.join(marker).exists() {
                debug!(
                    "Build marker {} present, skipping build of '{}'",
                    marker.display(),
                    variant.name
                );
                return Ok(());
            }
        }

        for step in &variant.build_steps {
            let (program, args) = step
                .split_first()
                .ok_or_else(|| BenchError::InvalidConfig(format!("empty build step for '{}'", variant.name)))?;
            let command = step.join(" ");
            info!("Building '{}': {}", variant.name, command);

            let output = Command::new(program)
                .args(args)
                .current_dir(&self.working_dir)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output();
            let output = tokio::select! {
                out = output => out.map_err(|source| BenchError::Spawn {
                    program: program.clone(),
                    source,
                })?,
                _ = self.shutdown.cancelled() => return Err(BenchError::Cancelled),
            };

            if !output.status.success() {
                return Err(BenchError::BuildFailure {
                    variant: variant.name.clone(),
                    command,
                    detail: summarize_failure(&output.stderr, output.status),
                });
            }
        }
        Ok(())
    }

    async fn start(&self, variant: &VariantDescriptor) -> BenchResult<ServerHandle> {
        if self.shutdown.is_cancelled() {
            return Err(BenchError::Cancelled);
        }
        if variant.needs_privilege_elevation {
            self.check_elevation(variant).await?;
        }
        if port_is_live(&self.host, variant.listen_port, self.timings.probe_timeout).await {
            return Err(BenchError::AlreadyRunning {
                variant: variant.name.clone(),
                port: variant.listen_port,
            });
        }

        let elevated = variant.needs_privilege_elevation && !privilege::is_root();
        let mut argv = variant.resolved_start_command();
        if elevated {
            argv = privilege::elevate(argv);
        }
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BenchError::InvalidConfig(format!("empty start command for '{}'", variant.name)))?;

        std::fs::create_dir_all(&self.log_dir)?;
        let log_path = self.server_log_path(&variant.name);
        let stdout_log = std::fs::File::create(&log_path)?;
        let stderr_log = stdout_log.try_clone()?;

        info!(
            "Starting '{}' on port {}: {}",
            variant.name,
            variant.listen_port,
            argv.join(" ")
        );
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true);
        // Own process group, so stop reaches every descendant.
        #[cfg(unix)]
        command.process_group(0);
        let child = command
            .spawn()
            .map_err(|source| BenchError::Spawn {
                program: program.clone(),
                source,
            })?;
        debug!(
            "Server '{}' running as pid {:?}, log at {}",
            variant.name,
            child.id(),
            log_path.display()
        );

        Ok(ServerHandle {
            variant: variant.name.clone(),
            port: variant.listen_port,
            started_at: chrono::Utc::now(),
            elevated,
            grace_period: variant.grace_period(),
            child: Some(child),
        })
    }

    async fn await_ready(&self, handle: &mut ServerHandle, timeout: Duration) -> BenchResult<Readiness> {
        info!(
            "Waiting up to {} for '{}' on port {}",
            crate::utils::format_duration(timeout),
            handle.variant,
            handle.port
        );

        let mut exit_status: Option<ExitStatus> = None;
        let outcome = {
            let child = &mut handle.child;
            let host = &self.host;
            let port = handle.port;
            let probe_timeout = self.timings.probe_timeout;
            let exit_status = &mut exit_status;

            poll_until(
                self.clock.as_ref(),
                &self.shutdown,
                self.timings.poll_interval,
                timeout,
                move || {
                    if let Some(child) = child.as_mut() {
                        if let Ok(Some(status)) = child.try_wait() {
                            *exit_status = Some(status);
                        }
                    }
                    let exited = exit_status.is_some();
                    let host = host.clone();
                    async move {
                        if exited {
                            PollStep::Abort
                        } else if port_is_live(&host, port, probe_timeout).await {
                            PollStep::Ready
                        } else {
                            PollStep::Pending
                        }
                    }
                },
            )
            .await?
        };

        match outcome {
            PollOutcome::Ready(elapsed) => {
                info!(
                    "'{}' ready after {}",
                    handle.variant,
                    crate::utils::format_duration(elapsed)
                );
                self.shutdown
                    .sleep(self.clock.as_ref(), self.timings.settle_delay)
                    .await?;
                self.run_health_check(handle).await?;
                Ok(Readiness {
                    ready: true,
                    elapsed,
                })
            }
            PollOutcome::TimedOut(elapsed) => {
                error!(
                    "'{}' did not accept connections on port {} within {}",
                    handle.variant,
                    handle.port,
                    crate::utils::format_duration(timeout)
                );
                Ok(Readiness {
                    ready: false,
                    elapsed,
                })
            }
            PollOutcome::Aborted(_) => Err(BenchError::ServerExited {
                variant: handle.variant.clone(),
                status: exit_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown status".into()),
            }),
        }
    }

    async fn stop(&self, mut handle: ServerHandle) -> BenchResult<()> {
        let Some(mut child) = handle.child.take() else {
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            info!("Server '{}' had already exited with {}", handle.variant, status);
        } else {
            info!("Stopping '{}' (pid {:?})", handle.variant, child.id());
            self.send_terminate(&handle, &mut child).await;

            match tokio::time::timeout(handle.grace_period, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    debug!("Server '{}' exited with {}", handle.variant, status);
                }
                Err(_) => {
                    warn!(
                        "'{}' still alive after {}, killing",
                        handle.variant,
                        crate::utils::format_duration(handle.grace_period)
                    );
                    self.force_kill(&handle, &mut child).await;
                    let status = child.wait().await?;
                    debug!("Server '{}' killed, exit {}", handle.variant, status);
                }
            }
        }

        // Not cancellable: the next variant may reuse the port.
        self.clock.sleep(self.timings.port_release_delay).await;
        if port_is_live(&self.host, handle.port, self.timings.probe_timeout).await {
            error!(
                "Port {} still accepting connections after stopping '{}'",
                handle.port, handle.variant
            );
            return Err(BenchError::PortStillBound {
                variant: handle.variant.clone(),
                port: handle.port,
            });
        }
        Ok(())
    }
}

/// Location of a variant's server log inside `dir`.
pub fn server_log_file(dir: &Path, variant: &str) -> PathBuf {
    dir.join(format!("{}_server.log", variant))
}
