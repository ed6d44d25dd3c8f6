//! Non-interactive privilege elevation.
//!
//! Enclave variants run through `sudo -n`. The orchestrator never prompts
//! for a password: if cached credentials are not usable the variant fails
//! fast with [`BenchError::PrivilegeUnavailable`]. While a session with
//! elevated variants is in progress, a [`CredentialKeepalive`] task refreshes
//! the sudo timestamp so a multi-minute sweep does not outlive it.

use crate::error::{BenchError, BenchResult};
use crate::poll::{Shutdown, ShutdownTrigger};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Prefix that runs a command with elevation, without ever prompting.
pub const SUDO_PREFIX: [&str; 2] = ["sudo", "-n"];

/// True when the current process already runs as root.
pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Prefix `argv` with `sudo -n` unless we already are root.
pub fn elevate(argv: Vec<String>) -> Vec<String> {
    if is_root() {
        return argv;
    }
    SUDO_PREFIX
        .iter()
        .map(|s| s.to_string())
        .chain(argv)
        .collect()
}

/// Check that `sudo` works without a prompt.
pub async fn ensure_noninteractive_elevation(variant: &str) -> BenchResult<()> {
    if is_root() {
        return Ok(());
    }

    let output = Command::new(SUDO_PREFIX[0])
        .args([SUDO_PREFIX[1], "true"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BenchError::PrivilegeUnavailable {
            variant: variant.to_string(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        debug!("Non-interactive elevation available for '{}'", variant);
        Ok(())
    } else {
        Err(BenchError::PrivilegeUnavailable {
            variant: variant.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Background task that periodically refreshes cached sudo credentials.
///
/// The task is owned: [`CredentialKeepalive::stop`] cancels it and waits for
/// it to finish, and dropping the value aborts it.
pub struct CredentialKeepalive {
    trigger: ShutdownTrigger,
    handle: Option<JoinHandle<()>>,
}

impl CredentialKeepalive {
    pub fn spawn(interval: Duration) -> Self {
        let (trigger, shutdown) = Shutdown::new();
        let handle = tokio::spawn(keepalive_loop(interval, shutdown));
        Self {
            trigger,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        self.trigger.trigger();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Credential keepalive task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for CredentialKeepalive {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn keepalive_loop(interval: Duration, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; credentials were just checked.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let refreshed = Command::new(SUDO_PREFIX[0])
                    .args([SUDO_PREFIX[1], "-v"])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                match refreshed {
                    Ok(status) if status.success() => debug!("Refreshed sudo credentials"),
                    Ok(status) => warn!("sudo credential refresh failed with {}", status),
                    Err(e) => warn!("sudo credential refresh could not run: {}", e),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("Credential keepalive stopped");
}
