//! # Scaling Driver
//!
//! Generates the strong and weak scaling grids and drives one variant at a
//! time through its full lifecycle:
//!
//! ```text
//! build -> start -> await ready -> warmup -> strong sweep -> cool-down
//!       -> weak sweep -> stop
//! ```
//!
//! `stop` runs whenever `start` succeeded, whatever happens in between,
//! including cancellation. [`ScalingDriver::run_all`] turns per-variant
//! failures into [`VariantOutcome`]s so one broken variant never aborts its
//! siblings.

use crate::config::{SweepPlan, Timings, VariantDescriptor};
use crate::error::{BenchError, BenchResult};
use crate::executor::RunExecutor;
use crate::poll::{Clock, Shutdown};
use crate::results::{ResultsManager, RunRecord, ScalingLaw, VariantOutcome, VariantRun, VariantStatus};
use crate::supervisor::{ServerControl, ServerHandle};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Powers of two from 1 up to and including `max`.
pub fn client_counts(max: u32) -> Vec<u32> {
    let mut counts = Vec::new();
    let mut n: u32 = 1;
    while n <= max {
        counts.push(n);
        match n.checked_mul(2) {
            Some(next) => n = next,
            None => break,
        }
    }
    counts
}

/// One configuration of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridPoint {
    pub num_clients: u32,
    pub messages_per_client: u64,
}

impl GridPoint {
    pub fn total_messages(&self) -> u64 {
        u64::from(self.num_clients) * self.messages_per_client
    }
}

/// Constant total work; `messages_per_client = floor(total / n)`.
///
/// The rounding shortfall is tolerated (1000 over 16 clients sends 992).
/// Points that would send nothing are dropped.
pub fn strong_grid(total: u64, counts: &[u32]) -> Vec<GridPoint> {
    counts
        .iter()
        .filter_map(|&n| {
            let per_client = total / u64::from(n.max(1));
            if per_client == 0 {
                warn!("Skipping strong point with {} clients: {} messages leave none per client", n, total);
                return None;
            }
            Some(GridPoint {
                num_clients: n,
                messages_per_client: per_client,
            })
        })
        .collect()
}

/// Constant work per client.
pub fn weak_grid(per_client: u64, counts: &[u32]) -> Vec<GridPoint> {
    counts
        .iter()
        .map(|&n| GridPoint {
            num_clients: n,
            messages_per_client: per_client,
        })
        .collect()
}

/// Callback receiving every record the moment it is produced.
pub type RecordSink<'a> = dyn FnMut(&RunRecord) + Send + 'a;

pub struct ScalingDriver {
    control: Arc<dyn ServerControl>,
    executor: RunExecutor,
    plan: SweepPlan,
    timings: Timings,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
}

impl ScalingDriver {
    pub fn new(
        control: Arc<dyn ServerControl>,
        executor: RunExecutor,
        plan: SweepPlan,
        timings: Timings,
        clock: Arc<dyn Clock>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            control,
            executor,
            plan,
            timings,
            clock,
            shutdown,
        }
    }

    /// Measure one variant end to end.
    ///
    /// The server is stopped before this returns, also when the sweep fails
    /// or is cancelled. A failure to stop is logged; measurements already
    /// taken are kept.
    pub async fn run_variant(
        &self,
        variant: &VariantDescriptor,
        strong_total: u64,
        weak_per_client: u64,
        repetitions: usize,
        sink: &mut RecordSink<'_>,
    ) -> BenchResult<VariantRun> {
        info!("=== Variant '{}' ===", variant.name);
        self.control.build(variant).await?;
        let mut handle = self.control.start(variant).await?;

        let measured = self
            .measure(variant, &mut handle, strong_total, weak_per_client, repetitions, sink)
            .await;
        let stopped = self.control.stop(handle).await;

        if let Err(e) = stopped {
            error!("Failed to stop '{}': {}", variant.name, e);
        }
        measured
    }

    async fn measure(
        &self,
        variant: &VariantDescriptor,
        handle: &mut ServerHandle,
        strong_total: u64,
        weak_per_client: u64,
        repetitions: usize,
        sink: &mut RecordSink<'_>,
    ) -> BenchResult<VariantRun> {
        let readiness = self
            .control
            .await_ready(handle, variant.startup_timeout())
            .await?;
        if !readiness.ready {
            return Err(BenchError::ReadinessTimeout {
                variant: variant.name.clone(),
                port: variant.listen_port,
                waited: readiness.elapsed,
            });
        }

        self.executor
            .warmup(variant, self.plan.warmup_clients, self.plan.warmup_messages)
            .await?;

        let strong = strong_grid(strong_total, &self.plan.client_counts);
        let strong_runs = self
            .sweep(variant, ScalingLaw::Strong, &strong, repetitions, sink)
            .await?;

        info!(
            "Cooling down for {} before the weak sweep",
            crate::utils::format_duration(self.timings.sweep_cooldown)
        );
        self.shutdown
            .sleep(self.clock.as_ref(), self.timings.sweep_cooldown)
            .await?;

        let weak = weak_grid(weak_per_client, &self.plan.client_counts);
        let weak_runs = self
            .sweep(variant, ScalingLaw::Weak, &weak, repetitions, sink)
            .await?;

        Ok(VariantRun {
            variant: variant.name.clone(),
            startup_time_seconds: readiness.elapsed.as_secs_f64(),
            strong_runs,
            weak_runs,
        })
    }

    async fn sweep(
        &self,
        variant: &VariantDescriptor,
        law: ScalingLaw,
        grid: &[GridPoint],
        repetitions: usize,
        sink: &mut RecordSink<'_>,
    ) -> BenchResult<Vec<RunRecord>> {
        info!("{} scaling sweep for '{}' over {} points", law, variant.name, grid.len());
        let mut runs = Vec::with_capacity(grid.len() * repetitions);
        for point in grid {
            for run_index in 0..repetitions {
                if run_index > 0 {
                    self.executor.pause_between_runs().await?;
                }
                let record = self
                    .executor
                    .run_once(variant, law, point.num_clients, point.messages_per_client, run_index)
                    .await?;
                sink(&record);
                runs.push(record);
            }
        }
        Ok(runs)
    }

    /// Run every variant in order, streaming records into `results`.
    ///
    /// Per-variant failures become `Failed` outcomes. Cancellation stops the
    /// loop after the current server is down and is returned to the caller.
    pub async fn run_all(&self, variants: &[VariantDescriptor], results: &mut ResultsManager) -> BenchResult<()> {
        let elevation_error = self.preflight_elevation(variants).await;

        for variant in variants {
            if self.shutdown.is_cancelled() {
                return Err(BenchError::Cancelled);
            }

            if variant.needs_privilege_elevation {
                if let Some(reason) = &elevation_error {
                    error!("Skipping '{}': {}", variant.name, reason);
                    results.add_outcome(VariantOutcome {
                        variant: variant.name.clone(),
                        status: VariantStatus::Failed {
                            stage: "start".into(),
                            reason: reason.clone(),
                        },
                        startup_time_seconds: None,
                        run_count: 0,
                    });
                    continue;
                }
            }

            let before = results.run_count(&variant.name);
            let outcome = {
                let mut sink = |record: &RunRecord| {
                    if let Err(e) = results.add_record(record.clone()) {
                        error!("Failed to persist record for '{}': {:#}", record.variant, e);
                    }
                };
                self.run_variant(
                    variant,
                    self.plan.strong_total,
                    self.plan.weak_per_client,
                    self.plan.repetitions,
                    &mut sink,
                )
                .await
            };
            let run_count = results.run_count(&variant.name) - before;

            match outcome {
                Ok(run) => {
                    info!(
                        "Variant '{}' completed: {} strong and {} weak runs",
                        variant.name,
                        run.strong_runs.len(),
                        run.weak_runs.len()
                    );
                    results.add_outcome(VariantOutcome {
                        variant: variant.name.clone(),
                        status: VariantStatus::Completed,
                        startup_time_seconds: Some(run.startup_time_seconds),
                        run_count,
                    });
                }
                Err(e) => {
                    let cancelled = matches!(e, BenchError::Cancelled);
                    if !cancelled {
                        error!("Variant '{}' failed: {}", variant.name, e);
                    }
                    results.add_outcome(VariantOutcome {
                        variant: variant.name.clone(),
                        status: VariantStatus::Failed {
                            stage: e.stage().to_string(),
                            reason: e.to_string(),
                        },
                        startup_time_seconds: None,
                        run_count,
                    });
                    if cancelled {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn preflight_elevation(&self, variants: &[VariantDescriptor]) -> Option<String> {
        let first = variants.iter().find(|v| v.needs_privilege_elevation)?;
        match self.control.check_elevation(first).await {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_variants;
    use crate::executor::tests::{ok_output, ScriptedClient};
    use crate::executor::{ClientInvoker, InvocationError};
    use crate::poll::ManualClock;
    use crate::supervisor::Readiness;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    const OUTPUT: &str = "Total messages processed: 100\nTotal time: 100 ms\nThroughput: 1000.0 messages/second\n";

    #[derive(Default)]
    struct MockControl {
        calls: Mutex<Vec<String>>,
        not_ready: Vec<String>,
        elevation_denied: bool,
    }

    impl MockControl {
        fn count(&self, call: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| c.starts_with(call)).count()
        }
    }

    #[async_trait]
    impl ServerControl for MockControl {
        async fn build(&self, variant: &VariantDescriptor) -> BenchResult<()> {
            self.calls.lock().unwrap().push(format!("build {}", variant.name));
            Ok(())
        }

        async fn start(&self, variant: &VariantDescriptor) -> BenchResult<ServerHandle> {
            self.calls.lock().unwrap().push(format!("start {}", variant.name));
            Ok(ServerHandle::detached(variant))
        }

        async fn await_ready(&self, handle: &mut ServerHandle, timeout: Duration) -> BenchResult<Readiness> {
            self.calls.lock().unwrap().push(format!("ready {}", handle.variant));
            if self.not_ready.contains(&handle.variant) {
                Ok(Readiness {
                    ready: false,
                    elapsed: timeout,
                })
            } else {
                Ok(Readiness {
                    ready: true,
                    elapsed: Duration::from_millis(1500),
                })
            }
        }

        async fn stop(&self, handle: ServerHandle) -> BenchResult<()> {
            self.calls.lock().unwrap().push(format!("stop {}", handle.variant));
            Ok(())
        }

        async fn check_elevation(&self, variant: &VariantDescriptor) -> BenchResult<()> {
            self.calls.lock().unwrap().push(format!("elevate {}", variant.name));
            if self.elevation_denied {
                return Err(BenchError::PrivilegeUnavailable {
                    variant: variant.name.clone(),
                    detail: "sudo: a password is required".into(),
                });
            }
            Ok(())
        }
    }

    fn plan(max_clients: u32) -> SweepPlan {
        SweepPlan {
            strong_total: 1000,
            weak_per_client: 100,
            repetitions: 2,
            client_counts: client_counts(max_clients),
            warmup_clients: 1,
            warmup_messages: 10,
        }
    }

    fn driver(control: Arc<MockControl>, client: Arc<dyn ClientInvoker>, plan: SweepPlan) -> ScalingDriver {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let executor = RunExecutor::new(
            client,
            "localhost".into(),
            Duration::from_secs(300),
            Duration::from_secs(1),
            clock.clone(),
            Shutdown::never(),
        );
        ScalingDriver::new(control, executor, plan, Timings::default(), clock, Shutdown::never())
    }

    #[test]
    fn test_client_counts() {
        assert_eq!(client_counts(16), vec![1, 2, 4, 8, 16]);
        assert_eq!(client_counts(10), vec![1, 2, 4, 8]);
        assert_eq!(client_counts(1), vec![1]);
        assert!(client_counts(0).is_empty());
        assert_eq!(client_counts(u32::MAX).len(), 32);
    }

    #[test]
    fn test_strong_grid_floor_division() {
        let grid = strong_grid(1000, &client_counts(16));
        let per_client: Vec<u64> = grid.iter().map(|p| p.messages_per_client).collect();
        assert_eq!(per_client, vec![1000, 500, 250, 125, 62]);
        assert_eq!(grid[4].total_messages(), 992);
    }

    #[test]
    fn test_strong_grid_drops_empty_points() {
        let grid = strong_grid(3, &[1, 2, 4]);
        assert_eq!(grid.len(), 2);
    }

    #[test]
    fn test_weak_grid_constant_per_client() {
        let grid = weak_grid(100, &client_counts(16));
        assert!(grid.iter().all(|p| p.messages_per_client == 100));
        assert_eq!(grid.last().unwrap().total_messages(), 1600);
    }

    #[tokio::test]
    async fn test_run_variant_full_lifecycle() {
        let control = Arc::new(MockControl::default());
        let client = Arc::new(ScriptedClient::always(ok_output(OUTPUT)));
        let driver = driver(control.clone(), client.clone(), plan(4));
        let variant = &builtin_variants()[0];

        let mut streamed = Vec::new();
        let mut sink = |r: &RunRecord| streamed.push(r.clone());
        let run = driver.run_variant(variant, 1000, 100, 2, &mut sink).await.unwrap();

        // 3 points x 2 repetitions per law
        assert_eq!(run.strong_runs.len(), 6);
        assert_eq!(run.weak_runs.len(), 6);
        assert_eq!(streamed.len(), 12);
        assert_eq!(run.startup_time_seconds, 1.5);
        // warmup is invoked but never recorded
        assert_eq!(client.request_count(), 13);
        assert_eq!(client.requests.lock().unwrap()[0].messages, 10);

        assert!(run
            .strong_runs
            .iter()
            .chain(&run.weak_runs)
            .all(|r| r.total_messages == u64::from(r.num_clients) * r.messages_per_client));
        assert!(run.weak_runs.iter().all(|r| r.scaling_law == ScalingLaw::Weak));
        assert_eq!(
            *control.calls.lock().unwrap(),
            vec!["build jvm-local", "start jvm-local", "ready jvm-local", "stop jvm-local"]
        );
    }

    #[tokio::test]
    async fn test_stop_runs_once_when_sweep_is_cancelled() {
        let control = Arc::new(MockControl::default());
        let client = ScriptedClient::always(Err(InvocationError::Cancelled));
        // warmup plus three measured runs, then the interrupt
        *client.results.lock().unwrap() = vec![ok_output(OUTPUT); 4];
        let driver = driver(control.clone(), Arc::new(client), plan(16));

        let mut sink = |_: &RunRecord| {};
        let result = driver
            .run_variant(&builtin_variants()[0], 1000, 100, 3, &mut sink)
            .await;

        assert!(matches!(result, Err(BenchError::Cancelled)));
        assert_eq!(control.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_failed_runs_do_not_stop_the_sweep() {
        let control = Arc::new(MockControl::default());
        let client = Arc::new(ScriptedClient::always(Err(InvocationError::Timeout)));
        let driver = driver(control.clone(), client, plan(2));

        let mut sink = |_: &RunRecord| {};
        let run = driver
            .run_variant(&builtin_variants()[0], 1000, 100, 1, &mut sink)
            .await
            .unwrap();
        assert_eq!(run.strong_runs.len(), 2);
        assert!(run.strong_runs.iter().all(|r| !r.succeeded));
        assert_eq!(control.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_readiness_failure_does_not_abort_siblings() {
        let control = Arc::new(MockControl {
            not_ready: vec!["gramine-direct".into()],
            ..Default::default()
        });
        let client = Arc::new(ScriptedClient::always(ok_output(OUTPUT)));
        let driver = driver(control.clone(), client, plan(2));
        let catalog = builtin_variants();
        let variants = vec![catalog[1].clone(), catalog[0].clone()];

        let dir = tempfile::tempdir().unwrap();
        let mut results = ResultsManager::new(dir.path()).unwrap();
        driver.run_all(&variants, &mut results).await.unwrap();

        let outcomes = results.outcomes();
        assert_eq!(outcomes.len(), 2);
        match &outcomes[0].status {
            VariantStatus::Failed { stage, .. } => assert_eq!(stage, "readiness"),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(outcomes[1].status, VariantStatus::Completed);
        assert_eq!(outcomes[1].startup_time_seconds, Some(1.5));
        // 2 points x 2 repetitions x 2 laws
        assert_eq!(outcomes[1].run_count, 8);
        assert_eq!(results.records().len(), 8);
        // the failed variant was still stopped
        assert_eq!(control.count("stop"), 2);
    }

    #[tokio::test]
    async fn test_unavailable_elevation_skips_elevated_variants() {
        let control = Arc::new(MockControl {
            elevation_denied: true,
            ..Default::default()
        });
        let client = Arc::new(ScriptedClient::always(ok_output(OUTPUT)));
        let driver = driver(control.clone(), client, plan(2));
        let catalog = builtin_variants();
        let sgx = catalog
            .iter()
            .find(|v| v.needs_privilege_elevation)
            .unwrap()
            .clone();
        let native = catalog[0].clone();
        let variants = vec![sgx.clone(), native.clone()];

        let dir = tempfile::tempdir().unwrap();
        let mut results = ResultsManager::new(dir.path()).unwrap();
        driver.run_all(&variants, &mut results).await.unwrap();

        let outcomes = results.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].variant, sgx.name);
        match &outcomes[0].status {
            VariantStatus::Failed { stage, reason } => {
                assert_eq!(stage, "start");
                assert!(reason.contains("password"));
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(outcomes[0].run_count, 0);
        assert_eq!(outcomes[1].status, VariantStatus::Completed);

        // Only the native variant was ever built, started and stopped.
        assert_eq!(control.count("elevate"), 1);
        assert_eq!(control.count("build"), 1);
        assert_eq!(control.count(&format!("start {}", sgx.name)), 0);
        assert_eq!(control.count(&format!("start {}", native.name)), 1);
        assert_eq!(control.count("stop"), 1);
        assert!(results.records().iter().all(|r| r.variant == native.name));
    }
}
