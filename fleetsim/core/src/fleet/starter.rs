//! Brings agents up over time: four startup patterns, uniform jitter, and a
//! sampled cold-start delay per node.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use fleetsim_clock::Clock;
use fleetsim_configs::{NodeSpec, StartupConfig, StartupPattern};
use rand::{Rng, SeedableRng as _};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution as _, Normal};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{info, warn};

use crate::{DynError, shutdown::ShutdownSignal};

/// In-flight cap for the instant pattern.
const MAX_CONCURRENT_STARTS: usize = 100;

/// Result of one node-start attempt.
#[derive(Debug)]
pub enum StartOutcome {
    Started,
    Cancelled,
    Failed { id: String, error: String },
}

/// Aggregate of a fleet bring-up. Individual start failures do not abort
/// the run; they are collected and reported once.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: usize,
    pub failures: Vec<(String, String)>,
    pub cancelled: bool,
}

/// Startup-pattern driver.
pub struct NodeStarter {
    clock: Arc<dyn Clock>,
    config: StartupConfig,
    rng: Mutex<ChaCha20Rng>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl NodeStarter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: StartupConfig, seed: u64) -> Self {
        Self {
            clock,
            config,
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
            delays: Mutex::new(HashMap::new()),
        }
    }

    /// Cold-start delay chosen for each node, keyed by id (reporting).
    #[must_use]
    pub fn recorded_delays(&self) -> HashMap<String, Duration> {
        self.delays.lock().expect("delay record poisoned").clone()
    }

    /// Drives the configured pattern over `specs`, invoking `start_node`
    /// once per spec after its cold-start delay.
    pub async fn start_fleet<F, Fut>(
        &self,
        specs: &[NodeSpec],
        shutdown: &ShutdownSignal,
        start_node: F,
    ) -> StartReport
    where
        F: Fn(NodeSpec) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        let mut report = StartReport::default();
        if specs.is_empty() {
            return report;
        }

        let duration = self.config.duration.unwrap_or_default();
        let mut tasks: JoinSet<StartOutcome> = JoinSet::new();

        match self.config.pattern {
            StartupPattern::Instant => {
                let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_STARTS));
                for spec in specs {
                    self.spawn_start(
                        &mut tasks,
                        spec,
                        shutdown,
                        start_node.clone(),
                        Some(Arc::clone(&semaphore)),
                    );
                }
            }
            StartupPattern::Linear => {
                let interval = duration / specs.len() as u32;
                for (index, spec) in specs.iter().enumerate() {
                    self.spawn_start(&mut tasks, spec, shutdown, start_node.clone(), None);
                    if index + 1 < specs.len()
                        && !self.pause_between_rounds(interval, shutdown).await
                    {
                        report.cancelled = true;
                        break;
                    }
                }
            }
            StartupPattern::Exponential => {
                let rounds = exponential_rounds(specs.len());
                let interval = duration / rounds;
                let mut batch = 1usize;
                let mut offset = 0usize;
                while offset < specs.len() {
                    let end = (offset + batch).min(specs.len());
                    for spec in &specs[offset..end] {
                        self.spawn_start(&mut tasks, spec, shutdown, start_node.clone(), None);
                    }
                    offset = end;
                    if offset < specs.len()
                        && !self.pause_between_rounds(interval, shutdown).await
                    {
                        report.cancelled = true;
                        break;
                    }
                    batch *= 2;
                }
            }
            StartupPattern::Wave => {
                let batch = self.config.batch_size.unwrap_or(100).max(1);
                let num_batches = specs.len().div_ceil(batch) as u32;
                let interval = duration / num_batches;
                for (index, chunk) in specs.chunks(batch).enumerate() {
                    for spec in chunk {
                        self.spawn_start(&mut tasks, spec, shutdown, start_node.clone(), None);
                    }
                    if (index as u32) + 1 < num_batches
                        && !self.pause_between_rounds(interval, shutdown).await
                    {
                        report.cancelled = true;
                        break;
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(StartOutcome::Started) => report.started += 1,
                Ok(StartOutcome::Cancelled) => report.cancelled = true,
                Ok(StartOutcome::Failed { id, error }) => report.failures.push((id, error)),
                Err(join_error) if join_error.is_cancelled() => report.cancelled = true,
                Err(join_error) => {
                    report
                        .failures
                        .push(("unknown".to_owned(), join_error.to_string()));
                }
            }
        }

        if report.failures.is_empty() {
            info!(
                started = report.started,
                pattern = ?self.config.pattern,
                "fleet startup complete"
            );
        } else {
            warn!(
                started = report.started,
                failed = report.failures.len(),
                "fleet startup finished with failures"
            );
        }
        report
    }

    fn spawn_start<F, Fut>(
        &self,
        tasks: &mut JoinSet<StartOutcome>,
        spec: &NodeSpec,
        shutdown: &ShutdownSignal,
        start_node: F,
        semaphore: Option<Arc<Semaphore>>,
    ) where
        F: Fn(NodeSpec) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        let delay = self.cold_start_delay();
        self.delays
            .lock()
            .expect("delay record poisoned")
            .insert(spec.id.clone(), delay);

        let clock = Arc::clone(&self.clock);
        let shutdown = shutdown.clone();
        let spec = spec.clone();
        tasks.spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => {
                    tokio::select! {
                        () = shutdown.cancelled() => return StartOutcome::Cancelled,
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => return StartOutcome::Cancelled,
                        },
                    }
                }
                None => None,
            };

            if !delay.is_zero() {
                let mut timer = clock.timer(delay);
                tokio::select! {
                    () = shutdown.cancelled() => return StartOutcome::Cancelled,
                    _ = timer.fired() => {}
                }
            }
            // Zero-delay starts take no timer wait above, and a released
            // permit unblocks the next queued task without one either; the
            // start itself still must not slip past a cancellation.
            if shutdown.is_cancelled() {
                return StartOutcome::Cancelled;
            }

            let id = spec.id.clone();
            match start_node(spec).await {
                Ok(()) => StartOutcome::Started,
                Err(error) => StartOutcome::Failed {
                    id,
                    error: error.to_string(),
                },
            }
        });
    }

    /// Sleeps `jitter(interval)` unless shutdown arrives first; false means
    /// the pattern should stop spawning further rounds.
    async fn pause_between_rounds(&self, interval: Duration, shutdown: &ShutdownSignal) -> bool {
        let pause = self.jitter(interval);
        tokio::select! {
            () = shutdown.cancelled() => false,
            () = self.clock.sleep(pause) => true,
        }
    }

    /// Uniform within ±`jitter_percent` of `duration`.
    fn jitter(&self, duration: Duration) -> Duration {
        let percent = self.config.jitter_percent;
        if percent == 0.0 || duration.is_zero() {
            return duration;
        }
        let mut rng = self.rng.lock().expect("starter rng poisoned");
        let factor = 1.0 + (rng.r#gen::<f64>() - 0.5) * 2.0 * percent / 100.0;
        duration.mul_f64(factor.max(0.0))
    }

    /// Normal(mean, stddev) clamped to [min, max] when a mean is set,
    /// uniform in [min, max] when only bounds are set, zero otherwise.
    fn cold_start_delay(&self) -> Duration {
        let config = &self.config;
        let min = config.cold_start_min.unwrap_or_default();
        let mut rng = self.rng.lock().expect("starter rng poisoned");

        if let Some(mean) = config.cold_start_mean {
            let stddev = config.cold_start_stddev.unwrap_or_default();
            let sample = Normal::new(mean.as_secs_f64(), stddev.as_secs_f64())
                .map_or(mean.as_secs_f64(), |normal| normal.sample(&mut *rng));
            let mut delay = Duration::from_secs_f64(sample.max(0.0));
            if delay < min {
                delay = min;
            }
            if let Some(max) = config.cold_start_max {
                if delay > max {
                    delay = max;
                }
            }
            return delay;
        }

        if let Some(max) = config.cold_start_max {
            if max > min {
                let secs = rng.gen_range(min.as_secs_f64()..=max.as_secs_f64());
                return Duration::from_secs_f64(secs);
            }
            return min;
        }

        min
    }
}

/// Rounds needed when the batch starts at one and doubles each round.
fn exponential_rounds(total: usize) -> u32 {
    let mut rounds = 0u32;
    let mut batch = 1usize;
    let mut remaining = total;
    while remaining > 0 {
        rounds += 1;
        remaining = remaining.saturating_sub(batch);
        batch = batch.saturating_mul(2);
    }
    rounds.max(1)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleetsim_clock::FakeClock;

    use super::*;
    use crate::shutdown::shutdown_channel;

    fn specs(count: usize) -> Vec<NodeSpec> {
        (0..count)
            .map(|index| NodeSpec {
                id: format!("node-{index:04}"),
                provider: "gcp".to_owned(),
                region: "us-central1".to_owned(),
                zone: "us-central1-a".to_owned(),
                instance_type: "a3-highgpu-8g".to_owned(),
                gpu_count: 8,
                gpu_type: "H100".to_owned(),
                labels: Default::default(),
            })
            .collect()
    }

    fn instant_config() -> StartupConfig {
        StartupConfig::default()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn all_patterns_handle_empty_fleets() {
        let (_handle, shutdown) = shutdown_channel();
        for pattern in [
            StartupPattern::Instant,
            StartupPattern::Linear,
            StartupPattern::Exponential,
            StartupPattern::Wave,
        ] {
            let starter = NodeStarter::new(
                Arc::new(FakeClock::new()),
                StartupConfig {
                    pattern,
                    ..StartupConfig::default()
                },
                1,
            );
            let report = starter
                .start_fleet(&[], &shutdown, |_spec| async { Ok(()) })
                .await;
            assert_eq!(report.started, 0);
            assert!(report.failures.is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn instant_pattern_starts_everything() {
        let (_handle, shutdown) = shutdown_channel();
        let starter = NodeStarter::new(Arc::new(FakeClock::new()), instant_config(), 1);
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);

        let report = starter
            .start_fleet(&specs(250), &shutdown, move |_spec| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.started, 250);
        assert_eq!(started.load(Ordering::SeqCst), 250);
        assert_eq!(starter.recorded_delays().len(), 250);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_shutdown_stops_zero_delay_starts() {
        let (handle, shutdown) = shutdown_channel();
        handle.shutdown();

        let starter = NodeStarter::new(Arc::new(FakeClock::new()), instant_config(), 1);
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);

        let report = starter
            .start_fleet(&specs(200), &shutdown, move |_spec| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.started, 0);
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert!(report.cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_are_collected_not_fatal() {
        let (_handle, shutdown) = shutdown_channel();
        let starter = NodeStarter::new(Arc::new(FakeClock::new()), instant_config(), 1);

        let report = starter
            .start_fleet(&specs(10), &shutdown, |spec| async move {
                if spec.id.ends_with("3") {
                    Err("registration rejected".into())
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.started, 9);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "node-0003");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wave_pattern_spawns_expected_batches() {
        let (_handle, shutdown) = shutdown_channel();
        let clock = Arc::new(FakeClock::new());
        let starter = NodeStarter::new(
            Arc::clone(&clock) as Arc<dyn Clock>,
            StartupConfig {
                pattern: StartupPattern::Wave,
                batch_size: Some(4),
                ..StartupConfig::default()
            },
            1,
        );

        let report = starter
            .start_fleet(&specs(10), &shutdown, |_spec| async { Ok(()) })
            .await;
        // 10 nodes at batch size 4: ceil(10/4) = 3 batches, all started.
        assert_eq!(report.started, 10);
    }

    #[test]
    fn exponential_round_count_doubles_batches() {
        assert_eq!(exponential_rounds(0), 1);
        assert_eq!(exponential_rounds(1), 1);
        assert_eq!(exponential_rounds(2), 2);
        assert_eq!(exponential_rounds(3), 2);
        assert_eq!(exponential_rounds(7), 3);
        assert_eq!(exponential_rounds(100), 7);
    }

    #[test]
    fn jitter_bounds_hold() {
        let starter = NodeStarter::new(
            Arc::new(FakeClock::new()),
            StartupConfig {
                jitter_percent: 20.0,
                ..StartupConfig::default()
            },
            1,
        );
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let jittered = starter.jitter(base);
            assert!(jittered >= Duration::from_secs(8), "{jittered:?}");
            assert!(jittered <= Duration::from_secs(12), "{jittered:?}");
        }
    }

    #[test]
    fn cold_start_clamps_to_bounds() {
        let starter = NodeStarter::new(
            Arc::new(FakeClock::new()),
            StartupConfig {
                cold_start_mean: Some(Duration::from_secs(30)),
                cold_start_stddev: Some(Duration::from_secs(20)),
                cold_start_min: Some(Duration::from_secs(10)),
                cold_start_max: Some(Duration::from_secs(40)),
                ..StartupConfig::default()
            },
            1,
        );
        for _ in 0..200 {
            let delay = starter.cold_start_delay();
            assert!(delay >= Duration::from_secs(10), "{delay:?}");
            assert!(delay <= Duration::from_secs(40), "{delay:?}");
        }
    }

    #[test]
    fn cold_start_uniform_between_bounds() {
        let starter = NodeStarter::new(
            Arc::new(FakeClock::new()),
            StartupConfig {
                cold_start_min: Some(Duration::from_secs(1)),
                cold_start_max: Some(Duration::from_secs(2)),
                ..StartupConfig::default()
            },
            1,
        );
        for _ in 0..100 {
            let delay = starter.cold_start_delay();
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn cold_start_defaults_to_zero() {
        let starter = NodeStarter::new(Arc::new(FakeClock::new()), StartupConfig::default(), 1);
        assert_eq!(starter.cold_start_delay(), Duration::ZERO);
    }
}
