//! The chaos engine proper: injection, cascades, and recovery.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use fleetsim_clock::Clock;
use fleetsim_configs::{CascadeConfig, ChaosConfig, FailureType, RecoveryConfig, xid};
use fleetsim_core::{
    fleet::{FleetAccessor, FleetMap},
    metrics::Metrics,
    protocol::{InjectedFailure, unix_millis},
    shutdown::{ShutdownHandle, ShutdownSignal, shutdown_channel},
};
use rand::{Rng, SeedableRng as _, seq::SliceRandom as _};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution as _, Normal};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{generate, outage};

const INJECTION_TICK: Duration = Duration::from_secs(1);
const RECOVERY_TICK: Duration = Duration::from_secs(5);
const MIN_RECOVERY_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_RECOVERY_MEAN: Duration = Duration::from_secs(60);
const MAX_HISTORY: usize = 10_000;
const HISTORY_EVICTION: usize = 1_000;
const CASCADE_DELAY_BUMP: Duration = Duration::from_secs(1);

/// One entry of the append-only failure history.
#[derive(Clone, Debug, Serialize)]
pub struct FailureEvent {
    pub at_ms: u64,
    pub node_id: String,
    pub failure_type: FailureType,
    pub xid_code: u32,
    pub gpu_index: i32,
    pub message: String,
    pub is_cascade: bool,
    pub cascade_from: Option<String>,
}

/// A failure can be scheduled for recovery unless it is an XID error that
/// the catalog classifies fatal (or one the catalog does not know).
#[must_use]
pub fn is_recoverable(failure: &InjectedFailure) -> bool {
    failure.failure_type != FailureType::XidError
        || xid::xid_info(failure.xid_code).is_some_and(|info| !info.fatal)
}

pub(crate) enum InjectionOrigin {
    Chaos,
    Cascade { from: String },
    Outage,
}

struct CascadeChild {
    target: String,
    delay: Duration,
    failure: InjectedFailure,
}

pub(crate) struct ChaosState {
    pub(crate) rng: ChaCha20Rng,
    history: Vec<FailureEvent>,
    pending_recoveries: HashMap<(String, FailureType), SystemTime>,
}

/// Seeded failure-injection engine over a live fleet.
pub struct ChaosEngine {
    pub(crate) config: ChaosConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) fleet: FleetAccessor,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) state: Mutex<ChaosState>,
    signals: Mutex<Option<(ShutdownSignal, ShutdownSignal)>>,
    stop_handle: Mutex<Option<ShutdownHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChaosEngine {
    #[must_use]
    pub fn new(
        config: ChaosConfig,
        clock: Arc<dyn Clock>,
        fleet: FleetAccessor,
        metrics: Arc<Metrics>,
        seed: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            fleet,
            metrics,
            state: Mutex::new(ChaosState {
                rng: ChaCha20Rng::seed_from_u64(seed),
                history: Vec::new(),
                pending_recoveries: HashMap::new(),
            }),
            signals: Mutex::new(None),
            stop_handle: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the injection and recovery loops plus one task per scheduled
    /// outage. No-op when chaos is disabled in the scenario.
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownSignal) {
        if !self.config.enabled {
            info!("chaos engine disabled for this scenario");
            return;
        }

        let (handle, local) = shutdown_channel();
        *self.stop_handle.lock().expect("chaos stop handle poisoned") = Some(handle);
        *self.signals.lock().expect("chaos signals poisoned") =
            Some((shutdown.clone(), local.clone()));

        let mut tasks = self.tasks.lock().expect("chaos tasks poisoned");
        tasks.push(tokio::spawn(Self::injection_loop(
            Arc::clone(self),
            shutdown.clone(),
            local.clone(),
        )));
        tasks.push(tokio::spawn(Self::recovery_loop(
            Arc::clone(self),
            shutdown.clone(),
            local.clone(),
        )));
        for outage_config in self.config.scheduled_outages.clone() {
            tasks.push(tokio::spawn(outage::run_outage(
                Arc::clone(self),
                outage_config,
                shutdown.clone(),
                local.clone(),
            )));
        }

        info!(
            failure_rate = self.config.failure_rate,
            cascading = self.config.cascading.enabled,
            recovery = self.config.recovery.enabled,
            outages = self.config.scheduled_outages.len(),
            "chaos engine started"
        );
    }

    /// Idempotent shutdown of every chaos task.
    pub fn stop(&self) {
        if let Some(handle) = self
            .stop_handle
            .lock()
            .expect("chaos stop handle poisoned")
            .take()
        {
            handle.shutdown();
        }
        for task in self.tasks.lock().expect("chaos tasks poisoned").drain(..) {
            task.abort();
        }
    }

    /// Snapshot of the failure history ring.
    #[must_use]
    pub fn history(&self) -> Vec<FailureEvent> {
        self.state
            .lock()
            .expect("chaos state poisoned")
            .history
            .clone()
    }

    #[must_use]
    pub fn pending_recovery_count(&self) -> usize {
        self.state
            .lock()
            .expect("chaos state poisoned")
            .pending_recoveries
            .len()
    }

    async fn injection_loop(engine: Arc<Self>, shutdown: ShutdownSignal, local: ShutdownSignal) {
        let mut ticker = engine.clock.ticker(INJECTION_TICK);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = local.cancelled() => break,
                tick = ticker.tick() => {
                    if tick.is_none() {
                        break;
                    }
                    engine.injection_tick().await;
                }
            }
        }
    }

    /// One injection round: rate roll, victim roll, weighted type roll.
    async fn injection_tick(self: &Arc<Self>) {
        let fleet = (self.fleet)();
        if fleet.is_empty() {
            return;
        }
        let adjusted_rate =
            (self.config.failure_rate / 60.0) * (fleet.len() as f64 / 1000.0);

        let picked = {
            let now_ms = unix_millis(self.clock.now());
            let mut state = self.state.lock().expect("chaos state poisoned");
            if state.rng.r#gen::<f64>() >= adjusted_rate {
                None
            } else {
                let mut ids: Vec<&String> = fleet.keys().collect();
                ids.sort();
                let victim = ids[state.rng.gen_range(0..ids.len())].clone();
                let failure_type = generate::pick_failure_type(&mut state.rng, &self.config);
                let failure =
                    generate::generate_failure(&mut state.rng, &self.config, failure_type, now_ms);
                Some((victim, failure))
            }
        };

        let Some((victim, failure)) = picked else {
            return;
        };
        if self.inject(&victim, failure, InjectionOrigin::Chaos).await {
            self.propagate_cascade(&victim, 0);
        }
    }

    /// Injects into the agent, records metrics and history, and (for chaos
    /// and cascade failures) rolls a recovery schedule. The engine lock is
    /// never held across the agent call.
    pub(crate) async fn inject(
        &self,
        node_id: &str,
        failure: InjectedFailure,
        origin: InjectionOrigin,
    ) -> bool {
        let fleet = (self.fleet)();
        let Some(agent) = fleet.get(node_id) else {
            warn!(node = node_id, "injection target not in fleet");
            return false;
        };
        agent.inject_failure(failure.clone()).await;

        let now = self.clock.now();
        self.metrics.record_failure(node_id, &failure, now);

        let (is_cascade, cascade_from, with_recovery) = match origin {
            InjectionOrigin::Chaos => (false, None, true),
            InjectionOrigin::Cascade { from } => (true, Some(from), true),
            InjectionOrigin::Outage => (false, None, false),
        };
        self.record_event(FailureEvent {
            at_ms: unix_millis(now),
            node_id: node_id.to_owned(),
            failure_type: failure.failure_type,
            xid_code: failure.xid_code,
            gpu_index: failure.gpu_index,
            message: failure.message.clone(),
            is_cascade,
            cascade_from,
        });
        if with_recovery {
            self.schedule_recovery(node_id, &failure);
        }
        true
    }

    fn record_event(&self, event: FailureEvent) {
        let mut state = self.state.lock().expect("chaos state poisoned");
        push_capped(&mut state.history, event);
    }

    fn schedule_recovery(&self, node_id: &str, failure: &InjectedFailure) {
        let recovery = &self.config.recovery;
        if !recovery.enabled || !is_recoverable(failure) {
            return;
        }
        let now = self.clock.now();
        let mut state = self.state.lock().expect("chaos state poisoned");
        if state.rng.r#gen::<f64>() >= recovery.probability {
            return;
        }
        let delay = recovery_delay(&mut state.rng, recovery);
        state
            .pending_recoveries
            .insert((node_id.to_owned(), failure.failure_type), now + delay);
        debug!(
            node = node_id,
            failure_type = %failure.failure_type,
            delay_secs = delay.as_secs(),
            "recovery scheduled"
        );
    }

    async fn recovery_loop(engine: Arc<Self>, shutdown: ShutdownSignal, local: ShutdownSignal) {
        let mut ticker = engine.clock.ticker(RECOVERY_TICK);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = local.cancelled() => break,
                tick = ticker.tick() => {
                    if tick.is_none() {
                        break;
                    }
                    engine.recovery_tick().await;
                }
            }
        }
    }

    /// Fires due recoveries and drops entries whose node left the fleet.
    async fn recovery_tick(&self) {
        let now = self.clock.now();
        let fleet = (self.fleet)();

        let due: Vec<(String, FailureType)> = {
            let mut state = self.state.lock().expect("chaos state poisoned");
            let due: Vec<(String, FailureType)> = state
                .pending_recoveries
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &due {
                state.pending_recoveries.remove(key);
            }
            state
                .pending_recoveries
                .retain(|(node_id, _), _| fleet.contains_key(node_id));
            due
        };

        for (node_id, failure_type) in due {
            let Some(agent) = fleet.get(&node_id) else {
                warn!(node = %node_id, "recovery target not in fleet");
                continue;
            };
            if agent.recover_failure(failure_type).await {
                self.metrics.record_recovery(&node_id, failure_type, now);
                info!(node = %node_id, %failure_type, "chaos recovery fired");
            }
        }
    }

    /// Cascade fan-out from an injected failure. Each child runs as its own
    /// delayed task and recurses with `depth + 1`.
    pub(crate) fn propagate_cascade(self: &Arc<Self>, source_id: &str, depth: u32) {
        let cascade = &self.config.cascading;
        if !cascade.enabled || depth >= cascade.max_depth {
            return;
        }
        let fleet = (self.fleet)();
        let children = self.plan_cascade(&fleet, source_id);
        if children.is_empty() {
            return;
        }
        let Some((scenario, local)) = self
            .signals
            .lock()
            .expect("chaos signals poisoned")
            .clone()
        else {
            return;
        };

        debug!(
            source = source_id,
            children = children.len(),
            depth,
            "cascade triggered"
        );
        let mut tasks = self.tasks.lock().expect("chaos tasks poisoned");
        for child in children {
            let engine = Arc::clone(self);
            let source = source_id.to_owned();
            let scenario = scenario.clone();
            let local = local.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    () = scenario.cancelled() => return,
                    () = local.cancelled() => return,
                    () = engine.clock.sleep(child.delay) => {}
                }
                let origin = InjectionOrigin::Cascade { from: source };
                if engine.inject(&child.target, child.failure, origin).await {
                    engine.propagate_cascade(&child.target, depth + 1);
                }
            }));
        }
    }

    /// Rolls the cascade probability and picks delayed targets within the
    /// configured topological scope.
    fn plan_cascade(&self, fleet: &FleetMap, source_id: &str) -> Vec<CascadeChild> {
        let cascade = &self.config.cascading;
        let now_ms = unix_millis(self.clock.now());
        let mut state = self.state.lock().expect("chaos state poisoned");

        if state.rng.r#gen::<f64>() > cascade.probability {
            return Vec::new();
        }

        let segments = cascade.scope.prefix_segments();
        let mut candidates: Vec<String> = fleet
            .keys()
            .filter(|id| id.as_str() != source_id && shares_prefix(source_id, id, segments))
            .cloned()
            .collect();
        candidates.sort();
        if candidates.is_empty() {
            return Vec::new();
        }

        let pool = (candidates.len() as f64 * cascade.max_affected_percent).floor() as usize;
        let extra = if pool > 0 {
            state.rng.gen_range(0..pool)
        } else {
            0
        };
        let count = (1 + extra).min(candidates.len());
        candidates.shuffle(&mut state.rng);
        candidates.truncate(count);

        let (min_delay, max_delay) = cascade_delay_bounds(cascade);
        candidates
            .into_iter()
            .map(|target| {
                let delay_secs = state
                    .rng
                    .gen_range(min_delay.as_secs_f64()..max_delay.as_secs_f64());
                let failure =
                    generate::generate_xid_failure(&mut state.rng, &self.config, now_ms);
                CascadeChild {
                    target,
                    delay: Duration::from_secs_f64(delay_secs),
                    failure,
                }
            })
            .collect()
    }
}

/// Two node ids are in scope when their first `segments` hyphen-separated
/// id segments match; zero segments means everything qualifies.
fn shares_prefix(a: &str, b: &str, segments: usize) -> bool {
    if segments == 0 {
        return true;
    }
    a.split('-').take(segments).eq(b.split('-').take(segments))
}

/// Guard against inverted delay bounds.
fn cascade_delay_bounds(cascade: &CascadeConfig) -> (Duration, Duration) {
    let min = cascade.min_delay;
    let max = if cascade.max_delay <= min {
        min + CASCADE_DELAY_BUMP
    } else {
        cascade.max_delay
    };
    (min, max)
}

/// Normal(mean, stddev | mean/4) clamped to the 10 s floor.
fn recovery_delay(rng: &mut ChaCha20Rng, config: &RecoveryConfig) -> Duration {
    let mean = config
        .mean_time
        .unwrap_or(DEFAULT_RECOVERY_MEAN)
        .as_secs_f64();
    let stddev = config.std_dev.map_or(mean / 4.0, |d| d.as_secs_f64());
    let sample = Normal::new(mean, stddev).map_or(mean, |normal| normal.sample(rng));
    Duration::from_secs_f64(sample.max(MIN_RECOVERY_DELAY.as_secs_f64()))
}

fn push_capped(history: &mut Vec<FailureEvent>, event: FailureEvent) {
    if history.len() >= MAX_HISTORY {
        history.drain(..HISTORY_EVICTION);
    }
    history.push(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xid_failure(code: u32) -> InjectedFailure {
        InjectedFailure {
            failure_type: FailureType::XidError,
            xid_code: code,
            gpu_index: 0,
            message: String::new(),
            injected_at_ms: 0,
        }
    }

    #[test]
    fn recoverability_follows_catalog_fatality() {
        // Non-fatal xid: recoverable.
        assert!(is_recoverable(&xid_failure(31)));
        // Fatal xid: not recoverable.
        assert!(!is_recoverable(&xid_failure(79)));
        // Uncatalogued xid: not recoverable.
        assert!(!is_recoverable(&xid_failure(4242)));
        // Anything that is not an xid error is recoverable.
        let network = InjectedFailure {
            failure_type: FailureType::Network,
            ..xid_failure(0)
        };
        assert!(is_recoverable(&network));
    }

    #[test]
    fn recovery_delay_never_undercuts_floor() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let config = RecoveryConfig {
            enabled: true,
            probability: 1.0,
            mean_time: Some(Duration::from_secs(1)),
            std_dev: Some(Duration::from_secs(1)),
            ..RecoveryConfig::default()
        };
        for _ in 0..500 {
            assert!(recovery_delay(&mut rng, &config) >= MIN_RECOVERY_DELAY);
        }
    }

    #[test]
    fn recovery_delay_defaults_stddev_to_quarter_mean() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let config = RecoveryConfig {
            mean_time: Some(Duration::from_secs(400)),
            ..RecoveryConfig::default()
        };
        // mean 400, stddev 100: samples beyond [0, 800] are vanishingly rare.
        for _ in 0..200 {
            let delay = recovery_delay(&mut rng, &config);
            assert!(delay <= Duration::from_secs(1000), "{delay:?}");
        }
    }

    #[test]
    fn prefix_scope_matches_by_segment() {
        let a = "gcp-us-central1-h100-0001";
        let b = "gcp-us-central1-h100-0002";
        let c = "aws-us-east1-a100-0003";
        // provider scope (1 segment)
        assert!(shares_prefix(a, b, 1));
        assert!(!shares_prefix(a, c, 1));
        // region scope (2 segments)
        assert!(shares_prefix(a, b, 2));
        assert!(!shares_prefix(a, c, 2));
        // random scope (0 segments) matches everything
        assert!(shares_prefix(a, c, 0));
    }

    #[test]
    fn delay_bounds_guard_inversion() {
        let config = CascadeConfig {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(2),
            ..CascadeConfig::default()
        };
        let (min, max) = cascade_delay_bounds(&config);
        assert_eq!(min, Duration::from_secs(5));
        assert_eq!(max, Duration::from_secs(6));
    }

    #[test]
    fn history_ring_evicts_oldest_thousand() {
        let mut history = Vec::new();
        for index in 0..MAX_HISTORY {
            push_capped(&mut history, FailureEvent {
                at_ms: index as u64,
                node_id: String::new(),
                failure_type: FailureType::XidError,
                xid_code: 79,
                gpu_index: 0,
                message: String::new(),
                is_cascade: false,
                cascade_from: None,
            });
        }
        assert_eq!(history.len(), MAX_HISTORY);

        push_capped(&mut history, FailureEvent {
            at_ms: u64::MAX,
            node_id: String::new(),
            failure_type: FailureType::XidError,
            xid_code: 79,
            gpu_index: 0,
            message: String::new(),
            is_cascade: false,
            cascade_from: None,
        });
        assert_eq!(history.len(), MAX_HISTORY - HISTORY_EVICTION + 1);
        assert_eq!(history[0].at_ms, HISTORY_EVICTION as u64);
        assert_eq!(history.last().map(|event| event.at_ms), Some(u64::MAX));
    }
}
