use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use fleetsim_chaos::ChaosEngine;
use fleetsim_clock::{Clock, SystemClock};
use fleetsim_configs::{
    EventAction, HealthStatus, NodeSpec, NodeStatus, RecoveryConfig, Scenario,
    ScenarioValidationError, StressConfig,
};
use fleetsim_core::{
    DynError, SimulatedAgent,
    control::{ClientError, ControlPlane, ControlPlaneClient, ControlPlaneDb, ServerError},
    fleet::{Fleet, FleetGenError, FleetGenerator, NodeStarter},
    metrics::{Metrics, NodeEventKind},
    protocol::unix_millis,
    shutdown::{ShutdownSignal, shutdown_channel},
};
use rand::Rng as _;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{assertions, events::EventDriver, report::RunReport, rundir::RunDirectory};

const READY_ATTEMPTS: usize = 20;
const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_STRESS_DURATION: Duration = Duration::from_secs(60);
const PROGRESS_TICK: Duration = Duration::from_secs(1);
const PROGRESS_LOG_EVERY_SECS: u64 = 10;
const DEFAULT_REPLACE_MIN: Duration = Duration::from_secs(30);
const DEFAULT_REPLACE_MAX: Duration = Duration::from_secs(60);
const DEFAULT_REPORT_JSON: &str = "report.json";
const DEFAULT_REPORT_HTML: &str = "report.html";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Validation(#[from] ScenarioValidationError),
    #[error("control plane setup failed")]
    Setup(#[from] ServerError),
    #[error("control plane never became reachable")]
    ControlPlane(#[source] ClientError),
    #[error(transparent)]
    FleetGen(#[from] FleetGenError),
    #[error("report output failed")]
    Report(#[source] std::io::Error),
    #[error("event #{index} ({action}) failed: {message}")]
    Event {
        index: usize,
        action: EventAction,
        message: String,
    },
    #[error("event driver task failed: {0}")]
    EventDriver(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("scenario cancelled")]
    Cancelled,
}

/// Caller-facing knobs the scenario file does not carry.
#[derive(Clone, Debug)]
pub struct RunnerOptions {
    /// Base directory for stress run output trees.
    pub report_base: PathBuf,
    /// Keep the process alive after the run until externally cancelled.
    pub wait_for_cancel: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            report_base: fleetsim_env::fleetsim_report_dir()
                .unwrap_or_else(|| PathBuf::from("runs")),
            wait_for_cancel: false,
        }
    }
}

/// What a finished run looked like.
#[derive(Debug)]
pub struct RunSummary {
    pub scenario: String,
    pub nodes: usize,
    pub duration: Duration,
    pub total_failures: u64,
    pub total_recoveries: u64,
    pub report_dir: Option<PathBuf>,
}

/// Drives one scenario end to end.
pub struct ScenarioRunner {
    scenario: Scenario,
    clock: Arc<dyn Clock>,
    options: RunnerOptions,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(scenario: Scenario) -> Self {
        Self::with_clock(scenario, Arc::new(SystemClock::new()), RunnerOptions::default())
    }

    #[must_use]
    pub fn with_clock(scenario: Scenario, clock: Arc<dyn Clock>, options: RunnerOptions) -> Self {
        Self {
            scenario,
            clock,
            options,
        }
    }

    /// Runs the scenario. External cancellation surfaces as
    /// [`RunnerError::Cancelled`], never as a scenario failure.
    pub async fn run(&self, shutdown: &ShutdownSignal) -> Result<RunSummary, RunnerError> {
        self.scenario.validate()?;
        info!(
            scenario = %self.scenario.name,
            stress = self.scenario.is_stress_test(),
            "scenario starting"
        );

        let db = Arc::new(ControlPlaneDb::new());
        let control = ControlPlane::start(Arc::clone(&db)).await?;
        let client = ControlPlaneClient::new(control.base_url());
        if let Err(error) = client.wait_ready(READY_ATTEMPTS).await {
            control.shutdown().await;
            return Err(RunnerError::ControlPlane(error));
        }
        debug!(address = %control.local_addr(), "embedded control plane ready");

        let fleet = Fleet::new();
        let metrics = Arc::new(Metrics::new());

        let result = match self.scenario.stress.clone() {
            Some(stress) => {
                self.run_stress(&stress, &db, &client, &fleet, &metrics, shutdown)
                    .await
            }
            None => self.run_regular(&client, &fleet, shutdown).await,
        };

        for agent in fleet.agents() {
            agent.stop();
        }
        control.shutdown().await;

        match &result {
            Ok(summary) => info!(
                scenario = %summary.scenario,
                nodes = summary.nodes,
                failures = summary.total_failures,
                recoveries = summary.total_recoveries,
                "scenario finished"
            ),
            Err(error) => warn!(%error, "scenario failed"),
        }
        result
    }

    /// Regular path: just the event timeline, then the assertions.
    async fn run_regular(
        &self,
        client: &ControlPlaneClient,
        fleet: &Fleet,
        shutdown: &ShutdownSignal,
    ) -> Result<RunSummary, RunnerError> {
        let started_at = self.clock.now();
        let driver = EventDriver {
            clock: Arc::clone(&self.clock),
            client: client.clone(),
            fleet: fleet.clone(),
            declared_fleet: self.scenario.fleet.clone(),
            shutdown: shutdown.clone(),
            started_at,
        };
        driver.drive(self.scenario.events.clone()).await?;

        let failures = assertions::evaluate_all(client, &self.scenario.assertions).await;
        if !failures.is_empty() {
            return Err(RunnerError::Assertion(failures.join("\n")));
        }
        if self.options.wait_for_cancel {
            shutdown.cancelled().await;
        }

        Ok(RunSummary {
            scenario: self.scenario.name.clone(),
            nodes: fleet.len(),
            duration: self.clock.since(started_at),
            total_failures: 0,
            total_recoveries: 0,
            report_dir: None,
        })
    }

    /// Stress path: run directory, generated fleet, metrics sampler, chaos
    /// engine, background event driver, progress ticker, reports.
    async fn run_stress(
        &self,
        stress: &StressConfig,
        db: &Arc<ControlPlaneDb>,
        client: &ControlPlaneClient,
        fleet: &Fleet,
        metrics: &Arc<Metrics>,
        shutdown: &ShutdownSignal,
    ) -> Result<RunSummary, RunnerError> {
        let started_at = self.clock.now();
        let run_dir = Arc::new(
            RunDirectory::create(&self.options.report_base, &self.scenario, SystemTime::now())
                .map_err(RunnerError::Report)?,
        );
        info!(dir = %run_dir.root().display(), "run directory created");

        let seed = self.scenario.seed();
        let specs: Vec<NodeSpec> = match &stress.fleet_gen {
            Some(config) => FleetGenerator::new(config.clone(), seed).generate()?,
            None => self.scenario.fleet.clone(),
        };
        let _ = run_dir.append_log(
            "control-plane",
            &format!("control plane at {}", client.base_url()),
        );

        let (local_handle, local_signal) = shutdown_channel();
        let sampler = tokio::spawn(sample_loop(
            Arc::clone(&self.clock),
            client.clone(),
            Arc::clone(metrics),
            stress.metrics_interval.unwrap_or(DEFAULT_METRICS_INTERVAL),
            shutdown.clone(),
            local_signal.clone(),
        ));

        let startup = stress
            .fleet_gen
            .as_ref()
            .map(|config| config.startup.clone())
            .unwrap_or_default();
        let starter = NodeStarter::new(Arc::clone(&self.clock), startup, seed);
        let factory = {
            let clock = Arc::clone(&self.clock);
            let client = client.clone();
            let fleet = fleet.clone();
            let shutdown = shutdown.clone();
            let run_dir = Arc::clone(&run_dir);
            move |spec: NodeSpec| {
                let clock = Arc::clone(&clock);
                let client = client.clone();
                let fleet = fleet.clone();
                let shutdown = shutdown.clone();
                let run_dir = Arc::clone(&run_dir);
                async move {
                    let agent = Arc::new(SimulatedAgent::new(spec, clock, client));
                    agent
                        .start(&shutdown)
                        .await
                        .map_err(|error| -> DynError { Box::new(error) })?;
                    let _ = run_dir.append_log(agent.id(), "agent started");
                    fleet.insert(agent);
                    Ok(())
                }
            }
        };
        let start_report = starter.start_fleet(&specs, shutdown, factory).await;
        if start_report.cancelled && shutdown.is_cancelled() {
            local_handle.shutdown();
            return Err(RunnerError::Cancelled);
        }

        let chaos = stress.chaos.clone().map(|chaos_config| {
            let engine = ChaosEngine::new(
                chaos_config.clone(),
                Arc::clone(&self.clock),
                fleet.accessor(),
                Arc::clone(metrics),
                seed,
            );
            engine.start(shutdown);
            if chaos_config.recovery.replace_fatal {
                self.register_replacement(db, fleet, client, metrics, &chaos_config.recovery, shutdown);
            }
            engine
        });

        let events_task: Option<JoinHandle<Result<(), RunnerError>>> =
            if self.scenario.events.is_empty() {
                None
            } else {
                let driver = EventDriver {
                    clock: Arc::clone(&self.clock),
                    client: client.clone(),
                    fleet: fleet.clone(),
                    declared_fleet: self.scenario.fleet.clone(),
                    shutdown: shutdown.clone(),
                    started_at,
                };
                let events = self.scenario.events.clone();
                Some(tokio::spawn(async move { driver.drive(events).await }))
            };

        let duration = stress.duration.unwrap_or(DEFAULT_STRESS_DURATION);
        let run_outcome = self.progress_loop(started_at, duration, fleet, metrics, shutdown).await;

        local_handle.shutdown();
        if let Some(engine) = &chaos {
            engine.stop();
        }
        let event_outcome = match events_task {
            None => Ok(()),
            Some(task) => {
                if task.is_finished() {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(join_error) if join_error.is_cancelled() => Ok(()),
                        Err(join_error) => Err(RunnerError::EventDriver(join_error.to_string())),
                    }
                } else {
                    task.abort();
                    Ok(())
                }
            }
        };
        let _ = sampler.await;

        metrics.sample(self.clock.now());
        let assertion_failures =
            assertions::evaluate_all(client, &self.scenario.assertions).await;

        let finished_at = self.clock.now();
        let report = RunReport {
            scenario: self.scenario.name.clone(),
            description: self.scenario.description.clone(),
            started_at_ms: unix_millis(started_at),
            finished_at_ms: unix_millis(finished_at),
            duration_ms: self.clock.since(started_at).as_millis() as u64,
            total_nodes: fleet.len(),
            metrics: metrics.summary(),
            samples: metrics.samples(),
            failure_events: chaos
                .as_ref()
                .map(|engine| engine.history())
                .unwrap_or_default(),
            cold_start_delays_ms: starter
                .recorded_delays()
                .into_iter()
                .map(|(id, delay)| (id, delay.as_millis() as u64))
                .collect::<BTreeMap<_, _>>(),
            node_events: metrics.node_events(),
            assertion_failures: assertion_failures.clone(),
        };
        let json_name = stress
            .report_file
            .clone()
            .unwrap_or_else(|| DEFAULT_REPORT_JSON.to_owned());
        let html_name = stress
            .html_report_file
            .clone()
            .unwrap_or_else(|| DEFAULT_REPORT_HTML.to_owned());
        report
            .write_json(&run_dir.report_path(&json_name))
            .map_err(RunnerError::Report)?;
        report
            .write_html(&run_dir.report_path(&html_name))
            .map_err(RunnerError::Report)?;
        if let Err(error) = run_dir.finalize() {
            warn!(%error, "run directory finalize failed");
        }

        run_outcome?;
        event_outcome?;
        if !assertion_failures.is_empty() {
            return Err(RunnerError::Assertion(assertion_failures.join("\n")));
        }
        if self.options.wait_for_cancel {
            shutdown.cancelled().await;
        }

        Ok(RunSummary {
            scenario: self.scenario.name.clone(),
            nodes: fleet.len(),
            duration: self.clock.since(started_at),
            total_failures: metrics.total_failures(),
            total_recoveries: metrics.total_recoveries(),
            report_dir: Some(run_dir.root().to_path_buf()),
        })
    }

    /// One-second ticker until the configured duration elapses.
    async fn progress_loop(
        &self,
        started_at: SystemTime,
        duration: Duration,
        fleet: &Fleet,
        metrics: &Arc<Metrics>,
        shutdown: &ShutdownSignal,
    ) -> Result<(), RunnerError> {
        let mut ticker = self.clock.ticker(PROGRESS_TICK);
        loop {
            if self.clock.since(started_at) >= duration {
                return Ok(());
            }
            tokio::select! {
                () = shutdown.cancelled() => return Err(RunnerError::Cancelled),
                tick = ticker.tick() => {
                    if tick.is_none() {
                        return Ok(());
                    }
                    let elapsed = self.clock.since(started_at);
                    if elapsed.as_secs() % PROGRESS_LOG_EVERY_SECS == 0 {
                        debug!(
                            elapsed_secs = elapsed.as_secs(),
                            nodes = fleet.len(),
                            failures = metrics.total_failures(),
                            recoveries = metrics.total_recoveries(),
                            "stress progress"
                        );
                    }
                }
            }
        }
    }

    /// Fatal-node replacement: on an unhealthy transition the old agent is
    /// stopped and removed, and after a cold-start pause a `-gen{n+1}`
    /// successor takes its place in the fleet map.
    fn register_replacement(
        &self,
        db: &Arc<ControlPlaneDb>,
        fleet: &Fleet,
        client: &ControlPlaneClient,
        metrics: &Arc<Metrics>,
        recovery: &RecoveryConfig,
        shutdown: &ShutdownSignal,
    ) {
        let clock = Arc::clone(&self.clock);
        let fleet = fleet.clone();
        let client = client.clone();
        let metrics = Arc::clone(metrics);
        let shutdown = shutdown.clone();
        let replace_cold_start = recovery.replace_cold_start;

        db.on_status_change(Box::new(move |info, _previous, current| {
            if current != NodeStatus::Unhealthy || shutdown.is_cancelled() {
                return;
            }
            let Some(old_agent) = fleet.get(&info.spec.id) else {
                return;
            };

            let fleet = fleet.clone();
            let client = client.clone();
            let clock = Arc::clone(&clock);
            let metrics = Arc::clone(&metrics);
            let shutdown = shutdown.clone();
            let spec = info.spec.clone();
            tokio::spawn(async move {
                old_agent.stop();
                fleet.remove(&spec.id);
                info!(node = %spec.id, "unhealthy node removed, replacement pending");

                let delay = replace_cold_start.unwrap_or_else(|| {
                    let secs = rand::thread_rng().gen_range(
                        DEFAULT_REPLACE_MIN.as_secs_f64()..=DEFAULT_REPLACE_MAX.as_secs_f64(),
                    );
                    Duration::from_secs_f64(secs)
                });
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = clock.sleep(delay) => {}
                }

                let generation = old_agent.generation() + 1;
                let base = base_node_id(&spec.id, old_agent.generation()).to_owned();
                let mut new_spec = spec;
                new_spec.id = format!("{base}-gen{generation}");

                let replacement = Arc::new(SimulatedAgent::with_generation(
                    new_spec,
                    clock,
                    client,
                    generation,
                ));
                match replacement.start(&shutdown).await {
                    Ok(()) => {
                        metrics.record_node_event(
                            replacement.id(),
                            NodeEventKind::Replacement,
                            format!("generation {generation} replacement"),
                            SystemTime::now(),
                        );
                        info!(node = replacement.id(), generation, "replacement agent started");
                        fleet.insert(replacement);
                    }
                    Err(error) => {
                        warn!(node = replacement.id(), %error, "replacement agent failed to start");
                    }
                }
            });
        }));
    }
}

/// Strips the previous `-gen{n}` suffix so replacement ids never stack.
fn base_node_id(id: &str, generation: u32) -> &str {
    if generation == 0 {
        return id;
    }
    let suffix = format!("-gen{generation}");
    id.strip_suffix(suffix.as_str()).unwrap_or(id)
}

/// Periodic control-plane poll feeding the metrics samples. The RPC round
/// trip itself is the latency probe.
async fn sample_loop(
    clock: Arc<dyn Clock>,
    client: ControlPlaneClient,
    metrics: Arc<Metrics>,
    interval: Duration,
    shutdown: ShutdownSignal,
    local: ShutdownSignal,
) {
    let mut ticker = clock.ticker(interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = local.cancelled() => break,
            tick = ticker.tick() => {
                if tick.is_none() {
                    break;
                }
                let request_start = std::time::Instant::now();
                match client.list_nodes().await {
                    Ok(nodes) => {
                        metrics.observe_latency(request_start.elapsed());
                        let mut healthy = 0u64;
                        let mut degraded = 0u64;
                        let mut unhealthy = 0u64;
                        for node in &nodes {
                            match node.health {
                                HealthStatus::Healthy => healthy += 1,
                                HealthStatus::Degraded => degraded += 1,
                                HealthStatus::Unhealthy => unhealthy += 1,
                            }
                            metrics.set_node_status(&node.spec.id, node.status);
                        }
                        metrics.set_fleet_health(healthy, degraded, unhealthy);
                        metrics.sample(clock.now());
                    }
                    Err(error) => warn!(%error, "metrics sample failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_id_strips_only_matching_generation_suffix() {
        assert_eq!(base_node_id("gcp-us-h100-0001", 0), "gcp-us-h100-0001");
        assert_eq!(base_node_id("gcp-us-h100-0001-gen1", 1), "gcp-us-h100-0001");
        assert_eq!(base_node_id("gcp-us-h100-0001-gen2", 1), "gcp-us-h100-0001-gen2");
    }
}
