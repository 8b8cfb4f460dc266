//! Simulated worker agent: registers with the control plane, heartbeats,
//! reports health, and polls for commands until stopped.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use fleetsim_clock::Clock;
use fleetsim_configs::{CommandKind, FailureType, NodeSpec};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    control::{ClientError, ControlPlaneClient},
    protocol::InjectedFailure,
    shutdown::{ShutdownHandle, ShutdownSignal, shutdown_channel},
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(15);
const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent '{id}' failed to register")]
    Register {
        id: String,
        #[source]
        source: ClientError,
    },
    #[error("agent '{id}' is already running")]
    AlreadyRunning { id: String },
}

struct AgentState {
    failures: Vec<InjectedFailure>,
    running: bool,
}

/// One simulated fleet worker.
pub struct SimulatedAgent {
    spec: NodeSpec,
    generation: u32,
    clock: Arc<dyn Clock>,
    client: ControlPlaneClient,
    state: Mutex<AgentState>,
    stop_handle: Mutex<Option<ShutdownHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SimulatedAgent {
    #[must_use]
    pub fn new(spec: NodeSpec, clock: Arc<dyn Clock>, client: ControlPlaneClient) -> Self {
        Self::with_generation(spec, clock, client, 0)
    }

    /// Replacement agents carry the generation of the node id they extend.
    #[must_use]
    pub fn with_generation(
        spec: NodeSpec,
        clock: Arc<dyn Clock>,
        client: ControlPlaneClient,
        generation: u32,
    ) -> Self {
        Self {
            spec,
            generation,
            clock,
            client,
            state: Mutex::new(AgentState {
                failures: Vec::new(),
                running: false,
            }),
            stop_handle: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    #[must_use]
    pub const fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().expect("agent state poisoned").running
    }

    /// Registers with the control plane and spawns the periodic loops.
    pub async fn start(self: &Arc<Self>, shutdown: &ShutdownSignal) -> Result<(), AgentError> {
        {
            let mut state = self.state.lock().expect("agent state poisoned");
            if state.running {
                return Err(AgentError::AlreadyRunning {
                    id: self.spec.id.clone(),
                });
            }
            state.running = true;
        }

        if let Err(source) = self.client.register_node(&self.spec).await {
            self.state.lock().expect("agent state poisoned").running = false;
            return Err(AgentError::Register {
                id: self.spec.id.clone(),
                source,
            });
        }

        let (handle, local) = shutdown_channel();
        *self.stop_handle.lock().expect("stop handle poisoned") = Some(handle);

        let mut tasks = self.tasks.lock().expect("agent tasks poisoned");
        tasks.push(tokio::spawn(Self::heartbeat_loop(
            Arc::clone(self),
            shutdown.clone(),
            local.clone(),
        )));
        tasks.push(tokio::spawn(Self::health_loop(
            Arc::clone(self),
            shutdown.clone(),
            local.clone(),
        )));
        tasks.push(tokio::spawn(Self::command_loop(
            Arc::clone(self),
            shutdown.clone(),
            local,
        )));

        debug!(node = self.id(), "agent started");
        Ok(())
    }

    /// Stops the loops. Idempotent and safe from any task.
    pub fn stop(&self) {
        self.state.lock().expect("agent state poisoned").running = false;
        if let Some(handle) = self.stop_handle.lock().expect("stop handle poisoned").take() {
            handle.shutdown();
        }
        for task in self.tasks.lock().expect("agent tasks poisoned").drain(..) {
            task.abort();
        }
    }

    /// Records a fault and pushes a health report so the control plane
    /// observes it without waiting for the periodic cadence.
    pub async fn inject_failure(&self, failure: InjectedFailure) {
        info!(
            node = self.id(),
            failure_type = %failure.failure_type,
            xid = failure.xid_code,
            gpu = failure.gpu_index,
            "injecting failure"
        );
        self.state
            .lock()
            .expect("agent state poisoned")
            .failures
            .push(failure);
        self.push_health().await;
    }

    /// Removes every failure of the given type; true iff any was present.
    pub async fn recover_failure(&self, failure_type: FailureType) -> bool {
        let removed = {
            let mut state = self.state.lock().expect("agent state poisoned");
            let before = state.failures.len();
            state
                .failures
                .retain(|failure| failure.failure_type != failure_type);
            before != state.failures.len()
        };
        if removed {
            info!(node = self.id(), %failure_type, "failure recovered");
            self.push_health().await;
        }
        removed
    }

    /// Drops every active failure.
    pub async fn clear_failures(&self) {
        self.state
            .lock()
            .expect("agent state poisoned")
            .failures
            .clear();
        self.push_health().await;
    }

    /// Snapshot of the active failures (callers get their own copy).
    #[must_use]
    pub fn failures(&self) -> Vec<InjectedFailure> {
        self.state
            .lock()
            .expect("agent state poisoned")
            .failures
            .clone()
    }

    async fn push_health(&self) {
        let failures = self.failures();
        if let Err(error) = self.client.report_health(self.id(), &failures).await {
            warn!(node = self.id(), %error, "health report failed");
        }
    }

    async fn heartbeat_loop(agent: Arc<Self>, shutdown: ShutdownSignal, local: ShutdownSignal) {
        let mut ticker = agent.clock.ticker(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = local.cancelled() => break,
                tick = ticker.tick() => {
                    if tick.is_none() {
                        break;
                    }
                    if let Err(error) = agent.client.send_heartbeat(agent.id()).await {
                        warn!(node = agent.id(), %error, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn health_loop(agent: Arc<Self>, shutdown: ShutdownSignal, local: ShutdownSignal) {
        let mut ticker = agent.clock.ticker(HEALTH_REPORT_INTERVAL);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = local.cancelled() => break,
                tick = ticker.tick() => {
                    if tick.is_none() {
                        break;
                    }
                    agent.push_health().await;
                }
            }
        }
    }

    async fn command_loop(agent: Arc<Self>, shutdown: ShutdownSignal, local: ShutdownSignal) {
        let mut ticker = agent.clock.ticker(COMMAND_POLL_INTERVAL);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = local.cancelled() => break,
                tick = ticker.tick() => {
                    if tick.is_none() {
                        break;
                    }
                    match agent.client.get_node_commands(agent.id()).await {
                        Ok(commands) => {
                            for command in commands {
                                agent.handle_command(&command.command);
                            }
                        }
                        Err(error) => {
                            debug!(node = agent.id(), %error, "command poll failed");
                        }
                    }
                }
            }
        }
    }

    fn handle_command(&self, command: &CommandKind) {
        info!(node = self.id(), command = %command, "command received");
        if *command == CommandKind::Terminate {
            self.stop();
        }
    }
}

impl Drop for SimulatedAgent {
    fn drop(&mut self) {
        for task in self.tasks.lock().expect("agent tasks poisoned").drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> NodeSpec {
        NodeSpec {
            id: id.to_owned(),
            provider: "gcp".to_owned(),
            region: "us-central1".to_owned(),
            zone: "us-central1-a".to_owned(),
            instance_type: "a3-highgpu-8g".to_owned(),
            gpu_count: 8,
            gpu_type: "H100".to_owned(),
            labels: Default::default(),
        }
    }

    fn offline_agent() -> SimulatedAgent {
        // Port 1 refuses connections; health pushes degrade to warnings.
        SimulatedAgent::new(
            spec("n1"),
            Arc::new(fleetsim_clock::FakeClock::new()),
            ControlPlaneClient::new("http://127.0.0.1:1"),
        )
    }

    #[tokio::test]
    async fn failure_list_tracks_inject_recover_clear() {
        let agent = offline_agent();
        agent
            .inject_failure(InjectedFailure {
                failure_type: FailureType::XidError,
                xid_code: 79,
                gpu_index: 0,
                message: String::new(),
                injected_at_ms: 0,
            })
            .await;
        agent
            .inject_failure(InjectedFailure {
                failure_type: FailureType::Temperature,
                xid_code: 0,
                gpu_index: 2,
                message: String::new(),
                injected_at_ms: 0,
            })
            .await;
        assert_eq!(agent.failures().len(), 2);

        assert!(agent.recover_failure(FailureType::XidError).await);
        assert!(!agent.recover_failure(FailureType::XidError).await);
        assert_eq!(agent.failures().len(), 1);

        agent.clear_failures().await;
        assert!(agent.failures().is_empty());
    }

    #[tokio::test]
    async fn returned_failure_snapshot_is_detached() {
        let agent = offline_agent();
        agent
            .inject_failure(InjectedFailure {
                failure_type: FailureType::Network,
                xid_code: 0,
                gpu_index: -1,
                message: String::new(),
                injected_at_ms: 0,
            })
            .await;

        let mut snapshot = agent.failures();
        snapshot.clear();
        assert_eq!(agent.failures().len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let agent = offline_agent();
        agent.stop();
        agent.stop();
        assert!(!agent.is_running());
    }
}
