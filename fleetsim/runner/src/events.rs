//! Scripted event timeline: a time-sorted sequence of actions dispatched
//! against the fleet and the control plane.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use fleetsim_clock::Clock;
use fleetsim_configs::{Event, EventAction, FailureType, NodeSpec, xid};
use fleetsim_core::{
    SimulatedAgent,
    control::ControlPlaneClient,
    fleet::Fleet,
    protocol::{InjectedFailure, unix_millis},
    shutdown::ShutdownSignal,
};
use tracing::{info, warn};

use crate::{assertions, runner::RunnerError};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns everything an event needs to execute.
pub(crate) struct EventDriver {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) client: ControlPlaneClient,
    pub(crate) fleet: Fleet,
    pub(crate) declared_fleet: Vec<NodeSpec>,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) started_at: SystemTime,
}

impl EventDriver {
    /// Sorts the events by offset (stable, so equal offsets keep their
    /// declaration order) and dispatches them in turn.
    pub(crate) async fn drive(&self, events: Vec<Event>) -> Result<(), RunnerError> {
        let mut events = events;
        events.sort_by_key(|event| event.at);

        for (index, event) in events.iter().enumerate() {
            let elapsed = self.clock.since(self.started_at);
            if event.at > elapsed {
                let wait = event.at - elapsed;
                tokio::select! {
                    () = self.shutdown.cancelled() => return Err(RunnerError::Cancelled),
                    () = self.clock.sleep(wait) => {}
                }
            }
            if self.shutdown.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }
            self.dispatch(index, event).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, index: usize, event: &Event) -> Result<(), RunnerError> {
        let fail = |message: String| RunnerError::Event {
            index,
            action: event.action,
            message,
        };

        match event.action {
            EventAction::StartFleet => {
                self.start_declared_fleet().await;
                Ok(())
            }
            EventAction::StopFleet => {
                for agent in self.fleet.agents() {
                    agent.stop();
                }
                info!(nodes = self.fleet.len(), "fleet stopped");
                Ok(())
            }
            EventAction::InjectFailure => {
                let target = event.target.as_deref().ok_or_else(|| fail("missing target".into()))?;
                let agent = self
                    .fleet
                    .get(target)
                    .ok_or_else(|| fail(format!("unknown node '{target}'")))?;
                agent.inject_failure(self.failure_from_params(event)).await;
                Ok(())
            }
            EventAction::RecoverFailure => {
                let target = event.target.as_deref().ok_or_else(|| fail("missing target".into()))?;
                let agent = self
                    .fleet
                    .get(target)
                    .ok_or_else(|| fail(format!("unknown node '{target}'")))?;
                match event.params.failure_type {
                    Some(failure_type) => {
                        agent.recover_failure(failure_type).await;
                    }
                    // With no type given the event clears everything.
                    None => agent.clear_failures().await,
                }
                Ok(())
            }
            EventAction::IssueCommand => {
                let target = event.target.as_deref().ok_or_else(|| fail("missing target".into()))?;
                let command = event
                    .params
                    .command_type
                    .ok_or_else(|| fail("missing command_type".into()))?;
                self.client
                    .issue_command(target, command, "scenario event")
                    .await
                    .map_err(|error| fail(error.to_string()))?;
                Ok(())
            }
            EventAction::WaitForStatus => {
                let target = event.target.as_deref().ok_or_else(|| fail("missing target".into()))?;
                let expected = event
                    .params
                    .expected_status
                    .ok_or_else(|| fail("missing expected_status".into()))?;
                let timeout = event.params.timeout.unwrap_or(DEFAULT_STATUS_TIMEOUT);
                self.wait_for_status(target, expected, timeout).await
            }
            // The scheduler already waited until `at`.
            EventAction::Wait => Ok(()),
            EventAction::Log => {
                let message = event.params.message.as_deref().unwrap_or("");
                info!(event = "log", "{message}");
                Ok(())
            }
            EventAction::Assert => {
                let assertion = event
                    .params
                    .assertion
                    .as_ref()
                    .ok_or_else(|| fail("missing assertion body".into()))?;
                assertions::evaluate(&self.client, assertion)
                    .await
                    .map_err(RunnerError::Assertion)
            }
        }
    }

    /// Instantiates and starts every declared node sequentially. Individual
    /// failures are collected into one warning; the run continues.
    pub(crate) async fn start_declared_fleet(&self) {
        let mut failed = Vec::new();
        for spec in &self.declared_fleet {
            let agent = Arc::new(SimulatedAgent::new(
                spec.clone(),
                Arc::clone(&self.clock),
                self.client.clone(),
            ));
            match agent.start(&self.shutdown).await {
                Ok(()) => self.fleet.insert(agent),
                Err(error) => failed.push(format!("{}: {error}", spec.id)),
            }
        }
        if failed.is_empty() {
            info!(nodes = self.fleet.len(), "fleet started");
        } else {
            warn!(
                started = self.fleet.len(),
                failed = failed.len(),
                details = failed.join("; "),
                "some nodes failed to start"
            );
        }
    }

    /// Polls the control plane until the node reaches the expected status;
    /// timing out is an assertion failure, and poll errors are silently
    /// retried until the deadline.
    async fn wait_for_status(
        &self,
        target: &str,
        expected: fleetsim_configs::NodeStatus,
        timeout: Duration,
    ) -> Result<(), RunnerError> {
        let deadline_start = self.clock.now();
        loop {
            match self.client.get_node(target).await {
                Ok(node) if node.status == expected => {
                    info!(node = target, status = %expected, "status reached");
                    return Ok(());
                }
                Ok(_) | Err(_) => {}
            }
            if self.clock.since(deadline_start) >= timeout {
                return Err(RunnerError::Assertion(format!(
                    "wait_for_status({target}): did not reach {expected} within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return Err(RunnerError::Cancelled),
                () = self.clock.sleep(STATUS_POLL_INTERVAL) => {}
            }
        }
    }

    /// Failure payload for an `inject_failure` event; unset fields fall back
    /// to the catalog defaults.
    fn failure_from_params(&self, event: &Event) -> InjectedFailure {
        let failure_type = event.params.failure_type.unwrap_or(FailureType::XidError);
        let xid_code = event.params.xid_code.unwrap_or(0);
        let message = event.params.message.clone().unwrap_or_else(|| {
            if failure_type == FailureType::XidError {
                xid::xid_info(xid_code)
                    .map_or_else(|| format!("XID {xid_code}"), |info| info.name.to_owned())
            } else {
                failure_type.to_string()
            }
        });
        InjectedFailure {
            failure_type,
            xid_code,
            gpu_index: event.params.gpu_index.unwrap_or(-1),
            message,
            injected_at_ms: unix_millis(self.clock.now()),
        }
    }
}
