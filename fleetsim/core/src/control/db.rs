//! In-memory node registry backing the embedded control plane.

use std::{
    collections::HashMap,
    sync::{
        Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use fleetsim_configs::{HealthStatus, NodeSpec, NodeStatus};
use thiserror::Error;

use crate::protocol::{InjectedFailure, NodeCommand, NodeInfo};

/// Invoked (outside any registry lock) when a node's status changes.
pub type StatusObserver = Box<dyn Fn(&NodeInfo, NodeStatus, NodeStatus) + Send + Sync>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("node '{id}' is not registered")]
    UnknownNode { id: String },
    #[error("node '{id}' is already registered")]
    DuplicateNode { id: String },
}

struct NodeRecord {
    info: NodeInfo,
    pending_commands: Vec<NodeCommand>,
}

#[derive(Default)]
pub struct ControlPlaneDb {
    nodes: RwLock<HashMap<String, NodeRecord>>,
    next_command_id: AtomicU64,
    observers: Mutex<Vec<StatusObserver>>,
}

impl ControlPlaneDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to node status transitions (used for fatal-node
    /// replacement).
    pub fn on_status_change(&self, observer: StatusObserver) {
        self.observers
            .lock()
            .expect("observer list poisoned")
            .push(observer);
    }

    pub fn register(&self, spec: NodeSpec) -> Result<NodeInfo, DbError> {
        let mut nodes = self.nodes.write().expect("node registry poisoned");
        if nodes.contains_key(&spec.id) {
            return Err(DbError::DuplicateNode { id: spec.id });
        }
        let info = NodeInfo {
            spec,
            status: NodeStatus::Active,
            health: HealthStatus::Healthy,
            failures: Vec::new(),
            last_heartbeat_ms: None,
        };
        nodes.insert(info.spec.id.clone(), NodeRecord {
            info: info.clone(),
            pending_commands: Vec::new(),
        });
        Ok(info)
    }

    pub fn remove(&self, id: &str) -> Result<NodeInfo, DbError> {
        let mut nodes = self.nodes.write().expect("node registry poisoned");
        nodes
            .remove(id)
            .map(|record| record.info)
            .ok_or_else(|| DbError::UnknownNode { id: id.to_owned() })
    }

    pub fn heartbeat(&self, id: &str, timestamp_ms: u64) -> Result<(), DbError> {
        let mut nodes = self.nodes.write().expect("node registry poisoned");
        let record = nodes
            .get_mut(id)
            .ok_or_else(|| DbError::UnknownNode { id: id.to_owned() })?;
        record.info.last_heartbeat_ms = Some(timestamp_ms);
        Ok(())
    }

    /// Applies a health report and reconciles the node's status from the
    /// failures it carries. Observers fire after the lock is released.
    pub fn report_health(
        &self,
        id: &str,
        failures: Vec<InjectedFailure>,
    ) -> Result<NodeInfo, DbError> {
        let (info, transition) = {
            let mut nodes = self.nodes.write().expect("node registry poisoned");
            let record = nodes
                .get_mut(id)
                .ok_or_else(|| DbError::UnknownNode { id: id.to_owned() })?;

            let (status, health) = reconcile(&failures);
            let previous = record.info.status;
            record.info.failures = failures;
            record.info.status = status;
            record.info.health = health;

            let transition = (previous != status).then_some((previous, status));
            (record.info.clone(), transition)
        };

        if let Some((previous, current)) = transition {
            let observers = self.observers.lock().expect("observer list poisoned");
            for observer in observers.iter() {
                observer(&info, previous, current);
            }
        }
        Ok(info)
    }

    pub fn get(&self, id: &str) -> Result<NodeInfo, DbError> {
        let nodes = self.nodes.read().expect("node registry poisoned");
        nodes
            .get(id)
            .map(|record| record.info.clone())
            .ok_or_else(|| DbError::UnknownNode { id: id.to_owned() })
    }

    /// All registered nodes, id-sorted for stable output.
    #[must_use]
    pub fn list(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().expect("node registry poisoned");
        let mut infos: Vec<NodeInfo> = nodes.values().map(|record| record.info.clone()).collect();
        infos.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        infos
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().expect("node registry poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn issue_command(
        &self,
        id: &str,
        command: fleetsim_configs::CommandKind,
        reason: String,
        issued_at_ms: u64,
    ) -> Result<NodeCommand, DbError> {
        let mut nodes = self.nodes.write().expect("node registry poisoned");
        let record = nodes
            .get_mut(id)
            .ok_or_else(|| DbError::UnknownNode { id: id.to_owned() })?;
        let command = NodeCommand {
            id: self.next_command_id.fetch_add(1, Ordering::SeqCst),
            command,
            issued_at_ms,
            reason,
        };
        record.pending_commands.push(command.clone());
        Ok(command)
    }

    /// Drains the commands queued since the agent's previous poll.
    pub fn take_commands(&self, id: &str) -> Result<Vec<NodeCommand>, DbError> {
        let mut nodes = self.nodes.write().expect("node registry poisoned");
        let record = nodes
            .get_mut(id)
            .ok_or_else(|| DbError::UnknownNode { id: id.to_owned() })?;
        Ok(std::mem::take(&mut record.pending_commands))
    }
}

/// Status/health pair derived from the active failure set.
fn reconcile(failures: &[InjectedFailure]) -> (NodeStatus, HealthStatus) {
    if failures.iter().any(InjectedFailure::is_fatal) {
        (NodeStatus::Unhealthy, HealthStatus::Unhealthy)
    } else if failures.is_empty() {
        (NodeStatus::Active, HealthStatus::Healthy)
    } else {
        (NodeStatus::Degraded, HealthStatus::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use fleetsim_configs::FailureType;

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

    fn fatal_xid() -> InjectedFailure {
        InjectedFailure {
            failure_type: FailureType::XidError,
            xid_code: 79,
            gpu_index: 0,
            message: "GPU has fallen off the bus".to_owned(),
            injected_at_ms: 1,
        }
    }

    #[test]
    fn register_and_duplicate() {
        let db = ControlPlaneDb::new();
        let info = db.register(spec("n1")).expect("registers");
        assert_eq!(info.status, NodeStatus::Active);
        assert!(matches!(
            db.register(spec("n1")),
            Err(DbError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn health_report_reconciles_status() {
        let db = ControlPlaneDb::new();
        db.register(spec("n1")).expect("registers");

        let info = db.report_health("n1", vec![fatal_xid()]).expect("reports");
        assert_eq!(info.status, NodeStatus::Unhealthy);
        assert_eq!(info.health, HealthStatus::Unhealthy);

        let degraded = InjectedFailure {
            failure_type: FailureType::Temperature,
            xid_code: 0,
            ..fatal_xid()
        };
        let info = db.report_health("n1", vec![degraded]).expect("reports");
        assert_eq!(info.status, NodeStatus::Degraded);

        let info = db.report_health("n1", Vec::new()).expect("reports");
        assert_eq!(info.status, NodeStatus::Active);
        assert_eq!(info.health, HealthStatus::Healthy);
    }

    #[test]
    fn observers_fire_on_transitions_only() {
        let db = ControlPlaneDb::new();
        db.register(spec("n1")).expect("registers");

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        db.on_status_change(Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        db.report_health("n1", vec![fatal_xid()]).expect("reports");
        db.report_health("n1", vec![fatal_xid()]).expect("reports");
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        db.report_health("n1", Vec::new()).expect("reports");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn commands_queue_and_drain() {
        let db = ControlPlaneDb::new();
        db.register(spec("n1")).expect("registers");
        db.issue_command("n1", fleetsim_configs::CommandKind::Cordon, String::new(), 7)
            .expect("queues");
        let drained = db.take_commands("n1").expect("drains");
        assert_eq!(drained.len(), 1);
        assert!(db.take_commands("n1").expect("drains").is_empty());
    }

    #[test]
    fn unknown_node_is_an_error() {
        let db = ControlPlaneDb::new();
        assert!(matches!(db.get("ghost"), Err(DbError::UnknownNode { .. })));
        assert!(matches!(
            db.heartbeat("ghost", 0),
            Err(DbError::UnknownNode { .. })
        ));
    }
}
