//! Wire types exchanged between agents and the control plane.

use std::time::SystemTime;

use fleetsim_configs::{CommandKind, FailureType, HealthStatus, NodeSpec, NodeStatus, xid};
use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch; the wire representation of instants.
#[must_use]
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An active fault on an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedFailure {
    pub failure_type: FailureType,
    /// XID code; 0 when not applicable.
    #[serde(default)]
    pub xid_code: u32,
    /// Affected GPU index; -1 means all GPUs.
    #[serde(default = "all_gpus")]
    pub gpu_index: i32,
    #[serde(default)]
    pub message: String,
    pub injected_at_ms: u64,
}

const fn all_gpus() -> i32 {
    -1
}

impl InjectedFailure {
    /// A failure taking the node out of service: a catalogued fatal XID, a
    /// boot failure, or a network partition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self.failure_type {
            FailureType::XidError => xid::is_fatal_xid(self.xid_code),
            FailureType::BootFailure | FailureType::Network => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub spec: NodeSpec,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub failures: Vec<InjectedFailure>,
    pub reported_at_ms: u64,
}

/// Control-plane view of one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub spec: NodeSpec,
    pub status: NodeStatus,
    pub health: HealthStatus,
    pub failures: Vec<InjectedFailure>,
    #[serde(default)]
    pub last_heartbeat_ms: Option<u64>,
}

impl NodeInfo {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.spec.id
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssueCommandRequest {
    pub command: CommandKind,
    #[serde(default)]
    pub reason: String,
}

/// A command queued for an agent to pick up on its next poll.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeCommand {
    pub id: u64,
    pub command: CommandKind,
    pub issued_at_ms: u64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandsResponse {
    pub commands: Vec<NodeCommand>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_follows_catalog() {
        let bus_drop = InjectedFailure {
            failure_type: FailureType::XidError,
            xid_code: 79,
            gpu_index: 0,
            message: String::new(),
            injected_at_ms: 0,
        };
        assert!(bus_drop.is_fatal());

        let page_fault = InjectedFailure {
            xid_code: 31,
            ..bus_drop.clone()
        };
        assert!(!page_fault.is_fatal());

        let thermal = InjectedFailure {
            failure_type: FailureType::Temperature,
            xid_code: 0,
            ..bus_drop.clone()
        };
        assert!(!thermal.is_fatal());

        let boot = InjectedFailure {
            failure_type: FailureType::BootFailure,
            xid_code: 0,
            ..bus_drop
        };
        assert!(boot.is_fatal());
    }

    #[test]
    fn failure_wire_defaults() {
        let parsed: InjectedFailure = serde_json::from_str(
            r#"{"failure_type":"temperature","message":"hot","injected_at_ms":5}"#,
        )
        .expect("parses");
        assert_eq!(parsed.gpu_index, -1);
        assert_eq!(parsed.xid_code, 0);
    }
}
