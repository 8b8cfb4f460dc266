//! Run metrics: lock-free hot counters plus coarse maps for per-type and
//! per-node breakdowns.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use fleetsim_configs::{FailureType, NodeStatus};
use serde::Serialize;

use crate::protocol::{InjectedFailure, unix_millis};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    Failure,
    Recovery,
    Replacement,
    Outage,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeEvent {
    pub at_ms: u64,
    pub kind: NodeEventKind,
    pub detail: String,
}

/// One periodic snapshot of the fleet.
#[derive(Clone, Debug, Serialize)]
pub struct FleetSample {
    pub at_ms: u64,
    pub healthy: u64,
    pub degraded: u64,
    pub unhealthy: u64,
    pub total_failures: u64,
    pub total_recoveries: u64,
    pub avg_latency_ms: u64,
    pub max_latency_ms: u64,
}

/// Aggregate summary for the final report.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    pub total_failures: u64,
    pub total_recoveries: u64,
    pub failures_by_type: BTreeMap<String, u64>,
    pub failures_by_xid: BTreeMap<u32, u64>,
    pub node_status: BTreeMap<String, NodeStatus>,
    pub avg_latency_ms: u64,
    pub max_latency_ms: u64,
}

#[derive(Default)]
struct MetricsMaps {
    failures_by_type: BTreeMap<FailureType, u64>,
    failures_by_xid: BTreeMap<u32, u64>,
    node_status: BTreeMap<String, NodeStatus>,
    node_events: BTreeMap<String, Vec<NodeEvent>>,
}

#[derive(Default)]
pub struct Metrics {
    healthy: AtomicU64,
    degraded: AtomicU64,
    unhealthy: AtomicU64,
    failures: AtomicU64,
    recoveries: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
    latency_max_ms: AtomicU64,
    maps: RwLock<MetricsMaps>,
    samples: Mutex<Vec<FleetSample>>,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, node_id: &str, failure: &InjectedFailure, at: SystemTime) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        let mut maps = self.maps.write().expect("metrics maps poisoned");
        *maps
            .failures_by_type
            .entry(failure.failure_type)
            .or_default() += 1;
        if failure.failure_type == FailureType::XidError {
            *maps.failures_by_xid.entry(failure.xid_code).or_default() += 1;
        }
        maps.node_events
            .entry(node_id.to_owned())
            .or_default()
            .push(NodeEvent {
                at_ms: unix_millis(at),
                kind: NodeEventKind::Failure,
                detail: failure.message.clone(),
            });
    }

    pub fn record_recovery(&self, node_id: &str, failure_type: FailureType, at: SystemTime) {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        let mut maps = self.maps.write().expect("metrics maps poisoned");
        maps.node_events
            .entry(node_id.to_owned())
            .or_default()
            .push(NodeEvent {
                at_ms: unix_millis(at),
                kind: NodeEventKind::Recovery,
                detail: failure_type.to_string(),
            });
    }

    pub fn record_node_event(
        &self,
        node_id: &str,
        kind: NodeEventKind,
        detail: String,
        at: SystemTime,
    ) {
        let mut maps = self.maps.write().expect("metrics maps poisoned");
        maps.node_events
            .entry(node_id.to_owned())
            .or_default()
            .push(NodeEvent {
                at_ms: unix_millis(at),
                kind,
                detail,
            });
    }

    pub fn set_node_status(&self, node_id: &str, status: NodeStatus) {
        let mut maps = self.maps.write().expect("metrics maps poisoned");
        maps.node_status.insert(node_id.to_owned(), status);
    }

    pub fn set_fleet_health(&self, healthy: u64, degraded: u64, unhealthy: u64) {
        self.healthy.store(healthy, Ordering::SeqCst);
        self.degraded.store(degraded, Ordering::SeqCst);
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Records one RPC latency; the max is maintained with a
    /// load-compare-swap loop.
    pub fn observe_latency(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.latency_sum_ms.fetch_add(ms, Ordering::SeqCst);
        self.latency_count.fetch_add(1, Ordering::SeqCst);

        let mut current = self.latency_max_ms.load(Ordering::SeqCst);
        while ms > current {
            match self.latency_max_ms.compare_exchange(
                current,
                ms,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn total_recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }

    fn avg_latency_ms(&self) -> u64 {
        let count = self.latency_count.load(Ordering::SeqCst);
        if count == 0 {
            0
        } else {
            self.latency_sum_ms.load(Ordering::SeqCst) / count
        }
    }

    /// Takes and stores one periodic sample.
    pub fn sample(&self, at: SystemTime) -> FleetSample {
        let sample = FleetSample {
            at_ms: unix_millis(at),
            healthy: self.healthy.load(Ordering::SeqCst),
            degraded: self.degraded.load(Ordering::SeqCst),
            unhealthy: self.unhealthy.load(Ordering::SeqCst),
            total_failures: self.total_failures(),
            total_recoveries: self.total_recoveries(),
            avg_latency_ms: self.avg_latency_ms(),
            max_latency_ms: self.latency_max_ms.load(Ordering::SeqCst),
        };
        self.samples
            .lock()
            .expect("samples poisoned")
            .push(sample.clone());
        sample
    }

    #[must_use]
    pub fn samples(&self) -> Vec<FleetSample> {
        self.samples.lock().expect("samples poisoned").clone()
    }

    #[must_use]
    pub fn node_events(&self) -> BTreeMap<String, Vec<NodeEvent>> {
        self.maps
            .read()
            .expect("metrics maps poisoned")
            .node_events
            .clone()
    }

    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let maps = self.maps.read().expect("metrics maps poisoned");
        MetricsSummary {
            total_failures: self.total_failures(),
            total_recoveries: self.total_recoveries(),
            failures_by_type: maps
                .failures_by_type
                .iter()
                .map(|(failure_type, count)| (failure_type.to_string(), *count))
                .collect(),
            failures_by_xid: maps.failures_by_xid.clone(),
            node_status: maps.node_status.clone(),
            avg_latency_ms: self.avg_latency_ms(),
            max_latency_ms: self.latency_max_ms.load(Ordering::SeqCst),
        }
    }
}
