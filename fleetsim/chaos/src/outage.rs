//! Scheduled outage windows: take a slice of the fleet down at a fixed
//! offset, hold the failure for the window, then clear and re-mark healthy.

use std::sync::Arc;

use fleetsim_clock::Clock as _;
use fleetsim_configs::{FailureType, OutageConfig, OutageScope};
use fleetsim_core::{
    fleet::FleetMap,
    metrics::NodeEventKind,
    protocol::unix_millis,
    shutdown::ShutdownSignal,
};
use rand::Rng;
use tracing::{info, warn};

use crate::{
    engine::{ChaosEngine, InjectionOrigin},
    generate,
};

/// XID used when an outage is configured as `xid_error`: 79, the bus drop.
const OUTAGE_XID: u32 = 79;

pub(crate) async fn run_outage(
    engine: Arc<ChaosEngine>,
    outage: OutageConfig,
    shutdown: ShutdownSignal,
    local: ShutdownSignal,
) {
    tokio::select! {
        () = shutdown.cancelled() => return,
        () = local.cancelled() => return,
        () = engine.clock.sleep(outage.start_time) => {}
    }

    let fleet = (engine.fleet)();
    let affected = select_targets(&engine, &fleet, &outage);
    if affected.is_empty() {
        warn!(outage = %outage.name, "outage matched no nodes");
        return;
    }
    info!(
        outage = %outage.name,
        nodes = affected.len(),
        duration_secs = outage.duration.as_secs(),
        "outage starting"
    );

    for node_id in &affected {
        let failure = {
            let now_ms = unix_millis(engine.clock.now());
            let mut state = engine.state.lock().expect("chaos state poisoned");
            match outage.failure_type {
                FailureType::XidError => {
                    generate::xid_failure_with_code(&mut state.rng, OUTAGE_XID, now_ms)
                }
                other => generate::generate_failure(&mut state.rng, &engine.config, other, now_ms),
            }
        };
        engine.inject(node_id, failure, InjectionOrigin::Outage).await;
        engine.metrics.record_node_event(
            node_id,
            NodeEventKind::Outage,
            outage.name.clone(),
            engine.clock.now(),
        );
    }

    tokio::select! {
        () = shutdown.cancelled() => return,
        () = local.cancelled() => return,
        () = engine.clock.sleep(outage.duration) => {}
    }

    // Clear the agents that were originally affected; replacements that
    // took an affected id over keep whatever state they have.
    let fleet = (engine.fleet)();
    for node_id in &affected {
        if let Some(agent) = fleet.get(node_id) {
            agent.clear_failures().await;
        }
    }
    info!(outage = %outage.name, nodes = affected.len(), "outage cleared");
}

/// Nodes matching the outage scope, id-sorted. Percentage scopes include
/// each node independently with probability `target/100`.
fn select_targets(engine: &ChaosEngine, fleet: &FleetMap, outage: &OutageConfig) -> Vec<String> {
    let mut ids: Vec<&String> = fleet.keys().collect();
    ids.sort();

    match outage.scope {
        OutageScope::Zone => ids
            .into_iter()
            .filter(|id| fleet[id.as_str()].spec().zone == outage.target)
            .cloned()
            .collect(),
        OutageScope::Region => ids
            .into_iter()
            .filter(|id| fleet[id.as_str()].spec().region == outage.target)
            .cloned()
            .collect(),
        OutageScope::Provider => ids
            .into_iter()
            .filter(|id| fleet[id.as_str()].spec().provider == outage.target)
            .cloned()
            .collect(),
        OutageScope::Percentage => {
            let percent: f64 = outage.target.parse().unwrap_or_else(|_| {
                warn!(
                    outage = %outage.name,
                    target = %outage.target,
                    "percentage outage target is not numeric, treating as 0"
                );
                0.0
            });
            let mut state = engine.state.lock().expect("chaos state poisoned");
            ids.into_iter()
                .filter(|_| state.rng.r#gen::<f64>() * 100.0 < percent)
                .cloned()
                .collect()
        }
    }
}
