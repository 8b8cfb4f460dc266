//! Scheduled outage window driven by the chaos engine against a live
//! embedded control plane.

use std::{sync::Arc, time::Duration};

use fleetsim_chaos::ChaosEngine;
use fleetsim_clock::SystemClock;
use fleetsim_configs::{ChaosConfig, FailureType, NodeSpec, OutageConfig, OutageScope};
use fleetsim_core::{
    ControlPlane, ControlPlaneClient, ControlPlaneDb, SimulatedAgent,
    fleet::Fleet,
    metrics::Metrics,
    shutdown_channel,
};
use serial_test::serial;
use tracing_subscriber::fmt::try_init;

fn spec(id: &str, region: &str) -> NodeSpec {
    NodeSpec {
        id: id.to_owned(),
        provider: "gcp".to_owned(),
        region: region.to_owned(),
        zone: format!("{region}-a"),
        instance_type: "a3-highgpu-8g".to_owned(),
        gpu_count: 8,
        gpu_type: "H100".to_owned(),
        labels: Default::default(),
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn region_outage_hits_and_clears_matching_nodes()
-> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = try_init();

    let db = Arc::new(ControlPlaneDb::new());
    let control = ControlPlane::start(Arc::clone(&db)).await?;
    let client = ControlPlaneClient::new(control.base_url());
    client.wait_ready(20).await?;

    let clock = Arc::new(SystemClock::new());
    let fleet = Fleet::new();
    let (handle, shutdown) = shutdown_channel();

    for (id, region) in [
        ("gcp-us-central1-h100-0000", "us-central1"),
        ("gcp-us-central1-h100-0001", "us-central1"),
        ("gcp-us-east1-h100-0002", "us-east1"),
        ("gcp-us-east1-h100-0003", "us-east1"),
    ] {
        let agent = Arc::new(SimulatedAgent::new(
            spec(id, region),
            Arc::clone(&clock) as Arc<dyn fleetsim_clock::Clock>,
            client.clone(),
        ));
        agent.start(&shutdown).await?;
        fleet.insert(agent);
    }

    let chaos = ChaosConfig {
        enabled: true,
        failure_rate: 0.0,
        scheduled_outages: vec![OutageConfig {
            name: "central-region-down".to_owned(),
            start_time: Duration::from_millis(200),
            duration: Duration::from_secs(1),
            scope: OutageScope::Region,
            target: "us-central1".to_owned(),
            failure_type: FailureType::Network,
        }],
        ..ChaosConfig::default()
    };
    let metrics = Arc::new(Metrics::new());
    let engine = ChaosEngine::new(
        chaos,
        Arc::clone(&clock) as Arc<dyn fleetsim_clock::Clock>,
        fleet.accessor(),
        Arc::clone(&metrics),
        7,
    );
    engine.start(&shutdown);

    // Mid-window: both central nodes carry the outage failure, east is
    // untouched.
    tokio::time::sleep(Duration::from_millis(700)).await;
    for id in ["gcp-us-central1-h100-0000", "gcp-us-central1-h100-0001"] {
        let agent = fleet.get(id).expect("agent present");
        assert!(
            agent
                .failures()
                .iter()
                .any(|failure| failure.failure_type == FailureType::Network),
            "{id} should be down"
        );
        let node = client.get_node(id).await?;
        assert_eq!(node.status, fleetsim_configs::NodeStatus::Unhealthy);
    }
    for id in ["gcp-us-east1-h100-0002", "gcp-us-east1-h100-0003"] {
        assert!(fleet.get(id).expect("agent present").failures().is_empty());
    }
    assert_eq!(engine.history().len(), 2);

    // Past the window: everything cleared and healthy again.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    for id in ["gcp-us-central1-h100-0000", "gcp-us-central1-h100-0001"] {
        assert!(fleet.get(id).expect("agent present").failures().is_empty());
        let node = client.get_node(id).await?;
        assert_eq!(node.status, fleetsim_configs::NodeStatus::Active);
    }

    engine.stop();
    handle.shutdown();
    for agent in fleet.agents() {
        agent.stop();
    }
    control.shutdown().await;
    Ok(())
}
