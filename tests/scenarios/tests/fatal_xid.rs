//! A fatal XID on a healthy node must drive its control-plane status to
//! unhealthy within the polling window.

use fleetsim_configs::Scenario;
use fleetsim_core::shutdown_channel;
use fleetsim_runner::ScenarioRunner;
use serial_test::serial;
use tracing_subscriber::fmt::try_init;

const SCENARIO: &str = r"
name: fatal-xid-unhealthy
description: xid 79 takes a node out of service
fleet:
  - id: n1
    provider: gcp
    region: us-central1
    zone: us-central1-a
    instance_type: a3-highgpu-8g
    gpu_count: 8
    gpu_type: H100
events:
  - at: 0s
    action: start_fleet
  - at: 2s
    action: wait_for_status
    target: n1
    params:
      expected_status: active
      timeout: 10s
  - at: 3s
    action: inject_failure
    target: n1
    params:
      failure_type: xid_error
      xid_code: 79
      gpu_index: 0
  - at: 6s
    action: wait_for_status
    target: n1
    params:
      expected_status: unhealthy
      timeout: 10s
assertions:
  - type: node_status
    target: n1
    expected_status: unhealthy
  - type: node_count
    expected_count: 1
";

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn fatal_xid_makes_node_unhealthy() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = try_init();

    let scenario = Scenario::from_yaml_str(SCENARIO)?;
    let runner = ScenarioRunner::new(scenario);
    let (_handle, shutdown) = shutdown_channel();

    let summary = runner.run(&shutdown).await?;
    assert_eq!(summary.nodes, 1);
    Ok(())
}
