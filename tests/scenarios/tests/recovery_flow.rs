//! Inject a fatal fault, recover it, and watch the node return to active.

use fleetsim_configs::Scenario;
use fleetsim_core::shutdown_channel;
use fleetsim_runner::ScenarioRunner;
use serial_test::serial;
use tracing_subscriber::fmt::try_init;

const SCENARIO: &str = r"
name: recovery-flow
description: a recovered node reports healthy again
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
  - at: 1s
    action: wait_for_status
    target: n1
    params:
      expected_status: active
      timeout: 10s
  - at: 2s
    action: inject_failure
    target: n1
    params:
      failure_type: xid_error
      xid_code: 79
  - at: 3s
    action: wait_for_status
    target: n1
    params:
      expected_status: unhealthy
      timeout: 10s
  - at: 4s
    action: recover_failure
    target: n1
  - at: 5s
    action: wait_for_status
    target: n1
    params:
      expected_status: active
      timeout: 10s
assertions:
  - type: node_status
    target: n1
    expected_status: active
  - type: health_status
    target: n1
    expected_health: healthy
";

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn recovered_node_returns_to_active() -> Result<(), Box<dyn std::error::Error + Send + Sync>>
{
    let _ = try_init();

    let scenario = Scenario::from_yaml_str(SCENARIO)?;
    let runner = ScenarioRunner::new(scenario);
    let (_handle, shutdown) = shutdown_channel();

    runner.run(&shutdown).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn typed_recovery_only_clears_matching_failures()
-> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = try_init();

    // Recover the temperature fault only; the xid fault must keep the node
    // unhealthy.
    let raw = r"
name: typed-recovery
fleet:
  - id: n1
    gpu_count: 8
    gpu_type: H100
events:
  - at: 0s
    action: start_fleet
  - at: 1s
    action: inject_failure
    target: n1
    params:
      failure_type: xid_error
      xid_code: 79
  - at: 1s
    action: inject_failure
    target: n1
    params:
      failure_type: temperature
  - at: 2s
    action: recover_failure
    target: n1
    params:
      failure_type: temperature
  - at: 3s
    action: wait_for_status
    target: n1
    params:
      expected_status: unhealthy
      timeout: 10s
";
    let scenario = Scenario::from_yaml_str(raw)?;
    let runner = ScenarioRunner::new(scenario);
    let (_handle, shutdown) = shutdown_channel();

    runner.run(&shutdown).await?;
    Ok(())
}
