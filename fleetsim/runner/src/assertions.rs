//! End-of-scenario assertion evaluation. Failures are aggregated so a run
//! reports every missed condition at once.

use fleetsim_configs::{Assertion, AssertionKind};
use fleetsim_core::control::ControlPlaneClient;
use tracing::{debug, info};

/// Evaluates one assertion; `Err` carries a human-readable failure line.
pub(crate) async fn evaluate(
    client: &ControlPlaneClient,
    assertion: &Assertion,
) -> Result<(), String> {
    match assertion.kind {
        AssertionKind::NodeStatus => {
            let target = assertion
                .target
                .as_deref()
                .ok_or("node_status assertion without target")?;
            let expected = assertion
                .expected_status
                .ok_or("node_status assertion without expected_status")?;
            let node = client
                .get_node(target)
                .await
                .map_err(|error| format!("node_status({target}): fetch failed: {error}"))?;
            if node.status == expected {
                debug!(node = target, status = %expected, "node_status assertion held");
                Ok(())
            } else {
                Err(format!(
                    "node_status({target}): expected {expected}, found {}",
                    node.status
                ))
            }
        }
        AssertionKind::HealthStatus => {
            let target = assertion
                .target
                .as_deref()
                .ok_or("health_status assertion without target")?;
            let expected = assertion
                .expected_health
                .ok_or("health_status assertion without expected_health")?;
            let node = client
                .get_node(target)
                .await
                .map_err(|error| format!("health_status({target}): fetch failed: {error}"))?;
            if node.health == expected {
                Ok(())
            } else {
                Err(format!(
                    "health_status({target}): expected {expected}, found {}",
                    node.health
                ))
            }
        }
        AssertionKind::NodeCount => {
            let expected = assertion
                .expected_count
                .ok_or("node_count assertion without expected_count")?;
            let nodes = client
                .list_nodes()
                .await
                .map_err(|error| format!("node_count: list failed: {error}"))?;
            let found = nodes.len() as u64;
            info!(expected, found, "node_count assertion");
            if found == expected {
                Ok(())
            } else {
                Err(format!("node_count: expected {expected}, found {found}"))
            }
        }
    }
}

/// Runs every assertion, returning the aggregated failure lines (empty when
/// the run passed).
pub(crate) async fn evaluate_all(
    client: &ControlPlaneClient,
    assertions: &[Assertion],
) -> Vec<String> {
    let mut failures = Vec::new();
    for assertion in assertions {
        if let Err(failure) = evaluate(client, assertion).await {
            failures.push(failure);
        }
    }
    failures
}
