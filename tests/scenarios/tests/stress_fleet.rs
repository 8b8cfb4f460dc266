//! Stress-path coverage: seeded fleet generation and a short chaos run
//! against the embedded control plane.

use std::sync::Arc;

use fleetsim_clock::SystemClock;
use fleetsim_configs::{FleetGenConfig, NodeTemplate, Scenario};
use fleetsim_core::{fleet::FleetGenerator, shutdown_channel};
use fleetsim_runner::{RunnerOptions, ScenarioRunner};
use serial_test::serial;
use tracing_subscriber::fmt::try_init;

fn mixed_template_config(total: usize) -> FleetGenConfig {
    FleetGenConfig {
        total_nodes: total,
        templates: vec![
            NodeTemplate {
                name: "h100".to_owned(),
                weight: 70,
                gpu_count: 8,
                gpu_type: "H100".to_owned(),
                labels: Default::default(),
            },
            NodeTemplate {
                name: "a100".to_owned(),
                weight: 30,
                gpu_count: 8,
                gpu_type: "A100".to_owned(),
                labels: Default::default(),
            },
        ],
        providers: [("gcp".to_owned(), 60u32), ("aws".to_owned(), 40u32)]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

#[test]
fn hundred_node_mix_is_seed_stable() {
    let specs = FleetGenerator::new(mixed_template_config(100), 42)
        .generate()
        .expect("generates");
    assert_eq!(specs.len(), 100);

    // Statistical, not exact: with gcp weighted 60/100 over 100 draws the
    // count lands well inside [40, 80].
    let gcp = specs.iter().filter(|spec| spec.provider == "gcp").count();
    let aws = specs.iter().filter(|spec| spec.provider == "aws").count();
    assert_eq!(gcp + aws, 100);
    assert!((40..=80).contains(&gcp), "gcp count {gcp}");

    let gcp_prefixed = specs.iter().filter(|spec| spec.id.starts_with("gcp-")).count();
    let aws_prefixed = specs.iter().filter(|spec| spec.id.starts_with("aws-")).count();
    assert_eq!(gcp_prefixed, gcp);
    assert_eq!(gcp_prefixed + aws_prefixed, 100);

    // Same seed, same bytes.
    let again = FleetGenerator::new(mixed_template_config(100), 42)
        .generate()
        .expect("generates");
    assert_eq!(specs, again);
}

const STRESS_SCENARIO: &str = r"
name: short-stress
description: high-rate chaos against a small generated fleet
stress:
  seed: 42
  duration: 4s
  metrics_interval: 1s
  fleet_gen:
    total_nodes: 5
    templates:
      - name: h100
        weight: 1
        gpu_count: 8
        gpu_type: H100
  chaos:
    enabled: true
    failure_rate: 240000
    cascading:
      enabled: true
      probability: 0.5
      max_depth: 2
      min_delay: 100ms
      max_delay: 500ms
      scope: provider
      max_affected_percent: 0.5
    recovery:
      enabled: true
      probability: 1.0
      mean_time: 30s
";

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn short_stress_run_injects_and_reports() -> Result<(), Box<dyn std::error::Error + Send + Sync>>
{
    let _ = try_init();

    let report_base = tempfile::tempdir()?;
    let scenario = Scenario::from_yaml_str(STRESS_SCENARIO)?;
    let options = RunnerOptions {
        report_base: report_base.path().to_path_buf(),
        wait_for_cancel: false,
    };
    let runner = ScenarioRunner::with_clock(scenario, Arc::new(SystemClock::new()), options);
    let (_handle, shutdown) = shutdown_channel();

    let summary = runner.run(&shutdown).await?;

    assert_eq!(summary.nodes, 5);
    // At an adjusted rate this high every one-second tick injects.
    assert!(summary.total_failures > 0, "no failures injected");

    let report_dir = summary.report_dir.expect("stress run writes a report dir");
    assert!(report_dir.join("report.json").is_file());
    assert!(report_dir.join("report.html").is_file());
    assert!(report_dir.join("scenario.yaml").is_file());
    assert!(report_dir.join("logs").is_dir());

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_dir.join("report.json"))?)?;
    assert_eq!(report["scenario"], "short-stress");
    assert_eq!(report["total_nodes"], 5);
    assert!(report["failure_events"].as_array().is_some_and(|events| !events.is_empty()));
    Ok(())
}
