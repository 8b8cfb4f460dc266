use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    failure::FailureType,
    status::{CommandKind, HealthStatus, NodeStatus},
    stress::StressConfig,
};

/// Immutable descriptor of one simulated worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub instance_type: String,
    pub gpu_count: u32,
    #[serde(default)]
    pub gpu_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Scheduled scenario action.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    #[serde(default, with = "humantime_serde")]
    pub at: Duration,
    pub action: EventAction,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub params: EventParams,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    StartFleet,
    StopFleet,
    InjectFailure,
    RecoverFailure,
    IssueCommand,
    WaitForStatus,
    Wait,
    Log,
    Assert,
}

impl EventAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartFleet => "start_fleet",
            Self::StopFleet => "stop_fleet",
            Self::InjectFailure => "inject_failure",
            Self::RecoverFailure => "recover_failure",
            Self::IssueCommand => "issue_command",
            Self::WaitForStatus => "wait_for_status",
            Self::Wait => "wait",
            Self::Log => "log",
            Self::Assert => "assert",
        }
    }

    /// Actions that address a single node.
    #[must_use]
    pub const fn requires_target(self) -> bool {
        matches!(
            self,
            Self::InjectFailure | Self::RecoverFailure | Self::IssueCommand | Self::WaitForStatus
        )
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form event arguments; which fields apply depends on the action.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventParams {
    #[serde(default)]
    pub failure_type: Option<FailureType>,
    #[serde(default)]
    pub xid_code: Option<u32>,
    #[serde(default)]
    pub gpu_index: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub command_type: Option<CommandKind>,
    #[serde(default)]
    pub expected_status: Option<NodeStatus>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub assertion: Option<Assertion>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    NodeStatus,
    HealthStatus,
    NodeCount,
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NodeStatus => "node_status",
            Self::HealthStatus => "health_status",
            Self::NodeCount => "node_count",
        };
        f.write_str(name)
    }
}

/// End-of-scenario (or `assert`-event) check.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub expected_status: Option<NodeStatus>,
    #[serde(default)]
    pub expected_health: Option<HealthStatus>,
    #[serde(default)]
    pub expected_count: Option<u64>,
}

/// Declarative description of one simulation run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fleet: Vec<NodeSpec>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub stress: Option<StressConfig>,
}

#[derive(Debug, Error)]
pub enum ScenarioValidationError {
    #[error("scenario name must not be empty")]
    EmptyName,
    #[error("scenario needs at least one fleet node or a fleet generator with total_nodes > 0")]
    EmptyFleet,
    #[error("node #{index} has an empty id")]
    EmptyNodeId { index: usize },
    #[error("duplicate node id '{id}'")]
    DuplicateNodeId { id: String },
    #[error("node '{id}' must have a positive gpu_count")]
    ZeroGpuCount { id: String },
    #[error("event #{index} ({action}) requires a target node")]
    MissingEventTarget { index: usize, action: EventAction },
    #[error("event #{index} (wait_for_status) requires expected_status")]
    MissingExpectedStatus { index: usize },
    #[error("event #{index} (issue_command) requires command_type")]
    MissingCommandType { index: usize },
    #[error("event #{index} (assert) requires an assertion body")]
    MissingAssertionBody { index: usize },
    #[error("{kind} assertion #{index} requires a target node")]
    MissingAssertionTarget { index: usize, kind: AssertionKind },
    #[error("node_status assertion #{index} requires expected_status")]
    MissingAssertionStatus { index: usize },
    #[error("health_status assertion #{index} requires expected_health")]
    MissingAssertionHealth { index: usize },
    #[error("node_count assertion #{index} requires a numeric expected_count")]
    MissingAssertionCount { index: usize },
}

#[derive(Debug, Error)]
pub enum ScenarioLoadError {
    #[error("failed to read scenario file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse scenario yaml")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Validation(#[from] ScenarioValidationError),
}

impl Scenario {
    /// Parses and validates a scenario from YAML text.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ScenarioLoadError> {
        let scenario: Self = serde_yaml::from_str(raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parses and validates a scenario file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ScenarioLoadError> {
        let raw = fs::read_to_string(path).map_err(|source| ScenarioLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Serializes the scenario back to YAML (run-directory copy).
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    #[must_use]
    pub fn is_stress_test(&self) -> bool {
        self.stress.is_some()
    }

    /// Seed for every random draw in the run.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.stress
            .as_ref()
            .and_then(|stress| stress.seed)
            .unwrap_or_default()
    }

    /// Events stable-sorted by offset; equal offsets keep declaration order.
    #[must_use]
    pub fn sorted_events(&self) -> Vec<Event> {
        let mut events = self.events.clone();
        events.sort_by_key(|event| event.at);
        events
    }

    pub fn validate(&self) -> Result<(), ScenarioValidationError> {
        if self.name.is_empty() {
            return Err(ScenarioValidationError::EmptyName);
        }

        let generated_nodes = self
            .stress
            .as_ref()
            .and_then(|stress| stress.fleet_gen.as_ref())
            .map_or(0, |generator| generator.total_nodes);
        if self.fleet.is_empty() && generated_nodes == 0 {
            return Err(ScenarioValidationError::EmptyFleet);
        }

        let mut seen = HashSet::new();
        for (index, node) in self.fleet.iter().enumerate() {
            if node.id.is_empty() {
                return Err(ScenarioValidationError::EmptyNodeId { index });
            }
            if !seen.insert(node.id.as_str()) {
                return Err(ScenarioValidationError::DuplicateNodeId {
                    id: node.id.clone(),
                });
            }
            if node.gpu_count == 0 {
                return Err(ScenarioValidationError::ZeroGpuCount {
                    id: node.id.clone(),
                });
            }
        }

        for (index, event) in self.events.iter().enumerate() {
            if event.action.requires_target() && event.target.is_none() {
                return Err(ScenarioValidationError::MissingEventTarget {
                    index,
                    action: event.action,
                });
            }
            match event.action {
                EventAction::WaitForStatus if event.params.expected_status.is_none() => {
                    return Err(ScenarioValidationError::MissingExpectedStatus { index });
                }
                EventAction::IssueCommand if event.params.command_type.is_none() => {
                    return Err(ScenarioValidationError::MissingCommandType { index });
                }
                EventAction::Assert => {
                    let assertion = event
                        .params
                        .assertion
                        .as_ref()
                        .ok_or(ScenarioValidationError::MissingAssertionBody { index })?;
                    validate_assertion(index, assertion)?;
                }
                _ => {}
            }
        }

        for (index, assertion) in self.assertions.iter().enumerate() {
            validate_assertion(index, assertion)?;
        }

        Ok(())
    }
}

fn validate_assertion(
    index: usize,
    assertion: &Assertion,
) -> Result<(), ScenarioValidationError> {
    match assertion.kind {
        AssertionKind::NodeStatus => {
            if assertion.target.is_none() {
                return Err(ScenarioValidationError::MissingAssertionTarget {
                    index,
                    kind: assertion.kind,
                });
            }
            if assertion.expected_status.is_none() {
                return Err(ScenarioValidationError::MissingAssertionStatus { index });
            }
        }
        AssertionKind::HealthStatus => {
            if assertion.target.is_none() {
                return Err(ScenarioValidationError::MissingAssertionTarget {
                    index,
                    kind: assertion.kind,
                });
            }
            if assertion.expected_health.is_none() {
                return Err(ScenarioValidationError::MissingAssertionHealth { index });
            }
        }
        AssertionKind::NodeCount => {
            if assertion.expected_count.is_none() {
                return Err(ScenarioValidationError::MissingAssertionCount { index });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
name: smoke
fleet:
  - id: n1
    gpu_count: 8
    gpu_type: H100
";

    #[test]
    fn parses_minimal_scenario() {
        let scenario = Scenario::from_yaml_str(MINIMAL).expect("valid scenario");
        assert_eq!(scenario.name, "smoke");
        assert_eq!(scenario.fleet.len(), 1);
        assert!(!scenario.is_stress_test());
    }

    #[test]
    fn rejects_empty_name() {
        let raw = MINIMAL.replace("name: smoke", "name: ''");
        let err = Scenario::from_yaml_str(&raw).unwrap_err();
        assert!(matches!(
            err,
            ScenarioLoadError::Validation(ScenarioValidationError::EmptyName)
        ));
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let raw = r"
name: dup
fleet:
  - id: n1
    gpu_count: 8
  - id: n1
    gpu_count: 8
";
        let err = Scenario::from_yaml_str(raw).unwrap_err();
        assert!(matches!(
            err,
            ScenarioLoadError::Validation(ScenarioValidationError::DuplicateNodeId { .. })
        ));
    }

    #[test]
    fn rejects_unknown_action() {
        let raw = r"
name: bad
fleet:
  - id: n1
    gpu_count: 8
events:
  - at: 1s
    action: explode
";
        assert!(matches!(
            Scenario::from_yaml_str(raw).unwrap_err(),
            ScenarioLoadError::Parse(_)
        ));
    }

    #[test]
    fn rejects_fleetless_scenario_without_generator() {
        let raw = "name: empty\n";
        let err = Scenario::from_yaml_str(raw).unwrap_err();
        assert!(matches!(
            err,
            ScenarioLoadError::Validation(ScenarioValidationError::EmptyFleet)
        ));
    }

    #[test]
    fn accepts_generator_only_scenario() {
        let raw = r"
name: stress
stress:
  fleet_gen:
    total_nodes: 10
    templates:
      - name: h100
        weight: 70
        gpu_count: 8
        gpu_type: H100
  seed: 42
";
        let scenario = Scenario::from_yaml_str(raw).expect("valid stress scenario");
        assert!(scenario.is_stress_test());
        assert_eq!(scenario.seed(), 42);
    }

    #[test]
    fn events_parse_durations_and_sort_stably() {
        let raw = r"
name: ordered
fleet:
  - id: n1
    gpu_count: 8
events:
  - at: 2s
    action: log
    params:
      message: second
  - at: 1s
    action: log
    params:
      message: first
  - at: 2s
    action: stop_fleet
";
        let scenario = Scenario::from_yaml_str(raw).expect("valid scenario");
        let sorted = scenario.sorted_events();
        assert_eq!(sorted[0].at, Duration::from_secs(1));
        assert_eq!(sorted[1].action, EventAction::Log);
        assert_eq!(sorted[2].action, EventAction::StopFleet);
    }

    #[test]
    fn wait_for_status_requires_expected_status() {
        let raw = r"
name: wait
fleet:
  - id: n1
    gpu_count: 8
events:
  - at: 1s
    action: wait_for_status
    target: n1
";
        let err = Scenario::from_yaml_str(raw).unwrap_err();
        assert!(matches!(
            err,
            ScenarioLoadError::Validation(ScenarioValidationError::MissingExpectedStatus { .. })
        ));
    }

    #[test]
    fn node_count_assertion_requires_count() {
        let raw = r"
name: count
fleet:
  - id: n1
    gpu_count: 8
assertions:
  - type: node_count
";
        let err = Scenario::from_yaml_str(raw).unwrap_err();
        assert!(matches!(
            err,
            ScenarioLoadError::Validation(ScenarioValidationError::MissingAssertionCount { .. })
        ));
    }

    #[test]
    fn scenario_round_trips_through_yaml() {
        let scenario = Scenario::from_yaml_str(MINIMAL).expect("valid scenario");
        let raw = scenario.to_yaml().expect("serializable");
        let reparsed = Scenario::from_yaml_str(&raw).expect("round trip");
        assert_eq!(reparsed.fleet, scenario.fleet);
    }
}
