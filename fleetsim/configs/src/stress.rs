use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::failure::FailureType;

/// Optional stress-test descriptor attached to a scenario.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StressConfig {
    #[serde(default)]
    pub fleet_gen: Option<FleetGenConfig>,
    #[serde(default)]
    pub chaos: Option<ChaosConfig>,
    #[serde(default, with = "humantime_serde::option")]
    pub duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub metrics_interval: Option<Duration>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub report_file: Option<String>,
    #[serde(default)]
    pub html_report_file: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
}

/// Describes how the fleet generator synthesizes node specs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetGenConfig {
    pub total_nodes: usize,
    #[serde(default)]
    pub templates: Vec<NodeTemplate>,
    /// Provider name to sampling weight.
    #[serde(default)]
    pub providers: BTreeMap<String, u32>,
    /// Region name to sampling weight.
    #[serde(default)]
    pub regions: BTreeMap<String, u32>,
    /// Region name to the explicit zones it offers.
    #[serde(default)]
    pub zones: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub startup: StartupConfig,
}

/// Weighted node template the generator samples from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeTemplate {
    pub name: String,
    #[serde(default = "default_template_weight")]
    pub weight: u32,
    pub gpu_count: u32,
    pub gpu_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

const fn default_template_weight() -> u32 {
    1
}

/// How agents are brought up over time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPattern {
    #[default]
    Instant,
    Linear,
    Exponential,
    Wave,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartupConfig {
    #[serde(default)]
    pub pattern: StartupPattern,
    /// Total window the pattern spreads starts over.
    #[serde(default, with = "humantime_serde::option")]
    pub duration: Option<Duration>,
    /// Batch size for the wave pattern.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Uniform jitter applied to inter-start sleeps, in percent of the sleep.
    #[serde(default)]
    pub jitter_percent: f64,
    #[serde(default, with = "humantime_serde::option")]
    pub cold_start_mean: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub cold_start_stddev: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub cold_start_min: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub cold_start_max: Option<Duration>,
}

/// Failure-injection knobs for a stress run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChaosConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Failures per minute per 1000 nodes.
    #[serde(default)]
    pub failure_rate: f64,
    /// XID code to sampling weight; the catalog default set when empty.
    #[serde(default)]
    pub xid_distribution: BTreeMap<u32, u32>,
    /// Weighted failure kinds; defaults to xid_error only when empty.
    #[serde(default)]
    pub failure_types: Vec<FailureWeight>,
    #[serde(default)]
    pub cascading: CascadeConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub scheduled_outages: Vec<OutageConfig>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureWeight {
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    #[serde(default = "default_template_weight")]
    pub weight: u32,
}

/// Topological reach of cascade propagation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeScope {
    Rack,
    Zone,
    Region,
    Provider,
    #[default]
    Random,
}

impl CascadeScope {
    /// Hyphen-separated id segments two nodes must share to be in scope.
    /// Zero means every other node qualifies.
    #[must_use]
    pub const fn prefix_segments(self) -> usize {
        match self {
            Self::Rack => 4,
            Self::Zone => 3,
            Self::Region => 2,
            Self::Provider => 1,
            Self::Random => 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CascadeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub probability: f64,
    #[serde(default = "default_cascade_depth")]
    pub max_depth: u32,
    #[serde(default = "default_cascade_min_delay", with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(default = "default_cascade_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default)]
    pub scope: CascadeScope,
    #[serde(default = "default_max_affected_percent")]
    pub max_affected_percent: f64,
}

const fn default_cascade_depth() -> u32 {
    2
}

const fn default_cascade_min_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_cascade_max_delay() -> Duration {
    Duration::from_secs(10)
}

const fn default_max_affected_percent() -> f64 {
    0.2
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.0,
            max_depth: default_cascade_depth(),
            min_delay: default_cascade_min_delay(),
            max_delay: default_cascade_max_delay(),
            scope: CascadeScope::default(),
            max_affected_percent: default_max_affected_percent(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Chance a recoverable failure gets a scheduled recovery.
    #[serde(default)]
    pub probability: f64,
    #[serde(default, with = "humantime_serde::option")]
    pub mean_time: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub std_dev: Option<Duration>,
    /// Replace agents the control plane marks unhealthy.
    #[serde(default)]
    pub replace_fatal: bool,
    #[serde(default, with = "humantime_serde::option")]
    pub replace_cold_start: Option<Duration>,
}

/// What part of the fleet an outage hits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutageScope {
    Zone,
    Region,
    Provider,
    Percentage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutageConfig {
    pub name: String,
    /// Offset from scenario start.
    #[serde(with = "humantime_serde")]
    pub start_time: Duration,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub scope: OutageScope,
    /// Zone/region/provider name, or a numeric percentage string.
    pub target: String,
    pub failure_type: FailureType,
}
