use std::{ops::Mul as _, sync::LazyLock, time::Duration};

use fleetsim_env as fs_env;

pub mod duration;
pub mod failure;
pub mod scenario;
pub mod status;
pub mod stress;
pub mod xid;

pub use failure::FailureType;
pub use scenario::{
    Assertion, AssertionKind, Event, EventAction, EventParams, NodeSpec, Scenario,
    ScenarioLoadError, ScenarioValidationError,
};
pub use status::{CommandKind, HealthStatus, NodeStatus};
pub use stress::{
    CascadeConfig, CascadeScope, ChaosConfig, FailureWeight, FleetGenConfig, NodeTemplate,
    OutageConfig, OutageScope, RecoveryConfig, StartupConfig, StartupPattern, StressConfig,
};

static IS_SLOW_TEST_ENV: LazyLock<bool> = LazyLock::new(fs_env::slow_test_env);

const SLOW_ENV_TIMEOUT_MULTIPLIER: u32 = 2;

/// In slow test environments like shared CI runners, use 2x timeout.
#[must_use]
pub fn adjust_timeout(d: Duration) -> Duration {
    if *IS_SLOW_TEST_ENV {
        d.mul(SLOW_ENV_TIMEOUT_MULTIPLIER)
    } else {
        d
    }
}
