pub mod agent;
pub mod control;
pub mod fleet;
pub mod metrics;
pub mod protocol;
pub mod shutdown;

/// Boxed error used at trait seams where callers only report.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use agent::SimulatedAgent;
pub use control::{ControlPlane, ControlPlaneClient, ControlPlaneDb};
pub use shutdown::{ShutdownHandle, ShutdownSignal, shutdown_channel};
