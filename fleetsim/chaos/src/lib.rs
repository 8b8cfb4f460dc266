//! Seeded failure injection for a running fleet: a Poisson-like injection
//! loop, topology-scoped cascades, probabilistic recovery, and scheduled
//! region-wide outages.

mod engine;
mod generate;
mod outage;

pub use engine::{ChaosEngine, FailureEvent, is_recoverable};
