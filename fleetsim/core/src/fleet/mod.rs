pub mod generator;
pub mod starter;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::agent::SimulatedAgent;

pub use generator::{FleetGenError, FleetGenerator};
pub use starter::{NodeStarter, StartOutcome, StartReport};

/// Id-keyed view of the live agents.
pub type FleetMap = HashMap<String, Arc<SimulatedAgent>>;

/// Function-valued accessor handed to collaborators instead of the map
/// itself, so replacement agents appear atomically on the next call.
pub type FleetAccessor = Arc<dyn Fn() -> FleetMap + Send + Sync>;

/// Shared fleet registry owned by the runner.
#[derive(Clone, Default)]
pub struct Fleet {
    inner: Arc<RwLock<FleetMap>>,
}

impl Fleet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, agent: Arc<SimulatedAgent>) {
        self.inner
            .write()
            .expect("fleet map poisoned")
            .insert(agent.id().to_owned(), agent);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SimulatedAgent>> {
        self.inner.write().expect("fleet map poisoned").remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<SimulatedAgent>> {
        self.inner
            .read()
            .expect("fleet map poisoned")
            .get(id)
            .cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> FleetMap {
        self.inner.read().expect("fleet map poisoned").clone()
    }

    #[must_use]
    pub fn agents(&self) -> Vec<Arc<SimulatedAgent>> {
        self.inner
            .read()
            .expect("fleet map poisoned")
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("fleet map poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn accessor(&self) -> FleetAccessor {
        let fleet = self.clone();
        Arc::new(move || fleet.snapshot())
    }
}
