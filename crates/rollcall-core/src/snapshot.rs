//! Shared population snapshot, refreshed independently of matching.

use crate::types::Population;
use std::sync::{Arc, RwLock};

/// Holds the current population. Readers get a cheap `Arc` clone and keep
/// using it even if a refresh lands mid-request.
#[derive(Default)]
pub struct PopulationSnapshot {
    current: RwLock<Arc<Population>>,
}

impl PopulationSnapshot {
    pub fn new(population: Population) -> Self {
        Self {
            current: RwLock::new(Arc::new(population)),
        }
    }

    pub fn current(&self) -> Arc<Population> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn replace(&self, population: Population) {
        let identities = population.len();
        let embeddings = population.embedding_count();
        let next = Arc::new(population);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!(identities, embeddings, "population snapshot replaced");
    }
}
