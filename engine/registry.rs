//! Versioned model registry with atomic snapshot swap.
//!
//! Readers clone the current snapshot `Arc` under a momentary read lock and
//! then operate entirely on immutable data. `register` and `reload` build a
//! whole new snapshot and swap it in, so a reader can never observe a
//! partially updated registry, and concurrent resolution is lock-free once the
//! snapshot is in hand.

use crate::model::PredictionModel;
use crate::types::ModelVersion;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Resolution failure. Recoverable by a registry reload or an explicit,
/// loaded version choice.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelNotFoundError {
    #[error("No model is registered for version '{requested}'.")]
    Missing { requested: String },
    #[error("The registry holds no models.")]
    Empty,
}

#[derive(Debug, Default)]
struct Snapshot {
    models: AHashMap<ModelVersion, Arc<PredictionModel>>,
}

/// Process-wide model registry. Populated at startup by an external artifact
/// loader, read-mostly thereafter.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one model, replacing any model registered under the same
    /// version. The whole snapshot is rebuilt and swapped.
    pub fn register(&self, model: PredictionModel) {
        log::info!(
            "registering model {} (input schema '{}')",
            model.version(),
            model.input_schema()
        );
        let model = Arc::new(model);
        let mut guard = self.snapshot.write();
        let mut models = guard.models.clone();
        models.insert(model.version(), model);
        *guard = Arc::new(Snapshot { models });
    }

    /// Replaces the entire registry contents in one swap.
    pub fn reload(&self, models: impl IntoIterator<Item = PredictionModel>) {
        let models: AHashMap<ModelVersion, Arc<PredictionModel>> = models
            .into_iter()
            .map(|model| (model.version(), Arc::new(model)))
            .collect();
        log::info!("registry reloaded with {} model(s)", models.len());
        *self.snapshot.write() = Arc::new(Snapshot { models });
    }

    /// Resolves the model answering a request: the exact version when one is
    /// named, otherwise the highest version currently loaded.
    pub fn resolve(
        &self,
        version: Option<&ModelVersion>,
    ) -> Result<Arc<PredictionModel>, ModelNotFoundError> {
        let snapshot = Arc::clone(&self.snapshot.read());
        match version {
            Some(requested) => snapshot.models.get(requested).cloned().ok_or_else(|| {
                ModelNotFoundError::Missing {
                    requested: requested.to_string(),
                }
            }),
            None => snapshot
                .models
                .iter()
                .max_by_key(|(version, _)| **version)
                .map(|(_, model)| Arc::clone(model))
                .ok_or(ModelNotFoundError::Empty),
        }
    }

    /// All loaded versions, ascending.
    pub fn versions(&self) -> Vec<ModelVersion> {
        let snapshot = Arc::clone(&self.snapshot.read());
        let mut versions: Vec<ModelVersion> = snapshot.models.keys().copied().collect();
        versions.sort_unstable();
        versions
    }
}
