// ========================================================================================
//                        Public API, engine context & error handling
// ========================================================================================

use crate::cache::{CacheKey, ResultCache};
use crate::combine::combine;
use crate::config::EngineConfig;
use crate::reduce::{reduce, PyramidParams, PyramidResult, ReductionError};
use crate::registry::{ModelNotFoundError, ModelRegistry};
use crate::schema::{SchemaCatalog, ValidationError};
use crate::summary::summarize;
use crate::types::{Fingerprint, ModelVersion, PredictionResult, RawValue, SchemaVersion};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// The request-path error union. Clonable so a single failed computation can
/// be handed to every caller that collapsed onto it. Nothing here is retried
/// internally: recomputation is idempotent and the caller retries after
/// fixing the cause.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("Transform misconfiguration: {0}")]
    Reduction(#[from] ReductionError),
    #[error(
        "Input schema '{found}' does not match the resolved model's declared input schema '{expected}'."
    )]
    SchemaMismatch {
        expected: SchemaVersion,
        found: SchemaVersion,
    },
    #[error(
        "Model {version} was fitted against a different reduction transform than this deployment runs."
    )]
    TransformMismatch { version: ModelVersion },
    #[error("Model resolution failed: {0}")]
    ModelNotFound(#[from] ModelNotFoundError),
}

/// The engine: validated deployment configuration, the model registry, and
/// the result cache wired around the pure pipeline stages.
///
/// Stateless per request apart from the registry (read-mostly, swapped
/// atomically on reload) and the cache (the only mutable shared structure);
/// `predict` is safe to call from any number of threads.
pub struct Engine {
    schemas: SchemaCatalog,
    params: PyramidParams,
    registry: ModelRegistry,
    cache: ResultCache,
}

impl Engine {
    /// Builds an engine from deployment configuration.
    ///
    /// Transform parameters are checked here, once: a bad value is a
    /// deployment bug and should fail startup, not requests.
    pub fn new(config: EngineConfig) -> Result<Self, ReductionError> {
        config.transform.validate()?;
        log::info!(
            "engine ready: {} schema(s), block_size={}, max_depth={}, cache_capacity={}",
            config.schemas.len(),
            config.transform.block_size,
            config.transform.max_depth,
            config.cache_capacity
        );
        Ok(Self {
            schemas: SchemaCatalog::new(config.schemas),
            params: config.transform,
            registry: ModelRegistry::new(),
            cache: ResultCache::new(config.cache_capacity),
        })
    }

    /// The registry, for the external artifact loader to populate at
    /// startup and on reload.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Runs the full pipeline for one request: validate → fingerprint →
    /// resolve → guard → (cached) reduce → summarize → combine.
    ///
    /// Identical concurrent requests collapse into one computation; repeated
    /// requests return the memoized result. Errors are typed, never cached,
    /// and never retried internally.
    pub fn predict(
        &self,
        raw: &HashMap<String, RawValue>,
        schema_version: &str,
        model_version: Option<&str>,
    ) -> Result<Arc<PredictionResult>, EngineError> {
        let schema_version = SchemaVersion::new(schema_version);
        let features = self.schemas.validate(raw, &schema_version)?;

        // An unparseable requested version can match nothing in the registry.
        let requested = match model_version {
            Some(raw_version) => match ModelVersion::from_str(raw_version) {
                Ok(version) => Some(version),
                Err(_) => {
                    return Err(ModelNotFoundError::Missing {
                        requested: raw_version.to_string(),
                    }
                    .into());
                }
            },
            None => None,
        };
        let model = self.registry.resolve(requested.as_ref())?;

        // Predictions are never produced against a mismatched feature
        // schema or a transform the model was not fitted for.
        if model.input_schema() != &schema_version {
            return Err(EngineError::SchemaMismatch {
                expected: model.input_schema().clone(),
                found: schema_version,
            });
        }
        let fitted = model.transform();
        if fitted.block_size != self.params.block_size
            || fitted.max_depth != self.params.max_depth
            || fitted.truth_coefficient != self.params.truth_coefficient
            || fitted.normalization_range != self.params.normalization_range
        {
            return Err(EngineError::TransformMismatch {
                version: model.version(),
            });
        }

        let fingerprint = features.fingerprint(self.params.block_size, self.params.max_depth);
        let key = CacheKey {
            fingerprint,
            model_version: model.version(),
        };
        self.cache.get_or_compute(key, || {
            let pyramid = Arc::new(reduce(&features, &self.params)?);
            let summary = summarize(&pyramid, self.params.max_depth);
            let prediction = Arc::new(combine(&summary, &model, fingerprint));
            Ok((pyramid, prediction))
        })
    }

    /// All levels of the retained reduction for a fingerprint, for
    /// clinician-facing audit. `None` once evicted or never computed; a
    /// fresh `predict` recomputes it.
    pub fn explain(&self, fingerprint: &Fingerprint) -> Option<Arc<PyramidResult>> {
        self.cache.pyramid(fingerprint)
    }
}
