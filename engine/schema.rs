//! # Input Validation Module
//!
//! This module is the exclusive entry point for raw patient data. It checks
//! a field-name → value mapping against a strict, versioned schema and
//! produces the `FeatureVector` every downstream stage trusts.
//!
//! - Strict schema: field names, order, and numeric domains are declared per
//!   schema version. Nothing is defaulted and nothing is silently dropped;
//!   a missing or unexpected field is an error.
//! - User-centric errors: failures are assumed to be caller-input errors, and
//!   the `ValidationError` enum is written to be actionable as-is.
//! - Pure: validation has no side effects and no hidden state beyond the
//!   catalog it reads.

use crate::types::{Fingerprint, RawValue, SchemaVersion};
use ahash::AHashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Declares one numeric field of a feature schema.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Inclusive lower bound of the field's numeric domain.
    pub min: f64,
    /// Inclusive upper bound of the field's numeric domain.
    pub max: f64,
    /// When set, the validated value is min-max scaled onto [0, 1] before it
    /// enters the pyramid, keeping fields of different magnitudes comparable.
    #[serde(default)]
    pub normalize: bool,
}

/// An ordered, versioned feature schema. Field order is the declared order
/// and is load-bearing: level 0 of every pyramid follows it.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureSchema {
    pub version: SchemaVersion,
    pub fields: Vec<FieldSpec>,
}

/// All ways raw input can be rejected. None of these are retried internally;
/// each is recoverable by the caller correcting its input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Schema version '{0}' is not known to this process.")]
    UnknownSchema(SchemaVersion),
    #[error("Required field '{0}' is missing from the input.")]
    MissingField(String),
    #[error("Field '{field}' is not part of schema '{schema}'.")]
    UnexpectedField {
        field: String,
        schema: SchemaVersion,
    },
    #[error("Field '{field}' could not be parsed as a number (got '{raw}').")]
    NotNumeric { field: String, raw: String },
    #[error("Field '{field}' must be finite, got {value}.")]
    NonFinite { field: String, value: f64 },
    #[error("Field '{field}' value {value} is outside its declared domain [{min}, {max}].")]
    OutOfDomain {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// A validated, schema-normalized feature vector.
///
/// Constructed by [`SchemaCatalog::validate`] (or [`FeatureVector::from_values`]
/// for callers that already hold vetted numbers); downstream stages rely on
/// that and never re-check.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    schema_version: SchemaVersion,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Bypasses schema lookup for callers that already hold validated,
    /// normalized values in declared field order.
    pub fn from_values(schema_version: SchemaVersion, values: Vec<f64>) -> Self {
        Self {
            schema_version,
            values,
        }
    }

    #[inline]
    pub fn schema_version(&self) -> &SchemaVersion {
        &self.schema_version
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Identity of this input under the given reduction shape.
    pub fn fingerprint(&self, block_size: usize, max_depth: usize) -> Fingerprint {
        Fingerprint::digest(&self.schema_version, block_size, max_depth, &self.values)
    }
}

/// The set of feature schemas known to the running process, built once from
/// deployment configuration.
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    schemas: AHashMap<SchemaVersion, Arc<FeatureSchema>>,
}

impl SchemaCatalog {
    pub fn new(schemas: impl IntoIterator<Item = FeatureSchema>) -> Self {
        let schemas = schemas
            .into_iter()
            .map(|schema| (schema.version.clone(), Arc::new(schema)))
            .collect();
        Self { schemas }
    }

    pub fn get(&self, version: &SchemaVersion) -> Option<&Arc<FeatureSchema>> {
        self.schemas.get(version)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Validates raw input against the schema identified by `version`.
    ///
    /// Pure function of input and schema. A missing required field is an
    /// error, never a substituted default; the only coercion is parsing
    /// numeric text.
    pub fn validate(
        &self,
        raw: &HashMap<String, RawValue>,
        version: &SchemaVersion,
    ) -> Result<FeatureVector, ValidationError> {
        let schema = self
            .schemas
            .get(version)
            .ok_or_else(|| ValidationError::UnknownSchema(version.clone()))?;

        // Reject fields the schema does not declare before doing any work.
        // Silently dropping input would hide caller bugs.
        for name in raw.keys() {
            if !schema.fields.iter().any(|field| field.name == *name) {
                return Err(ValidationError::UnexpectedField {
                    field: name.clone(),
                    schema: version.clone(),
                });
            }
        }

        let mut values = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            let raw_value = raw
                .get(&field.name)
                .ok_or_else(|| ValidationError::MissingField(field.name.clone()))?;
            let value = match raw_value {
                RawValue::Number(n) => *n,
                RawValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                    ValidationError::NotNumeric {
                        field: field.name.clone(),
                        raw: s.clone(),
                    }
                })?,
            };
            if !value.is_finite() {
                return Err(ValidationError::NonFinite {
                    field: field.name.clone(),
                    value,
                });
            }
            if value < field.min || value > field.max {
                return Err(ValidationError::OutOfDomain {
                    field: field.name.clone(),
                    value,
                    min: field.min,
                    max: field.max,
                });
            }
            values.push(if field.normalize && field.max > field.min {
                (value - field.min) / (field.max - field.min)
            } else {
                value
            });
        }

        Ok(FeatureVector {
            schema_version: version.clone(),
            values,
        })
    }
}
