// ========================================================================================
//
//                  The reducer: a pure, deterministic pyramid transform
//
// ========================================================================================
//
// This module is the innermost numeric stage of the engine. Every call with the
// same input and parameters must produce a bit-identical result: the result
// cache keys on that, and clinical reproducibility audits replay it.

use crate::schema::FeatureVector;
use crate::types::{Fingerprint, SchemaVersion};
use serde::Deserialize;
use thiserror::Error;

/// Fixed parameters of the reduction transform.
///
/// These are deployment configuration, injected at startup and echoed into
/// model-artifact metadata; they are never hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PyramidParams {
    /// Number of consecutive elements collapsed into one value per block.
    pub block_size: usize,
    /// Maximum number of reduction levels produced above level 0.
    pub max_depth: usize,
    /// Weight applied to each block sum before normalization.
    pub truth_coefficient: f64,
    /// Upper bound of the half-open output range `[0, normalization_range)`.
    /// Bounds level values so later levels stay comparable in magnitude
    /// across patients.
    pub normalization_range: f64,
}

/// Transform misconfiguration. Fatal to the request and a deployment bug;
/// `Engine::new` surfaces these at startup so requests never hit them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReductionError {
    #[error("block_size must be at least 2, got {0}.")]
    BlockSizeTooSmall(usize),
    #[error("max_depth must be at least 1, got {0}.")]
    ZeroDepth(usize),
    #[error("normalization_range must be a finite positive number, got {0}.")]
    BadNormalizationRange(f64),
    #[error("truth_coefficient must be finite, got {0}.")]
    BadTruthCoefficient(f64),
    #[error("Cannot reduce an empty feature vector.")]
    EmptyInput,
}

impl PyramidParams {
    /// Checked once at engine construction; `reduce` re-runs it defensively.
    pub fn validate(&self) -> Result<(), ReductionError> {
        if self.block_size < 2 {
            return Err(ReductionError::BlockSizeTooSmall(self.block_size));
        }
        if self.max_depth < 1 {
            return Err(ReductionError::ZeroDepth(self.max_depth));
        }
        if !self.normalization_range.is_finite() || self.normalization_range <= 0.0 {
            return Err(ReductionError::BadNormalizationRange(
                self.normalization_range,
            ));
        }
        if !self.truth_coefficient.is_finite() {
            return Err(ReductionError::BadTruthCoefficient(self.truth_coefficient));
        }
        Ok(())
    }
}

/// The apex of a pyramid, or the explicit absence of one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Apex {
    /// Reduction contracted the input down to a single value.
    Converged(f64),
    /// `max_depth` halted reduction while the final level still held more
    /// than one element. No apex is fabricated.
    Incomplete { final_len: usize },
}

impl Apex {
    #[inline]
    pub fn is_complete(&self) -> bool {
        matches!(self, Apex::Converged(_))
    }
}

/// The full reduction trace of one feature vector. Immutable once built;
/// this is what `explain` hands to audit tooling, all levels included.
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidResult {
    schema_version: SchemaVersion,
    levels: Vec<Vec<f64>>,
    apex: Apex,
    fingerprint: Fingerprint,
}

impl PyramidResult {
    /// All levels, level 0 (the validated input) first.
    /// Invariant: `levels[i + 1].len() == levels[i].len().div_ceil(block_size)`.
    #[inline]
    pub fn levels(&self) -> &[Vec<f64>] {
        &self.levels
    }

    #[inline]
    pub fn schema_version(&self) -> &SchemaVersion {
        &self.schema_version
    }

    #[inline]
    pub fn apex(&self) -> Apex {
        self.apex
    }

    #[inline]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Number of reduction steps actually performed.
    #[inline]
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }
}

/// Reduces a validated feature vector into its pyramid representation.
///
/// Each level partitions the previous one into consecutive blocks of
/// `block_size` elements (the final block may be shorter and is reduced over
/// only its present elements, never padded) and collapses every block via
/// the weighted aggregate
/// `(sum(block) * truth_coefficient + count(block)) mod normalization_range`.
/// Reduction halts at a single-element level or after `max_depth` levels,
/// whichever comes first.
pub fn reduce(input: &FeatureVector, params: &PyramidParams) -> Result<PyramidResult, ReductionError> {
    params.validate()?;
    if input.values().is_empty() {
        return Err(ReductionError::EmptyInput);
    }

    let fingerprint = input.fingerprint(params.block_size, params.max_depth);
    let mut levels: Vec<Vec<f64>> = vec![input.values().to_vec()];
    loop {
        let current = &levels[levels.len() - 1];
        if current.len() == 1 || levels.len() - 1 >= params.max_depth {
            break;
        }
        let next: Vec<f64> = current
            .chunks(params.block_size)
            .map(|block| reduce_block(block, params))
            .collect();
        levels.push(next);
    }

    let last = &levels[levels.len() - 1];
    let apex = if last.len() == 1 {
        Apex::Converged(last[0])
    } else {
        log::debug!(
            "reduction for {} halted at depth {} with {} elements remaining",
            fingerprint,
            levels.len() - 1,
            last.len()
        );
        Apex::Incomplete {
            final_len: last.len(),
        }
    };

    Ok(PyramidResult {
        schema_version: input.schema_version().clone(),
        levels,
        apex,
        fingerprint,
    })
}

/// One block collapse. `rem_euclid` keeps the value in
/// `[0, normalization_range)` even when the weighted sum is negative.
#[inline]
fn reduce_block(block: &[f64], params: &PyramidParams) -> f64 {
    let sum: f64 = block.iter().sum();
    (sum * params.truth_coefficient + block.len() as f64).rem_euclid(params.normalization_range)
}
