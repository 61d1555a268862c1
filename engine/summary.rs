//! Pyramid summarization: the fixed-length projection models consume.
//!
//! A summary owns nothing and adds nothing: it is a pure, one-to-one
//! projection of a `PyramidResult`.

use crate::reduce::{Apex, PyramidResult};
use crate::types::SchemaVersion;
use ndarray::Array1;

/// Fixed-length numeric summary of a pyramid.
///
/// Dense layout: `[apex_or_final_mean, incomplete_flag, realized_depth,
/// mean(level 0), .., mean(level max_depth), var(level 0), ..,
/// var(level max_depth)]`. Levels beyond the realized depth are padded with
/// zeros so the dense length is a pure function of `max_depth`. Models
/// declare their input width against it.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryVector {
    schema_version: SchemaVersion,
    apex: f64,
    incomplete: bool,
    depth: usize,
    level_means: Vec<f64>,
    level_variances: Vec<f64>,
}

impl SummaryVector {
    #[inline]
    pub fn schema_version(&self) -> &SchemaVersion {
        &self.schema_version
    }

    /// The apex value, or the mean of the final level when the reduction
    /// halted early ([`is_incomplete`](Self::is_incomplete) distinguishes).
    #[inline]
    pub fn apex(&self) -> f64 {
        self.apex
    }

    #[inline]
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Reduction steps actually realized.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Dense width for a given `max_depth`. Model artifacts size their
    /// weight rows against this.
    #[inline]
    pub fn dense_len(max_depth: usize) -> usize {
        3 + 2 * (max_depth + 1)
    }

    /// The dense vector a model consumes.
    pub fn to_dense(&self) -> Array1<f64> {
        let mut dense = Vec::with_capacity(3 + self.level_means.len() + self.level_variances.len());
        dense.push(self.apex);
        dense.push(if self.incomplete { 1.0 } else { 0.0 });
        dense.push(self.depth as f64);
        dense.extend_from_slice(&self.level_means);
        dense.extend_from_slice(&self.level_variances);
        Array1::from(dense)
    }
}

/// Projects a pyramid into its summary.
///
/// Pure and total: a `PyramidResult` is structurally valid by construction
/// (its constructor is the reducer), so there is no failure mode here.
pub fn summarize(pyramid: &PyramidResult, max_depth: usize) -> SummaryVector {
    let levels = pyramid.levels();
    let (apex, incomplete) = match pyramid.apex() {
        Apex::Converged(value) => (value, false),
        Apex::Incomplete { .. } => (mean(&levels[levels.len() - 1]), true),
    };

    let mut level_means = vec![0.0; max_depth + 1];
    let mut level_variances = vec![0.0; max_depth + 1];
    for (i, level) in levels.iter().take(max_depth + 1).enumerate() {
        level_means[i] = mean(level);
        level_variances[i] = variance(level);
    }

    SummaryVector {
        schema_version: pyramid.schema_version().clone(),
        apex,
        incomplete,
        depth: pyramid.depth(),
        level_means,
        level_variances,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance. A single-element level has none.
fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}
