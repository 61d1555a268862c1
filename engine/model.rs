//! Versioned model artifacts and their loaded, validated form.
//!
//! Artifacts are persisted as human-readable TOML so a deployed model can be
//! inspected, diffed, and audited without tooling. `ModelArtifact` is the
//! file-format mirror; [`ModelArtifact::build`] is the airlock that checks
//! every structural invariant once and produces the immutable
//! [`PredictionModel`] the rest of the engine indexes without re-checking.

use crate::summary::SummaryVector;
use crate::types::{ModelVersion, SchemaVersion};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading, saving, or validating a model artifact.
/// These belong to the loading surface, not the request path.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model artifact: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model artifact to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Malformed model artifact: {0}")]
    Malformed(String),
}

/// The transform constants this model was fitted against, echoed into the
/// artifact so a deployment can verify it reproduces the training-time
/// reduction before serving the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformMetadata {
    pub block_size: usize,
    pub max_depth: usize,
    pub truth_coefficient: f64,
    pub normalization_range: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub version: ModelVersion,
    pub input_schema: SchemaVersion,
    pub transform: TransformMetadata,
}

/// One outcome category: weight row, intercept, and risk threshold.
/// Artifact order is priority order; the earlier category wins exact ties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySpec {
    pub name: String,
    pub weights: Vec<f64>,
    pub intercept: f64,
    /// Calibrated probability at or above which the category is flagged on
    /// the prediction result.
    pub risk_threshold: f64,
}

/// Monotone raw-score → probability lookup table, fitted offline (e.g. by
/// isotonic regression) and shipped with the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    /// Strictly increasing raw scores.
    pub breakpoints: Vec<f64>,
    /// Non-decreasing calibrated probabilities in [0, 1], aligned with
    /// `breakpoints`.
    pub values: Vec<f64>,
}

impl CalibrationTable {
    pub(crate) fn check(&self) -> Result<(), ArtifactError> {
        if self.breakpoints.is_empty() {
            return Err(ArtifactError::Malformed(
                "calibration table has no breakpoints".into(),
            ));
        }
        if self.breakpoints.len() != self.values.len() {
            return Err(ArtifactError::Malformed(format!(
                "calibration table has {} breakpoints but {} values",
                self.breakpoints.len(),
                self.values.len()
            )));
        }
        for pair in self.breakpoints.windows(2) {
            if !(pair[0] < pair[1]) {
                return Err(ArtifactError::Malformed(format!(
                    "calibration breakpoints must be strictly increasing ({} then {})",
                    pair[0], pair[1]
                )));
            }
        }
        for pair in self.values.windows(2) {
            if pair[1] < pair[0] {
                return Err(ArtifactError::Malformed(format!(
                    "calibration values must be non-decreasing ({} then {})",
                    pair[0], pair[1]
                )));
            }
        }
        for &value in &self.values {
            if !(0.0..=1.0).contains(&value) {
                return Err(ArtifactError::Malformed(format!(
                    "calibration value {value} is outside [0, 1]"
                )));
            }
        }
        if self.breakpoints.iter().any(|b| !b.is_finite()) {
            return Err(ArtifactError::Malformed(
                "calibration breakpoints must be finite".into(),
            ));
        }
        Ok(())
    }

    /// Maps a raw score to a calibrated probability: linear interpolation
    /// between table points, clamped to the end values outside the fitted
    /// range. Monotone by the invariants `check` enforces.
    pub fn transform(&self, score: f64) -> f64 {
        match self
            .breakpoints
            .binary_search_by(|b| b.total_cmp(&score))
        {
            Ok(i) => self.values[i],
            Err(0) => self.values[0],
            Err(i) if i == self.breakpoints.len() => self.values[i - 1],
            Err(i) => {
                let (x0, x1) = (self.breakpoints[i - 1], self.breakpoints[i]);
                let (y0, y1) = (self.values[i - 1], self.values[i]);
                let t = (score - x0) / (x1 - x0);
                y0 + t * (y1 - y0)
            }
        }
    }
}

/// The top-level, self-contained model artifact as persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub metadata: ArtifactMetadata,
    #[serde(rename = "category")]
    pub categories: Vec<CategorySpec>,
    pub calibration: CalibrationTable,
}

impl ModelArtifact {
    pub fn from_toml_str(raw: &str) -> Result<Self, ArtifactError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Saves the artifact in human-readable TOML.
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Validates the artifact and produces the immutable, loaded model.
    ///
    /// Every shape invariant the combiner relies on is established here:
    /// weight rows match the summary width implied by the declared transform,
    /// the calibration table is monotone, thresholds are probabilities, and
    /// category names are unique.
    pub fn build(self) -> Result<PredictionModel, ArtifactError> {
        if self.categories.is_empty() {
            return Err(ArtifactError::Malformed(
                "artifact declares no outcome categories".into(),
            ));
        }
        self.calibration.check()?;

        let expected_len = SummaryVector::dense_len(self.metadata.transform.max_depth);
        for category in &self.categories {
            if category.weights.len() != expected_len {
                return Err(ArtifactError::Malformed(format!(
                    "category '{}' declares {} weights but the transform's summary width is {}",
                    category.name,
                    category.weights.len(),
                    expected_len
                )));
            }
            if category.weights.iter().any(|w| !w.is_finite())
                || !category.intercept.is_finite()
            {
                return Err(ArtifactError::Malformed(format!(
                    "category '{}' contains non-finite parameters",
                    category.name
                )));
            }
            if !category.risk_threshold.is_finite()
                || !(0.0..=1.0).contains(&category.risk_threshold)
            {
                return Err(ArtifactError::Malformed(format!(
                    "category '{}' risk threshold {} is not a probability",
                    category.name, category.risk_threshold
                )));
            }
        }
        for (i, category) in self.categories.iter().enumerate() {
            if self.categories[..i].iter().any(|c| c.name == category.name) {
                return Err(ArtifactError::Malformed(format!(
                    "duplicate category name '{}'",
                    category.name
                )));
            }
        }

        let n_categories = self.categories.len();
        let mut weights = Array2::zeros((n_categories, expected_len));
        for (i, category) in self.categories.iter().enumerate() {
            weights
                .row_mut(i)
                .assign(&Array1::from(category.weights.clone()));
        }
        let intercepts = Array1::from(
            self.categories
                .iter()
                .map(|c| c.intercept)
                .collect::<Vec<f64>>(),
        );

        Ok(PredictionModel {
            version: self.metadata.version,
            input_schema: self.metadata.input_schema,
            transform: self.metadata.transform,
            categories: self.categories.iter().map(|c| c.name.clone()).collect(),
            risk_thresholds: self
                .categories
                .iter()
                .map(|c| c.risk_threshold)
                .collect(),
            weights,
            intercepts,
            calibration: self.calibration,
        })
    }
}

/// A loaded, validated model. Immutable once constructed; multiple versions
/// may coexist in the registry. Shape coherence is guaranteed by
/// [`ModelArtifact::build`], so downstream arithmetic indexes freely.
#[derive(Debug, Clone)]
pub struct PredictionModel {
    version: ModelVersion,
    input_schema: SchemaVersion,
    transform: TransformMetadata,
    categories: Vec<String>,
    risk_thresholds: Vec<f64>,
    weights: Array2<f64>,
    intercepts: Array1<f64>,
    calibration: CalibrationTable,
}

impl PredictionModel {
    #[inline]
    pub fn version(&self) -> ModelVersion {
        self.version
    }

    #[inline]
    pub fn input_schema(&self) -> &SchemaVersion {
        &self.input_schema
    }

    #[inline]
    pub fn transform(&self) -> &TransformMetadata {
        &self.transform
    }

    /// Category labels in declared priority order.
    #[inline]
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    #[inline]
    pub fn risk_thresholds(&self) -> &[f64] {
        &self.risk_thresholds
    }

    /// Weight matrix, one row per category, `[n_categories, summary_width]`.
    #[inline]
    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    #[inline]
    pub fn intercepts(&self) -> &Array1<f64> {
        &self.intercepts
    }

    #[inline]
    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn artifact() -> ModelArtifact {
        let width = SummaryVector::dense_len(2);
        ModelArtifact {
            metadata: ArtifactMetadata {
                version: ModelVersion::new(1, 0, 0),
                input_schema: SchemaVersion::new("v1"),
                transform: TransformMetadata {
                    block_size: 2,
                    max_depth: 2,
                    truth_coefficient: 1.0,
                    normalization_range: 1000.0,
                },
            },
            categories: vec![
                CategorySpec {
                    name: "low".into(),
                    weights: vec![0.01; width],
                    intercept: 0.2,
                    risk_threshold: 0.9,
                },
                CategorySpec {
                    name: "high".into(),
                    weights: vec![0.02; width],
                    intercept: -0.1,
                    risk_threshold: 0.5,
                },
            ],
            calibration: CalibrationTable {
                breakpoints: vec![-5.0, 0.0, 5.0],
                values: vec![0.1, 0.5, 0.9],
            },
        }
    }

    #[test]
    fn toml_round_trip_preserves_the_artifact() {
        let original = artifact();
        let rendered = toml::to_string_pretty(&original).unwrap();
        let reparsed = ModelArtifact::from_toml_str(&rendered).unwrap();

        assert_eq!(reparsed.metadata.version, original.metadata.version);
        assert_eq!(reparsed.metadata.input_schema, original.metadata.input_schema);
        assert_eq!(reparsed.categories.len(), 2);
        assert_eq!(reparsed.categories[1].name, "high");
        assert_eq!(reparsed.calibration, original.calibration);
    }

    #[test]
    fn build_produces_coherent_shapes() {
        let model = artifact().build().unwrap();
        let width = SummaryVector::dense_len(2);

        assert_eq!(model.weights().shape(), &[2, width]);
        assert_eq!(model.intercepts().len(), 2);
        assert_eq!(model.categories(), &["low".to_string(), "high".to_string()]);
    }

    #[test]
    fn build_rejects_mismatched_weight_rows() {
        let mut bad = artifact();
        bad.categories[0].weights.pop();
        assert!(matches!(
            bad.build().unwrap_err(),
            ArtifactError::Malformed(_)
        ));
    }

    #[test]
    fn build_rejects_a_non_monotone_calibration_table() {
        let mut bad = artifact();
        bad.calibration.values = vec![0.5, 0.1, 0.9];
        assert!(matches!(
            bad.build().unwrap_err(),
            ArtifactError::Malformed(_)
        ));
    }

    #[test]
    fn build_rejects_duplicate_category_names() {
        let mut bad = artifact();
        bad.categories[1].name = "low".into();
        assert!(matches!(
            bad.build().unwrap_err(),
            ArtifactError::Malformed(_)
        ));
    }

    #[test]
    fn calibration_interpolates_and_clamps() {
        let table = CalibrationTable {
            breakpoints: vec![-5.0, 0.0, 5.0],
            values: vec![0.1, 0.5, 0.9],
        };

        assert_abs_diff_eq!(table.transform(0.0), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(table.transform(2.5), 0.7, epsilon = 1e-12);
        // Outside the fitted range, the curve clamps to its end values.
        assert_abs_diff_eq!(table.transform(-100.0), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(table.transform(100.0), 0.9, epsilon = 1e-12);
    }

    #[test]
    fn calibration_stays_monotone_between_points() {
        let table = CalibrationTable {
            breakpoints: vec![-2.0, -1.0, 1.0, 3.0],
            values: vec![0.05, 0.2, 0.2, 0.95],
        };
        table.check().unwrap();

        let mut last = f64::NEG_INFINITY;
        let mut score = -3.0;
        while score <= 4.0 {
            let p = table.transform(score);
            assert!(p >= last, "calibration regressed at score {score}");
            last = p;
            score += 0.125;
        }
    }
}
