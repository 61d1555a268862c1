//! Score combination and calibration: summary in, risk prediction out.

use crate::model::PredictionModel;
use crate::summary::SummaryVector;
use crate::types::{Fingerprint, PredictionResult};

/// Runs a summary through a resolved model.
///
/// Shape coherence between the summary and the model is established upstream
/// (the artifact's `build` ties weight rows to its declared transform, and
/// the engine refuses schema or transform skew before calling in), so this
/// stage is pure arithmetic with no failure mode.
pub fn combine(
    summary: &SummaryVector,
    model: &PredictionModel,
    fingerprint: Fingerprint,
) -> PredictionResult {
    let dense = summary.to_dense();
    let raw_scores = model.weights().dot(&dense) + model.intercepts();

    // Per-category calibration, then renormalization across the mutually
    // exclusive categories so the probabilities sum to 1.
    let mut probabilities: Vec<f64> = raw_scores
        .iter()
        .map(|&score| model.calibration().transform(score))
        .collect();
    let total: f64 = probabilities.iter().sum();
    if total > 0.0 {
        for p in &mut probabilities {
            *p /= total;
        }
    } else {
        // A degenerate table can map every score to zero mass; an
        // uninformative uniform distribution keeps the sum-to-1 invariant.
        log::warn!(
            "calibration produced zero total mass for model {}; falling back to uniform",
            model.version()
        );
        let uniform = 1.0 / probabilities.len() as f64;
        for p in &mut probabilities {
            *p = uniform;
        }
    }

    // Highest probability wins; on an exact tie the earlier category in the
    // declared priority order keeps the label.
    let mut winner = 0;
    for (i, &p) in probabilities.iter().enumerate().skip(1) {
        if p > probabilities[winner] {
            winner = i;
        }
    }

    let flagged = model
        .categories()
        .iter()
        .zip(&probabilities)
        .zip(model.risk_thresholds())
        .filter(|((_, &probability), &threshold)| probability >= threshold)
        .map(|((name, _), _)| name.clone())
        .collect();

    PredictionResult {
        categories: model.categories().to_vec(),
        probabilities,
        label: model.categories()[winner].clone(),
        flagged,
        model_version: model.version(),
        fingerprint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ArtifactMetadata, CalibrationTable, CategorySpec, ModelArtifact, TransformMetadata,
    };
    use crate::reduce::{reduce, PyramidParams};
    use crate::schema::FeatureVector;
    use crate::summary::{summarize, SummaryVector as Summary};
    use crate::types::{Fingerprint, ModelVersion, SchemaVersion};
    use approx::assert_abs_diff_eq;

    const MAX_DEPTH: usize = 2;

    fn params() -> PyramidParams {
        PyramidParams {
            block_size: 2,
            max_depth: MAX_DEPTH,
            truth_coefficient: 1.0,
            normalization_range: 1000.0,
        }
    }

    fn summary() -> crate::summary::SummaryVector {
        let input =
            FeatureVector::from_values(SchemaVersion::new("v1"), vec![3.0, 9.0, 27.0, 81.0]);
        let pyramid = reduce(&input, &params()).unwrap();
        summarize(&pyramid, MAX_DEPTH)
    }

    fn model_with(categories: Vec<CategorySpec>, calibration: CalibrationTable) -> PredictionModel {
        ModelArtifact {
            metadata: ArtifactMetadata {
                version: ModelVersion::new(1, 0, 0),
                input_schema: SchemaVersion::new("v1"),
                transform: TransformMetadata {
                    block_size: 2,
                    max_depth: MAX_DEPTH,
                    truth_coefficient: 1.0,
                    normalization_range: 1000.0,
                },
            },
            categories,
            calibration,
        }
        .build()
        .unwrap()
    }

    fn category(name: &str, weight: f64, intercept: f64, threshold: f64) -> CategorySpec {
        CategorySpec {
            name: name.into(),
            weights: vec![weight; Summary::dense_len(MAX_DEPTH)],
            intercept,
            risk_threshold: threshold,
        }
    }

    fn table() -> CalibrationTable {
        CalibrationTable {
            breakpoints: vec![-10.0, 0.0, 10.0],
            values: vec![0.05, 0.5, 0.95],
        }
    }

    #[test]
    fn probabilities_sum_to_one() {
        let model = model_with(
            vec![
                category("low", 0.001, 0.5, 1.0),
                category("moderate", 0.002, 0.0, 1.0),
                category("high", 0.003, -0.5, 1.0),
            ],
            table(),
        );
        let summary = summary();
        let fingerprint = Fingerprint::digest(&SchemaVersion::new("v1"), 2, MAX_DEPTH, &[1.0]);
        let result = combine(&summary, &model, fingerprint);

        let total: f64 = result.probabilities.iter().sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
        assert_eq!(result.categories.len(), 3);
        assert_eq!(result.model_version, ModelVersion::new(1, 0, 0));
    }

    #[test]
    fn exact_ties_go_to_the_earlier_category() {
        let model = model_with(
            vec![
                category("first", 0.001, 0.25, 1.0),
                category("second", 0.001, 0.25, 1.0),
            ],
            table(),
        );
        let summary = summary();
        let fingerprint = Fingerprint::digest(&SchemaVersion::new("v1"), 2, MAX_DEPTH, &[1.0]);
        let result = combine(&summary, &model, fingerprint);

        assert_eq!(result.probabilities[0], result.probabilities[1]);
        assert_eq!(result.label, "first");
    }

    #[test]
    fn categories_at_their_threshold_are_flagged() {
        let model = model_with(
            vec![
                category("low", -0.01, -3.0, 0.9),
                category("high", 0.01, 3.0, 0.5),
            ],
            table(),
        );
        let summary = summary();
        let fingerprint = Fingerprint::digest(&SchemaVersion::new("v1"), 2, MAX_DEPTH, &[1.0]);
        let result = combine(&summary, &model, fingerprint);

        assert_eq!(result.label, "high");
        assert_eq!(result.flagged, vec!["high".to_string()]);
    }

    #[test]
    fn zero_calibrated_mass_falls_back_to_uniform() {
        let zero_table = CalibrationTable {
            breakpoints: vec![0.0],
            values: vec![0.0],
        };
        let model = model_with(
            vec![category("a", 0.0, 0.0, 1.0), category("b", 0.0, 0.0, 1.0)],
            zero_table,
        );
        let summary = summary();
        let fingerprint = Fingerprint::digest(&SchemaVersion::new("v1"), 2, MAX_DEPTH, &[1.0]);
        let result = combine(&summary, &model, fingerprint);

        assert_abs_diff_eq!(result.probabilities[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(result.probabilities[1], 0.5, epsilon = 1e-12);
    }
}
