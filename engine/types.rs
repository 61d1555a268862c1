// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are
// used in one file.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Identifies a feature-schema revision. Validated inputs, summaries, and
/// model artifacts all carry one; a prediction is only ever produced when
/// they agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(String);

impl SchemaVersion {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A model artifact version. Ordered so the registry can resolve "latest"
/// without an explicit request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ModelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModelVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ModelVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let (major, minor, patch) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => {
                return Err(format!(
                    "Invalid model version '{s}'. Expected MAJOR.MINOR.PATCH, e.g. '1.0.0'."
                ));
            }
        };
        let parse = |component: &str| {
            component.parse::<u32>().map_err(|_| {
                format!("Invalid model version '{s}': component '{component}' is not a number.")
            })
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
            patch: parse(patch)?,
        })
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl TryFrom<String> for ModelVersion {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<ModelVersion> for String {
    fn from(version: ModelVersion) -> Self {
        version.to_string()
    }
}

/// Deterministic identity of a validated input under a fixed reduction
/// shape. Two requests with equal fingerprints are guaranteed to produce
/// bit-identical pyramids, which is what makes the result cache and
/// reproducibility audits sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Canonical digest over the schema version, the reduction shape, and
    /// the IEEE-754 bit pattern of every value in declared field order.
    pub(crate) fn digest(
        schema: &SchemaVersion,
        block_size: usize,
        max_depth: usize,
        values: &[f64],
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(schema.as_str().as_bytes());
        // NUL separator so the schema label can never bleed into the shape bytes.
        hasher.update([0u8]);
        hasher.update((block_size as u64).to_le_bytes());
        hasher.update((max_depth as u64).to_le_bytes());
        hasher.update((values.len() as u64).to_le_bytes());
        for value in values {
            hasher.update(value.to_bits().to_le_bytes());
        }
        Self(hasher.finalize().into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses the lowercase-hex rendering produced by `Display`, for audit
    /// tooling that round-trips fingerprints as text.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A raw input value as the boundary layer hands it over. Numeric text is
/// parsed ("37.5"); any other text is rejected by the validator. No further
/// coercion exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

/// The final, immutable product of one prediction request. Created once,
/// never mutated; safe to cache and hand out repeatedly.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    /// Category labels in the model's declared priority order.
    pub categories: Vec<String>,
    /// Calibrated probability per category, aligned with `categories`.
    /// Sums to 1 within floating-point tolerance.
    pub probabilities: Vec<f64>,
    /// The winning category label.
    pub label: String,
    /// Categories whose calibrated probability reached their declared risk
    /// threshold.
    pub flagged: Vec<String>,
    /// The model that produced this result.
    pub model_version: ModelVersion,
    /// The pyramid this result was derived from; `explain` resolves it.
    pub fingerprint: Fingerprint,
}
