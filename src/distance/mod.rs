//! Distance metrics for vector similarity computation
//!
//! Every metric is expressed as a distance: smaller means closer.

pub mod euclidean;
pub mod cosine;
pub mod inner_product;

pub use euclidean::{euclidean_distance, euclidean_distance_squared};
pub use cosine::{cosine_distance, cosine_similarity};
pub use inner_product::{dot_product, inner_product_distance};

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Distance metric trait
pub trait DistanceMetric: Send + Sync {
    /// Compute distance between two vectors
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;
}

/// Metric kinds an HNSW index can be created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Squared Euclidean distance
    L2sq,
    /// 1 - cosine similarity
    Cosine,
    /// 1 - inner product
    InnerProduct,
}

impl Default for MetricKind {
    fn default() -> Self {
        MetricKind::L2sq
    }
}

impl MetricKind {
    /// Parse an option value; names are case-insensitive
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "l2sq" => Ok(MetricKind::L2sq),
            "cosine" => Ok(MetricKind::Cosine),
            "ip" => Ok(MetricKind::InnerProduct),
            other => Err(StorageError::Config(format!(
                "unsupported metric '{}', expected one of l2sq, cosine, ip",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MetricKind::L2sq => "l2sq",
            MetricKind::Cosine => "cosine",
            MetricKind::InnerProduct => "ip",
        }
    }

    /// SQL distance function answered by an index of this metric
    pub fn distance_function(self) -> &'static str {
        match self {
            MetricKind::L2sq => "array_distance",
            MetricKind::Cosine => "array_cosine_similarity",
            MetricKind::InnerProduct => "array_inner_product",
        }
    }
}

impl DistanceMetric for MetricKind {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            MetricKind::L2sq => euclidean_distance_squared(a, b),
            MetricKind::Cosine => cosine_distance(a, b),
            MetricKind::InnerProduct => inner_product_distance(a, b),
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
