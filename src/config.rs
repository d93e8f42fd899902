//! Index creation options and HNSW graph hyperparameters
//!
//! Options arrive from the host as a case-insensitive key/value map and are
//! folded into an [`HnswConfig`] plus a [`MetricKind`].

use crate::distance::MetricKind;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Recognized option keys
pub const OPTION_METRIC: &str = "metric";
pub const OPTION_EF_CONSTRUCTION: &str = "ef_construction";
pub const OPTION_EF_SEARCH: &str = "ef_search";
pub const OPTION_M: &str = "m";
pub const OPTION_M0: &str = "m0";

const KNOWN_OPTIONS: [&str; 5] = [
    OPTION_METRIC,
    OPTION_EF_CONSTRUCTION,
    OPTION_EF_SEARCH,
    OPTION_M,
    OPTION_M0,
];

/// A single option value as bound by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionValue {
    Integer(i64),
    Text(String),
}

impl OptionValue {
    fn as_text(&self) -> String {
        match self {
            OptionValue::Integer(v) => v.to_string(),
            OptionValue::Text(s) => s.clone(),
        }
    }

    fn as_positive(&self, key: &str) -> Result<usize> {
        let value = match self {
            OptionValue::Integer(v) => *v,
            OptionValue::Text(s) => s.trim().parse::<i64>().map_err(|_| {
                StorageError::Config(format!("option '{}' expects an integer, got '{}'", key, s))
            })?,
        };
        if value <= 0 || value > i32::MAX as i64 {
            return Err(StorageError::Config(format!(
                "option '{}' must be a positive 32-bit integer, got {}",
                key, value
            )));
        }
        Ok(value as usize)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Integer(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Integer(v as i64)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

/// Case-insensitive option map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    values: BTreeMap<String, OptionValue>,
}

impl IndexOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.values.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(&key.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// HNSW graph hyperparameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Max neighbors per node on upper layers (m)
    pub connectivity: usize,

    /// Max neighbors per node on the base layer (m0)
    pub connectivity_base: usize,

    /// Candidate list size while inserting (ef_construction)
    pub expansion_add: usize,

    /// Candidate list size while searching (ef_search)
    pub expansion_search: usize,

    /// Whether the graph keeps a key -> vector lookup for callers.
    /// Row vectors live in the table, so indexes built here keep it off.
    pub enable_key_lookups: bool,

    /// Seed for level assignment
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            connectivity: 16,
            connectivity_base: 32,
            expansion_add: 128,
            expansion_search: 64,
            enable_key_lookups: false,
            seed: 0x5eed_4e53_7700_0001,
        }
    }
}

impl HnswConfig {
    /// Fold creation options into a metric and config.
    ///
    /// `m` also seeds `m0` as `2 * m`; an explicit `m0` wins.
    pub fn from_options(options: &IndexOptions) -> Result<(MetricKind, Self)> {
        if let Some(unknown) = options.keys().find(|k| !KNOWN_OPTIONS.contains(k)) {
            return Err(StorageError::Config(format!(
                "unrecognized HNSW index option '{}'",
                unknown
            )));
        }

        let metric = match options.get(OPTION_METRIC) {
            Some(value) => MetricKind::parse(&value.as_text())?,
            None => MetricKind::default(),
        };

        let mut config = Self::default();
        if let Some(v) = options.get(OPTION_EF_CONSTRUCTION) {
            config.expansion_add = v.as_positive(OPTION_EF_CONSTRUCTION)?;
        }
        if let Some(v) = options.get(OPTION_EF_SEARCH) {
            config.expansion_search = v.as_positive(OPTION_EF_SEARCH)?;
        }
        if let Some(v) = options.get(OPTION_M) {
            config.connectivity = v.as_positive(OPTION_M)?;
            config.connectivity_base = config.connectivity * 2;
        }
        if let Some(v) = options.get(OPTION_M0) {
            config.connectivity_base = v.as_positive(OPTION_M0)?;
        }
        config.validate()?;

        Ok((metric, config))
    }

    pub fn validate(&self) -> Result<()> {
        if self.connectivity < 2 {
            return Err(StorageError::Config(format!(
                "connectivity (m) must be at least 2, got {}",
                self.connectivity
            )));
        }
        if self.connectivity_base < self.connectivity {
            return Err(StorageError::Config(format!(
                "base connectivity (m0 = {}) must not be below m = {}",
                self.connectivity_base, self.connectivity
            )));
        }
        Ok(())
    }

    /// Level generation factor 1/ln(m)
    pub fn level_multiplier(&self) -> f64 {
        1.0 / (self.connectivity as f64).ln()
    }
}
