use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the LMDB environment.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub backend: BackendKind,
    /// LMDB map size in megabytes.
    #[serde(default = "default_map_size_mb")]
    pub map_size_mb: usize,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub tuning: QueryTuning,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            backend: BackendKind::default(),
            map_size_mb: default_map_size_mb(),
            query: QueryConfig::default(),
            tuning: QueryTuning::default(),
        }
    }
}

impl StoreConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Lmdb,
    Memory,
}

fn default_db_path() -> String {
    "data/events".to_string()
}

fn default_map_size_mb() -> usize {
    10 * 1024 // 10 GB
}

/// Limits applied to every query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Hard cap on the number of events a single query may return.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    /// Used by the CLI when a filter carries no limit of its own.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_limit: default_max_limit(),
            default_limit: default_limit(),
        }
    }
}

fn default_max_limit() -> usize {
    500
}

fn default_limit() -> usize {
    100
}

/// Knobs of the multi-index merge.
///
/// None of these change which events a query returns, only how many index
/// entries are pulled per round and how many iterators are refilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTuning {
    /// Exponent applied to the limit when sizing per-iterator batches.
    #[serde(default = "default_batch_limit_exponent")]
    pub batch_limit_exponent: f64,
    /// Exponent applied to the number of queries when sizing batches.
    #[serde(default = "default_batch_queries_exponent")]
    pub batch_queries_exponent: f64,
    /// Plans with `limit * queries` below this pull `limit` per batch.
    #[serde(default = "default_small_plan_threshold")]
    pub small_plan_threshold: usize,
    /// One in this many iterators is refilled per merge round.
    #[serde(default = "default_fanout_divisor")]
    pub fanout_divisor: usize,
}

impl Default for QueryTuning {
    fn default() -> Self {
        Self {
            batch_limit_exponent: default_batch_limit_exponent(),
            batch_queries_exponent: default_batch_queries_exponent(),
            small_plan_threshold: default_small_plan_threshold(),
            fanout_divisor: default_fanout_divisor(),
        }
    }
}

fn default_batch_limit_exponent() -> f64 {
    0.80
}

fn default_batch_queries_exponent() -> f64 {
    0.71
}

fn default_small_plan_threshold() -> usize {
    50
}

fn default_fanout_divisor() -> usize {
    12
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: StoreConfig = toml::from_str("").unwrap();
        assert_eq!(config.backend, BackendKind::Lmdb);
        assert_eq!(config.query.max_limit, 500);
        assert_eq!(config.tuning.fanout_divisor, 12);
        assert!((config.tuning.batch_limit_exponent - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: StoreConfig = toml::from_str(
            r#"
            backend = "memory"
            db_path = "/tmp/x"

            [tuning]
            fanout_divisor = 14
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.db_path, "/tmp/x");
        assert_eq!(config.tuning.fanout_divisor, 14);
        assert_eq!(config.tuning.small_plan_threshold, 50);
        assert_eq!(config.query.default_limit, 100);
    }
}
