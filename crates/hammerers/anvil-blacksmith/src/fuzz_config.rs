use crate::pattern::FuzzingRanges;
use anvil_core::memory::ConflictSearch;
use anvil_core::timing::RefreshSync;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid run or fuzzing parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A parameter is out of its valid range
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// What the engine does with its time budget.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub enum Mode {
    /// Generate and probe new patterns
    #[default]
    Fuzz,
    /// Sweep patterns from an earlier run
    Replay {
        /// Fuzzing summary to load
        path: PathBuf,
        /// Patterns to replay; all when empty
        pattern_ids: Vec<String>,
    },
}

/// How aggressors are bound to rows during probing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeStrategy {
    /// Row offsets from a start row inside one bank
    #[default]
    RowOffsets,
    /// Tuple heads found with the row-conflict side channel
    ConflictSearch,
}

/// Immutable run parameters threaded through the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FuzzConfig {
    /// Wall-clock budget of the run
    pub runtime_limit: Duration,
    /// Ranks of the DIMM under test
    pub num_ranks: usize,
    /// Fixed activations per refresh interval; random when unset
    pub acts_per_ref: Option<usize>,
    /// Whether the region is backed by huge pages
    pub use_huge_pages: bool,
    /// Address mappings tried per pattern
    pub probes_per_pattern: usize,
    /// Locations each mapping is hammered at
    pub locations_per_mapping: usize,
    /// Sweep the best pattern after fuzzing
    pub sweep: bool,
    /// Row offsets of the ranking minisweep
    pub minisweep_rows: usize,
    /// Row offsets of the full sweep
    pub sweep_rows: usize,
    /// Bursts per mapping when replaying at the original location
    pub replay_rounds: usize,
    /// Operator-supplied DIMM identifier
    pub dimm_id: Option<u32>,
    /// Fuzz or replay
    pub mode: Mode,
    /// Keep mappings without flips in the summary
    pub record_all: bool,
    /// Row binding strategy
    pub probe_strategy: ProbeStrategy,
    /// Row-conflict side channel parameters
    pub conflict: ConflictSearch,
    /// Exclusive upper bound of mapped rows
    pub max_row: usize,
    /// REFRESH alignment parameters
    pub sync: RefreshSync,
    /// Stop after this many generated patterns
    pub max_patterns: Option<usize>,
    /// Seed of the engine's random generator; random when unset
    pub seed: Option<u64>,
    /// Bounds of the pattern search space
    pub ranges: FuzzingRanges,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        FuzzConfig {
            runtime_limit: Duration::from_secs(3 * 60 * 60),
            num_ranks: 1,
            acts_per_ref: None,
            use_huge_pages: true,
            probes_per_pattern: 3,
            locations_per_mapping: 3,
            sweep: true,
            minisweep_rows: 75,
            sweep_rows: 256,
            replay_rounds: 150,
            dimm_id: None,
            mode: Mode::Fuzz,
            record_all: false,
            probe_strategy: ProbeStrategy::RowOffsets,
            conflict: ConflictSearch::default(),
            max_row: 4096,
            sync: RefreshSync::default(),
            max_patterns: None,
            seed: None,
            ranges: FuzzingRanges::default(),
        }
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

impl FuzzConfig {
    /// Checks parameter ranges against each other and against `num_rows`,
    /// the row count of the DIMM geometry.
    pub fn validate(&self, num_rows: usize) -> Result<(), ConfigError> {
        if self.runtime_limit.is_zero() && self.max_patterns.is_none() {
            return Err(invalid("runtime_limit", "zero without a pattern bound"));
        }
        if self.num_ranks == 0 {
            return Err(invalid("num_ranks", "must be positive"));
        }
        if let Some(acts) = self.acts_per_ref
            && acts < 2
        {
            return Err(invalid("acts_per_ref", format!("{} < 2", acts)));
        }
        if self.probes_per_pattern == 0 {
            return Err(invalid("probes_per_pattern", "must be positive"));
        }
        if self.locations_per_mapping == 0 {
            return Err(invalid("locations_per_mapping", "must be positive"));
        }
        if self.max_row < 2 || self.max_row > num_rows {
            return Err(invalid(
                "max_row",
                format!("{} not in 2..={}", self.max_row, num_rows),
            ));
        }
        if self.sweep && self.sweep_rows == 0 {
            return Err(invalid("sweep_rows", "must be positive when sweeping"));
        }
        if matches!(self.mode, Mode::Replay { .. }) && self.replay_rounds == 0 {
            return Err(invalid("replay_rounds", "must be positive when replaying"));
        }
        if self.sync.max_attempts == 0 {
            return Err(invalid("sync", "max_attempts must be positive"));
        }
        if self.conflict.max_candidates == 0 {
            return Err(invalid("conflict", "max_candidates must be positive"));
        }

        let ranges = &self.ranges;
        for (name, range) in [
            ("ranges.acts_per_ref", ranges.acts_per_ref),
            ("ranges.n_sided", ranges.n_sided),
            ("ranges.num_aggressors", ranges.num_aggressors),
            ("ranges.refresh_intervals_exp", ranges.refresh_intervals_exp),
            ("ranges.agg_inter_distance", ranges.agg_inter_distance),
            ("ranges.start_row", ranges.start_row),
            (
                "ranges.wait_until_start_hammering_refs",
                ranges.wait_until_start_hammering_refs,
            ),
        ] {
            if range.min > range.max {
                return Err(invalid(
                    name,
                    format!("min {} > max {}", range.min, range.max),
                ));
            }
        }
        if ranges.acts_per_ref.min < 2 {
            return Err(invalid("ranges.acts_per_ref", "min must be at least 2"));
        }
        if ranges.n_sided.min == 0 {
            return Err(invalid("ranges.n_sided", "min must be positive"));
        }
        if ranges.refresh_intervals_exp.max >= usize::BITS as usize / 2 {
            return Err(invalid("ranges.refresh_intervals_exp", "exponent too large"));
        }
        if ranges.amplitude_factor == 0 {
            return Err(invalid("ranges.amplitude_factor", "must be positive"));
        }
        if ranges.hammering_total_num_activations == 0 {
            return Err(invalid(
                "ranges.hammering_total_num_activations",
                "must be positive",
            ));
        }
        if ranges.agg_intra_distance == 0 || ranges.agg_intra_distance >= self.max_row {
            return Err(invalid(
                "ranges.agg_intra_distance",
                format!("{} not in 1..{}", ranges.agg_intra_distance, self.max_row),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::ParamRange;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(FuzzConfig::default().validate(4096), Ok(()));
    }

    #[test]
    fn test_rejects_max_row_beyond_geometry() {
        let config = FuzzConfig {
            max_row: 8192,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(4096),
            Err(ConfigError::InvalidParameter { name: "max_row", .. })
        ));
    }

    #[test]
    fn test_rejects_inverted_range() {
        let mut config = FuzzConfig::default();
        config.ranges.agg_inter_distance = ParamRange::new(12, 2);
        let err = config.validate(4096).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid parameter `ranges.agg_inter_distance`: min 12 > max 2"
        );
    }

    #[test]
    fn test_rejects_tiny_fixed_acts() {
        let config = FuzzConfig {
            acts_per_ref: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(4096),
            Err(ConfigError::InvalidParameter { name: "acts_per_ref", .. })
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() -> anyhow::Result<()> {
        let config: FuzzConfig = serde_json::from_str(
            r#"{"runtime_limit": {"secs": 60, "nanos": 0}, "probe_strategy": "ConflictSearch"}"#,
        )?;
        assert_eq!(config.runtime_limit, Duration::from_secs(60));
        assert_eq!(config.probe_strategy, ProbeStrategy::ConflictSearch);
        assert_eq!(config.probes_per_pattern, 3);
        assert_eq!(config.mode, Mode::Fuzz);
        Ok(())
    }
}
