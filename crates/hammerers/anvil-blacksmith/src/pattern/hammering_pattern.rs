use super::aggressor::id_list;
use super::{Aggressor, AggressorAccessPattern};
use crate::PatternAddressMapper;
use anvil_core::memory::MemConfiguration;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

/// A composite access pattern made of frequency groups.
///
/// `access_ids` is the flattened slot schedule of one pattern repetition;
/// `address_mappings` holds the probes that produced flips.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HammeringPattern {
    /// Unique identifier for this pattern
    pub id: String,
    /// Slots per base period
    pub base_period: usize,
    /// Largest group period
    pub max_period: usize,
    /// Activations in one repetition of `access_ids`
    pub total_activations: usize,
    /// Refresh intervals covered by one repetition
    pub num_refresh_intervals: usize,
    /// Whether the pattern only flips at specific locations
    #[serde(default)]
    pub is_location_dependent: bool,
    /// Aggressor row access sequence
    #[serde(with = "id_list")]
    pub access_ids: Vec<Aggressor>,
    /// Frequency groups the schedule was built from
    #[serde(default)]
    pub agg_access_patterns: Vec<AggressorAccessPattern>,
    /// Address mappings for this pattern
    #[serde(default)]
    pub address_mappings: Vec<PatternAddressMapper>,
}

/// Errors that can occur when loading patterns from JSON.
#[derive(Debug, Error)]
pub enum PatternLoadError {
    /// I/O error reading pattern file
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON parsing error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Pattern with specified ID not found
    #[error("Did not find pattern with id {0}")]
    NotFound(String),
}

impl HammeringPattern {
    /// Creates an empty pattern.
    pub fn new(id: String) -> Self {
        HammeringPattern {
            id,
            base_period: 0,
            max_period: 0,
            total_activations: 0,
            num_refresh_intervals: 0,
            is_location_dependent: false,
            access_ids: vec![],
            agg_access_patterns: vec![],
            address_mappings: vec![],
        }
    }

    /// Activations per refresh interval.
    pub fn acts_per_ref(&self) -> usize {
        self.total_activations / self.num_refresh_intervals.max(1)
    }

    /// All aggressors referenced by the groups, in group order and then
    /// position order. Shared aggressors appear once per reference.
    pub fn referenced_aggressors(&self) -> Vec<Aggressor> {
        self.agg_access_patterns
            .iter()
            .flat_map(|group| group.aggressors())
            .collect()
    }

    /// Finds the address mapping with the most bit flips.
    pub fn determine_most_effective_mapping(&self) -> Option<&PatternAddressMapper> {
        self.address_mappings
            .iter()
            .max_by_key(|m| m.count_bitflips())
    }

    /// Finds an address mapping by its identifier.
    pub fn find_mapping(&self, mapping_id: &str) -> Option<&PatternAddressMapper> {
        self.address_mappings.iter().find(|m| m.id == mapping_id)
    }

    /// Total flips over all mappings.
    pub fn count_bitflips(&self) -> usize {
        self.address_mappings.iter().map(|m| m.count_bitflips()).sum()
    }

    /// Compact schedule, e.g. `agg00 agg01 agg00 agg02`.
    pub fn get_pattern_text_repr(&self) -> String {
        self.access_ids.iter().join(" ")
    }
}

/// Run information stored next to the patterns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FuzzMetadata {
    /// Start of the run (seconds since the epoch)
    pub start: i64,
    /// End of the run (seconds since the epoch)
    pub end: i64,
    /// Number of generated patterns
    pub num_patterns: usize,
    /// Operator-supplied DIMM identifier
    #[serde(default)]
    pub dimm_id: Option<u32>,
    /// Address mapping used during the run
    #[serde(default)]
    pub memory_config: Option<MemConfiguration>,
}

/// Container for fuzzing results.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FuzzSummary {
    /// Run information; absent in summaries written by other tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FuzzMetadata>,
    /// All effective hammering patterns
    pub hammering_patterns: Vec<HammeringPattern>,
}

impl FuzzSummary {
    /// Reads a summary from a JSON file.
    pub fn from_jsonfile<P: AsRef<Path>>(path: P) -> Result<Self, PatternLoadError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Writes the summary as JSON.
    pub fn to_jsonfile<P: AsRef<Path>>(&self, path: P) -> Result<(), PatternLoadError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Returns the patterns with the given ids in the requested order, or all
    /// patterns when `pattern_ids` is empty.
    pub fn select(&self, pattern_ids: &[String]) -> Result<Vec<HammeringPattern>, PatternLoadError> {
        if pattern_ids.is_empty() {
            return Ok(self.hammering_patterns.clone());
        }
        pattern_ids
            .iter()
            .map(|id| {
                self.hammering_patterns
                    .iter()
                    .find(|p| &p.id == id)
                    .cloned()
                    .ok_or_else(|| PatternLoadError::NotFound(id.clone()))
            })
            .collect()
    }
}
