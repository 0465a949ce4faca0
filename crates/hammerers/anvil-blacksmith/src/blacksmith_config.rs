use anvil_core::memory::{BitDef, GeometryError, MemConfiguration};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur when loading Blacksmith configuration.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

/// Result type for BlacksmithConfig constructor.
pub type Result<T> = std::result::Result<T, Error>;

/// DIMM description: organization, timing threshold and addressing functions.
///
/// Loaded from JSON files containing DRAM addressing bit functions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BlacksmithConfig {
    /// Free-form DIMM name
    pub name: String,
    /// Memory channels
    pub channels: u64,
    /// DIMMs per channel
    pub dimms: u64,
    /// Ranks per DIMM
    pub ranks: u64,
    /// Banks over all ranks
    pub total_banks: u64,
    /// Rows the fuzzer may map aggressors to
    pub max_rows: u64,
    /// Timing threshold for bank conflict detection (in CPU cycles)
    pub threshold: u64,
    /// Rounds per burst in the reverse-engineering tool
    pub hammer_rounds: usize,
    /// Timing rounds in the reverse-engineering tool
    pub drama_rounds: usize,
    /// Measured activations per refresh interval
    pub acts_per_trefi: u64,
    /// Physical address bits used for DRAM row selection
    pub row_bits: Vec<BitDef>,
    /// Physical address bits used for DRAM column selection
    pub col_bits: Vec<BitDef>,
    /// Physical address bits used for DRAM bank selection
    pub bank_bits: Vec<BitDef>,
}

impl BlacksmithConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<BlacksmithConfig> {
        let reader = BufReader::new(File::open(filepath)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Builds the address translation for this DIMM.
    pub fn mem_config(&self) -> std::result::Result<MemConfiguration, GeometryError> {
        MemConfiguration::from_bitdefs(&self.bank_bits, &self.row_bits, &self.col_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../../config/bs-config.json");

    #[test]
    fn test_bank_function_period() -> anyhow::Result<()> {
        let config = BlacksmithConfig::from_jsonfile(CONFIG)?;
        let mem_config = config.mem_config()?;
        assert_eq!(mem_config.bank_function_period(), 512);
        assert_eq!(mem_config.get_bank_count() as u64, config.total_banks);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            BlacksmithConfig::from_jsonfile("/nonexistent/bs-config.json"),
            Err(Error::IoError(_))
        ));
    }
}
