//! # Anvil
//!
//! Anvil is a frequency-based Rowhammer fuzzer. It generates non-uniform
//! hammering patterns, maps them to DRAM rows of a fixed-address region,
//! hammers them in step with REFRESH and records the patterns that flip bits.
//!
//! ## Quickstart guide
//!
//! ```sh
//! # Build and run the fuzzer for one hour
//! cargo build --release
//! sudo target/release/fuzz --config config/bs-config.json --runtime-limit 60
//!```
//!
//! The default options expect a DIMM description in `config/bs-config.json`
//! and 1 GiB huge pages reserved by the administrator. Results are written to
//! `fuzz-summary.json`, which `fuzz --replay` loads again. Use
//! `target/release/fuzz --help` to see available options.
//!
//! ## Crates
//!
//! - `anvil-core`: address translation, timing, the hammering region.
//! - `anvil-blacksmith`: patterns, the fuzzing engine and replay.

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Installs `env_logger` (default filter `info`) behind a progress-bar
/// aware log bridge and returns the shared [`MultiProgress`].
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
