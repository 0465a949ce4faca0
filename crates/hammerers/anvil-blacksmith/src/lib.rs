//! Blacksmith-style frequency fuzzer for Rowhammer.
//!
//! This crate searches the space of frequency-based hammering patterns. Each
//! pattern is a schedule of symbolic aggressors built from groups with a
//! period, a phase and an amplitude; the engine binds the aggressors to DRAM
//! rows, hammers them in step with REFRESH and keeps the mappings that flip
//! bits.
//!
//! # Main Components
//!
//! - [`pattern`] - aggressors, access groups, the pattern generator and the
//!   fuzzing parameters
//! - [`PatternAddressMapper`] - binds a pattern's aggressors to rows of one bank
//! - [`SyncHammerer`] - the REFRESH-synchronized [`anvil_core::hammerer::Hammering`]
//!   implementation
//! - [`FuzzyHammerer`] - the fuzzing engine, built with [`FuzzyHammerer::builder`]
//! - [`ReplayingHammerer`] - minisweeps, sweeps and replay of earlier results
//!
//! # Configuration
//!
//! The DIMM geometry is loaded from a JSON file through [`BlacksmithConfig`];
//! run parameters are a [`FuzzConfig`].
//!
//! # References
//!
//! Based on: Jattke et al., "Blacksmith: Scalable Rowhammering in the Frequency Domain",
//! IEEE S&P 2022.

#![warn(missing_docs)]

mod blacksmith_config;
mod fuzz_config;
mod fuzzer;
mod hammerer;
mod mapper;
pub mod pattern;
mod replay;

pub use blacksmith_config::*;
pub use fuzz_config::*;
pub use fuzzer::{
    FuzzError, FuzzReport, FuzzyHammerer, FuzzyHammererBuilder, HammererFactory, PatternMappingStat, Phase,
    ProbeStats,
};
pub use hammerer::*;
pub use mapper::*;
pub use replay::*;
