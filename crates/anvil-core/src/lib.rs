//! # Anvil Core
//!
//! `anvil-core` holds the hardware-facing building blocks of the Anvil Rowhammer
//! fuzzer. Pattern generation and the fuzzing engine live in hammerer crates on
//! top of it.
//!
//! ## Main Components
//!
//! - [`memory`] - DRAM address translation ([`memory::MemConfiguration`],
//!   [`memory::DRAMAddr`]), the fixed-address [`memory::HammerRegion`] with
//!   fill/scan/restore, row-conflict search and access-pair timers.
//!
//! - [`timing`] - The [`timing::TimingSource`] capability (cycle counter, fences,
//!   cache-line eviction) and REFRESH synchronization built on it.
//!
//! - [`hammerer::Hammering`] - The interface every hammering implementation
//!   provides, with the shared burst outcome types.
//!
//! - [`util`] module - Constants, [`util::Size`], progress styles and seeded RNGs.
//!
//! ## Platform Support
//!
//! Linux on x86_64 or aarch64. Mapping huge pages requires them to be reserved
//! by the administrator.

#![warn(missing_docs)]

pub mod hammerer;
pub mod memory;
pub mod timing;
pub mod util;

pub use hammerer::{BurstStats, HammerError, Hammering, InterruptFlag};
