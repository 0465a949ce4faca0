//! # Anvil
//!
//! Frequency-based Rowhammer fuzzing. This crate re-exports the workspace
//! crates so that users depend on a single crate:
//!
//! - [`anvil_core`] as the crate root: addressing, timing, the hammering region
//!   and the [`hammerer::Hammering`] trait
//! - `blacksmith` (feature `blacksmith`, default): patterns, the fuzzing
//!   engine and replay
//! - `dummy` (feature `dummy`): a deterministic hammerer for tests

pub use anvil_core::*;

#[cfg(feature = "blacksmith")]
pub use anvil_blacksmith as blacksmith;

#[cfg(feature = "dummy")]
pub use anvil_dummy as dummy;
