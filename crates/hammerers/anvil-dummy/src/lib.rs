//! Dummy hammerer for testing.
//!
//! This crate provides a simple hammerer implementation that flips bits at specified
//! addresses without performing actual Rowhammer attacks. Useful for testing the
//! fuzzing engine end to end.
//!
//! Implements the [`anvil_core::hammerer::Hammering`] trait.
//!
//! # Use Cases
//!
//! - Integration testing of the fuzzing engine
//! - Simulating bit flips and interrupted bursts without hardware access

#![warn(missing_docs)]

mod dummy;

pub use dummy::{Dummy, FlipAddr};
