//! Rowhammer hammering traits.
//!
//! This module defines the [`Hammering`] trait that all hammering implementations implement
//! to perform memory access patterns that induce bit flips through the Rowhammer effect,
//! together with the burst outcome types shared by all of them.

use crate::timing::SyncError;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Trait for implementing Rowhammer hammering techniques.
///
/// Implementors of this trait define different strategies for performing memory
/// hammering operations that attempt to induce bit flips in adjacent DRAM rows.
/// The hammering pattern, timing, and access strategy are implementation-specific.
///
/// # Associated Types
///
/// * `Error` - The error type returned by hammering operations. It must convert
///   into [`HammerError`] so the fuzzer can tell an unsynchronized probe from an
///   interrupted one.
///
/// # Examples
///
/// See `anvil-blacksmith` for the REFRESH-synchronized hammerer and
/// `anvil-dummy` for a deterministic test double.
pub trait Hammering {
    /// The error type returned by hammering operations.
    type Error: std::error::Error + Into<HammerError>;

    /// Performs one hammering burst.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The burst could not be aligned to REFRESH
    /// * The burst stopped before all scheduled activations were issued
    fn hammer(&self) -> Result<BurstStats, Self::Error>;
}

/// Summary of a completed burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BurstStats {
    /// Row activations issued
    pub activations: usize,
    /// REFRESH alignments performed, including the initial one
    pub refresh_syncs: usize,
    /// Elapsed timer ticks of the hammering phase
    pub ticks: u64,
}

/// Why a burst produced no usable result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HammerError {
    /// The burst never started because REFRESH could not be located
    #[error(transparent)]
    Synchronization(#[from] SyncError),
    /// The burst started but stopped early; its outcome is unverified
    #[error("burst interrupted after {completed} of {scheduled} activations")]
    InterruptedBurst {
        /// Activations issued before the interruption
        completed: usize,
        /// Activations the burst was scheduled to issue
        scheduled: usize,
    },
}

/// Flag through which an external collaborator (e.g. a signal handler)
/// asks a running burst to stop.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Creates a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the running burst to stop.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Lowers the flag before the next burst.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
