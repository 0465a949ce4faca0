use crate::timing::{NativeTiming, TimingSource, measure_access_latency};
use thiserror::Error;

/// Measures the latency of two subsequent DRAM accesses.
///
/// This is the seam for row-conflict classification; tests substitute a
/// mock that derives latencies from a known geometry.
pub trait MemoryTupleTimer {
    /// Accesses `a` and `b` back to back from DRAM and returns the median
    /// latency over `rounds` repetitions.
    ///
    /// # Safety
    ///
    /// `a` and `b` must be valid for reads.
    unsafe fn time_subsequent_access_from_ram(
        &self,
        a: *const u8,
        b: *const u8,
        rounds: usize,
    ) -> u64;
}

/// Errors raised by [`construct_memory_tuple_timer`].
#[derive(Debug, Error)]
pub enum TimerError {
    /// The target has no cycle counter or cache flush usable from user space
    #[error("no native access timer for this architecture")]
    UnsupportedArchitecture,
}

/// [`MemoryTupleTimer`] backed by a [`TimingSource`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyTimer<T: TimingSource> {
    timing: T,
}

impl<T: TimingSource> LatencyTimer<T> {
    /// Wraps a timing source.
    pub fn new(timing: T) -> Self {
        LatencyTimer { timing }
    }
}

impl<T: TimingSource> MemoryTupleTimer for LatencyTimer<T> {
    unsafe fn time_subsequent_access_from_ram(
        &self,
        a: *const u8,
        b: *const u8,
        rounds: usize,
    ) -> u64 {
        unsafe { measure_access_latency(&self.timing, a, b, rounds) }
    }
}

/// Creates the access timer for the current target.
pub fn construct_memory_tuple_timer() -> Result<Box<dyn MemoryTupleTimer>, TimerError> {
    let timing = NativeTiming::default();
    if !timing.can_evict() {
        return Err(TimerError::UnsupportedArchitecture);
    }
    Ok(Box::new(LatencyTimer::new(timing)))
}
