use super::TimingSource;
use crate::util::REFRESH_SPIKE_CYCLES;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::ptr::read_volatile;
use thiserror::Error;

/// Errors raised while aligning to REFRESH.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No REFRESH spike was observed within the sampling bound
    #[error("no REFRESH observed within {attempts} access samples")]
    SynchronizationTimeout {
        /// Number of samples taken
        attempts: usize,
    },
}

/// Aligns execution to the next REFRESH command.
///
/// A REFRESH stalls the bank for a few hundred nanoseconds, which shows up as
/// an outlier in the latency of an otherwise fast access pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSync {
    /// Latency in timer ticks that marks a REFRESH
    pub spike_threshold: u64,
    /// Number of samples before giving up
    pub max_attempts: usize,
}

impl Default for RefreshSync {
    fn default() -> Self {
        RefreshSync {
            spike_threshold: REFRESH_SPIKE_CYCLES,
            max_attempts: 100_000,
        }
    }
}

impl RefreshSync {
    /// Samples the access latency of `a` and `b` until it exceeds the spike
    /// threshold and returns the number of samples it took.
    ///
    /// Returns right after the spike, so the caller's next access falls at the
    /// start of a refresh interval.
    ///
    /// # Safety
    ///
    /// `a` and `b` must be valid for reads.
    pub unsafe fn sync<T: TimingSource + ?Sized>(
        &self,
        timing: &T,
        a: *const u8,
        b: *const u8,
    ) -> Result<usize, SyncError> {
        for attempt in 1..=self.max_attempts {
            let latency = unsafe { sample_pair(timing, a, b) };
            if latency > self.spike_threshold {
                trace!("REFRESH after {} samples ({} ticks)", attempt, latency);
                return Ok(attempt);
            }
        }
        Err(SyncError::SynchronizationTimeout {
            attempts: self.max_attempts,
        })
    }
}

/// Parameters for [`count_acts_per_ref`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActCountConfig {
    /// Latency in timer ticks that marks a REFRESH
    pub spike_threshold: u64,
    /// Refresh intervals to discard while the measurement settles
    pub skip: usize,
    /// Evaluate the spread every this many intervals
    pub check_every: usize,
    /// Stop once the standard deviation drops below this
    pub max_std_dev: f64,
    /// Upper bound on access samples
    pub max_samples: usize,
}

impl Default for ActCountConfig {
    fn default() -> Self {
        ActCountConfig {
            spike_threshold: REFRESH_SPIKE_CYCLES,
            skip: 50,
            check_every: 200,
            max_std_dev: 3.0,
            max_samples: 10_000_000,
        }
    }
}

/// Estimates how many row activations fit into one refresh interval.
///
/// Counts the access pairs between consecutive REFRESH spikes; every pair
/// activates two rows. The mean is returned, rounded down to an even number,
/// once the values have converged.
///
/// # Safety
///
/// `a` and `b` must be valid for reads and should map to the same bank but
/// different rows.
pub unsafe fn count_acts_per_ref<T: TimingSource + ?Sized>(
    timing: &T,
    a: *const u8,
    b: *const u8,
    config: &ActCountConfig,
) -> Result<usize, SyncError> {
    let mut values: Vec<usize> = Vec::new();
    let mut intervals = 0;
    let mut since_spike: Option<usize> = None;

    for _ in 0..config.max_samples {
        let latency = unsafe { sample_pair(timing, a, b) };
        if let Some(n) = since_spike.as_mut() {
            *n += 1;
        }
        if latency <= config.spike_threshold {
            continue;
        }
        if let Some(pairs) = since_spike {
            intervals += 1;
            if intervals > config.skip {
                values.push(pairs * 2);
                if values.len() % config.check_every.max(1) == 0 {
                    let (mean, std_dev) = mean_std_dev(&values);
                    debug!(
                        "acts per REF over {} intervals: mean {:.1}, std dev {:.2}",
                        values.len(),
                        mean,
                        std_dev
                    );
                    if std_dev < config.max_std_dev {
                        return Ok((mean as usize) & !1);
                    }
                }
            }
        }
        since_spike = Some(0);
    }
    Err(SyncError::SynchronizationTimeout {
        attempts: config.max_samples,
    })
}

unsafe fn sample_pair<T: TimingSource + ?Sized>(timing: &T, a: *const u8, b: *const u8) -> u64 {
    unsafe {
        timing.evict(a);
        timing.evict(b);
    }
    timing.fence_full();
    let before = timing.now();
    timing.fence_load();
    unsafe {
        read_volatile(a);
        read_volatile(b);
    }
    let after = timing.now();
    after.saturating_sub(before)
}

fn mean_std_dev(values: &[usize]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<usize>() as f64 / n;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::mock::ScriptedTiming;

    fn refresh_every(n: usize, periods: usize) -> Vec<u64> {
        (0..periods)
            .flat_map(|_| std::iter::repeat_n(120, n - 1).chain([1800]))
            .collect()
    }

    #[test]
    fn test_sync_returns_after_spike() {
        let timing = ScriptedTiming::new([100, 110, 95, 2400, 100], 100);
        let data = [0u8; 128];
        let sync = RefreshSync::default();
        let samples = unsafe { sync.sync(&timing, data.as_ptr(), data[64..].as_ptr()) };
        assert_eq!(samples, Ok(4));
    }

    #[test]
    fn test_sync_times_out() {
        let timing = ScriptedTiming::new([], 100);
        let data = [0u8; 128];
        let sync = RefreshSync {
            max_attempts: 500,
            ..Default::default()
        };
        let res = unsafe { sync.sync(&timing, data.as_ptr(), data[64..].as_ptr()) };
        assert_eq!(res, Err(SyncError::SynchronizationTimeout { attempts: 500 }));
    }

    #[test]
    fn test_count_acts_per_ref() {
        let timing = ScriptedTiming::new(refresh_every(38, 20), 120);
        let data = [0u8; 128];
        let config = ActCountConfig {
            skip: 2,
            check_every: 5,
            ..Default::default()
        };
        let acts = unsafe { count_acts_per_ref(&timing, data.as_ptr(), data[64..].as_ptr(), &config) };
        assert_eq!(acts, Ok(76));
    }

    #[test]
    fn test_count_acts_per_ref_bounded() {
        let timing = ScriptedTiming::new([], 120);
        let data = [0u8; 128];
        let config = ActCountConfig {
            max_samples: 1000,
            ..Default::default()
        };
        let acts = unsafe { count_acts_per_ref(&timing, data.as_ptr(), data[64..].as_ptr(), &config) };
        assert_eq!(
            acts,
            Err(SyncError::SynchronizationTimeout { attempts: 1000 })
        );
    }
}
