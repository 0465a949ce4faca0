use anvil_core::hammerer::{BurstStats, HammerError, Hammering, InterruptFlag};
use anvil_core::memory::AggressorPtr;
use anvil_core::timing::{RefreshSync, TimingSource};
use itertools::Itertools;
use log::{debug, trace, warn};
use std::time::Instant;

/// Everything one burst needs, resolved to pointers.
#[derive(Debug, Clone)]
pub struct HammerJob {
    /// Exported pattern schedule, repeated until `total_activations`
    pub aggressors: Vec<AggressorPtr>,
    /// Accesses between two REFRESH alignments
    pub acts_per_ref: usize,
    /// Accesses of the whole burst
    pub total_activations: usize,
    /// Same-bank pair sampled to detect REFRESH
    pub sync_rows: [AggressorPtr; 2],
    /// Rows accessed while waiting for the burst to start
    pub random_rows: Vec<AggressorPtr>,
    /// Duration of the random accesses
    pub wait_until_start_us: u128,
}

impl HammerJob {
    /// Creates a job that synchronizes on the first two distinct aggressors
    /// of the schedule.
    pub fn new(
        aggressors: Vec<AggressorPtr>,
        acts_per_ref: usize,
        total_activations: usize,
        random_rows: Vec<AggressorPtr>,
        wait_until_start_us: u128,
    ) -> Self {
        let mut distinct = aggressors.iter().copied().unique();
        let first = distinct.next().unwrap_or(std::ptr::null());
        let second = distinct.next().unwrap_or(first);
        HammerJob {
            aggressors,
            acts_per_ref,
            total_activations,
            sync_rows: [first, second],
            random_rows,
            wait_until_start_us,
        }
    }
}

/// Hammers a pattern in step with REFRESH.
///
/// The burst starts right after a REFRESH and re-aligns after every
/// `acts_per_ref` accesses, so the same part of the pattern always lands at
/// the same position of a refresh interval.
pub struct SyncHammerer<T: TimingSource> {
    job: HammerJob,
    timing: T,
    sync: RefreshSync,
    interrupt: InterruptFlag,
}

impl<T: TimingSource> SyncHammerer<T> {
    /// Creates a hammerer for `job`.
    pub fn new(job: HammerJob, timing: T, sync: RefreshSync, interrupt: InterruptFlag) -> Self {
        SyncHammerer {
            job,
            timing,
            sync,
            interrupt,
        }
    }

    fn do_random_accesses(&self) {
        if self.job.random_rows.is_empty() || self.job.wait_until_start_us == 0 {
            return;
        }
        trace!(
            "random accesses to {} rows for {} us",
            self.job.random_rows.len(),
            self.job.wait_until_start_us
        );
        let start = Instant::now();
        let mut _x = 0;
        while start.elapsed().as_micros() < self.job.wait_until_start_us {
            for &row in &self.job.random_rows {
                _x = std::hint::black_box(unsafe { std::ptr::read_volatile(row) });
            }
        }
    }
}

impl<T: TimingSource> Hammering for SyncHammerer<T> {
    type Error = HammerError;

    fn hammer(&self) -> Result<BurstStats, Self::Error> {
        let job = &self.job;
        if job.aggressors.is_empty() || job.total_activations == 0 {
            warn!("empty burst, nothing to hammer");
            return Ok(BurstStats::default());
        }
        let acts_per_ref = job.acts_per_ref.max(1);
        let scheduled = job.total_activations;
        let [a, b] = job.sync_rows;

        self.do_random_accesses();
        let samples = unsafe { self.sync.sync(&self.timing, a, b)? };
        trace!("initial REFRESH alignment after {} samples", samples);
        if self.interrupt.is_raised() {
            return Err(HammerError::InterruptedBurst {
                completed: 0,
                scheduled,
            });
        }

        let start = self.timing.now();
        let mut refresh_syncs = 1;
        let mut issued = 0;
        for &agg in job.aggressors.iter().cycle() {
            unsafe {
                std::ptr::read_volatile(agg);
                self.timing.evict(agg);
            }
            issued += 1;
            if issued == scheduled {
                break;
            }
            if issued % acts_per_ref == 0 {
                self.timing.fence_full();
                let interrupted = HammerError::InterruptedBurst {
                    completed: issued,
                    scheduled,
                };
                if self.interrupt.is_raised() {
                    return Err(interrupted);
                }
                if let Err(e) = unsafe { self.sync.sync(&self.timing, a, b) } {
                    debug!("lost REFRESH alignment: {}", e);
                    return Err(interrupted);
                }
                refresh_syncs += 1;
            }
        }
        self.timing.fence_full();
        let ticks = self.timing.now().saturating_sub(start);
        debug!(
            "burst done: {} activations, {} REFRESH alignments, {} ticks",
            issued, refresh_syncs, ticks
        );
        Ok(BurstStats {
            activations: issued,
            refresh_syncs,
            ticks,
        })
    }
}
