use super::{AggressorPtr, BytePointer, HammerRegion, MemoryTupleTimer};
use crate::util::{DEFAULT_CONFLICT_THRESHOLD, PAGE_SIZE, TIMER_ROUNDS};
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the row-conflict search.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// No candidate exceeded the threshold
    #[error("no address conflicting with {target:#x} among {candidates} candidates")]
    NoConflictFound {
        /// Target address
        target: usize,
        /// Number of candidates measured
        candidates: usize,
    },
    /// Threshold calibration needs at least two banks to separate
    #[error("cannot calibrate a conflict threshold with {0} bank(s)")]
    TooFewBanks(usize),
}

/// Parameters of the row-conflict side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSearch {
    /// Latency above which an access pair counts as a row conflict
    pub threshold: u64,
    /// Candidates to try before giving up
    pub max_candidates: usize,
    /// Access rounds per latency measurement
    pub rounds: usize,
}

impl Default for ConflictSearch {
    fn default() -> Self {
        ConflictSearch {
            threshold: DEFAULT_CONFLICT_THRESHOLD,
            max_candidates: 4096,
            rounds: TIMER_ROUNDS,
        }
    }
}

impl HammerRegion {
    /// Finds an address in this region that maps to the same bank as
    /// `target` but to a different row.
    ///
    /// A candidate qualifies when two consecutive measurements both exceed
    /// the threshold, which filters out one-off interrupts.
    pub fn find_conflicting_address<R: Rng + ?Sized>(
        &self,
        target: AggressorPtr,
        timer: &dyn MemoryTupleTimer,
        search: &ConflictSearch,
        rng: &mut R,
    ) -> Result<AggressorPtr, ConflictError> {
        let pages = self.len() / PAGE_SIZE;
        // page of the target inside the region, excluded from the draw
        let target_page = self
            .contains(target)
            .then(|| (target as usize - self.ptr() as usize) / PAGE_SIZE);
        let choices = pages - usize::from(target_page.is_some());
        if choices == 0 {
            return Err(ConflictError::NoConflictFound {
                target: target as usize,
                candidates: 0,
            });
        }
        let mut candidates = 0;
        while candidates < search.max_candidates {
            let mut page = rng.random_range(0..choices);
            if target_page.is_some_and(|t| page >= t) {
                page += 1;
            }
            let candidate = self.addr(page * PAGE_SIZE) as AggressorPtr;
            candidates += 1;
            let conflicts = (0..2).all(|_| {
                let latency = unsafe {
                    timer.time_subsequent_access_from_ram(target, candidate, search.rounds)
                };
                latency > search.threshold
            });
            if conflicts {
                debug!(
                    "{:p} conflicts with {:p} after {} candidates",
                    candidate, target, candidates
                );
                return Ok(candidate);
            }
        }
        Err(ConflictError::NoConflictFound {
            target: target as usize,
            candidates,
        })
    }

    /// Picks a conflict threshold from random access pairs.
    ///
    /// About one in `num_banks` random pairs hits the same bank, so the
    /// threshold is placed where that share of the samples lies above it.
    pub fn calibrate_conflict_threshold<R: Rng + ?Sized>(
        &self,
        timer: &dyn MemoryTupleTimer,
        num_banks: usize,
        samples: usize,
        rounds: usize,
        rng: &mut R,
    ) -> Result<u64, ConflictError> {
        if num_banks < 2 {
            return Err(ConflictError::TooFewBanks(num_banks));
        }
        let pages = self.len() / PAGE_SIZE;
        let mut latencies: Vec<u64> = (0..samples.max(2))
            .map(|_| {
                let a = self.addr(rng.random_range(0..pages) * PAGE_SIZE);
                let b = self.addr(rng.random_range(0..pages) * PAGE_SIZE);
                unsafe { timer.time_subsequent_access_from_ram(a, b, rounds) }
            })
            .collect();
        latencies.sort_unstable();
        let above = (latencies.len() / num_banks).max(1);
        let split = latencies.len() - above;
        let threshold = (latencies[split - 1] + latencies[split]) / 2;
        info!(
            "conflict threshold {} (fast median {}, slowest {})",
            threshold,
            latencies[split / 2],
            latencies[latencies.len() - 1]
        );
        Ok(threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mem_configuration::xor_geometry;
    use crate::memory::{DataPattern, MemConfiguration, RegionConfig};
    use crate::util::Size;
    use rand::{SeedableRng, rngs::StdRng};

    struct GeometryTimer(MemConfiguration);

    impl MemoryTupleTimer for GeometryTimer {
        unsafe fn time_subsequent_access_from_ram(
            &self,
            a: *const u8,
            b: *const u8,
            _rounds: usize,
        ) -> u64 {
            let a = self.0.decode(a as usize);
            let b = self.0.decode(b as usize);
            if a.same_bank(&b) && a.row != b.row {
                520
            } else {
                240
            }
        }
    }

    fn region(slot: usize) -> HammerRegion {
        HammerRegion::initialize(&RegionConfig {
            base_addr: 0x3800000000 + (slot << 30),
            size: Size::MB(4),
            use_huge_pages: false,
            hugetlbfs_path: None,
            fill: DataPattern::Zero,
        })
        .expect("mapping a small region")
    }

    #[test]
    fn test_finds_same_bank_different_row() -> anyhow::Result<()> {
        let cfg = xor_geometry();
        let region = region(0);
        let mut rng = StdRng::seed_from_u64(42);
        let target = region.addr(0x1000);
        let found = region.find_conflicting_address(
            target,
            &GeometryTimer(cfg),
            &ConflictSearch::default(),
            &mut rng,
        )?;
        let (t, f) = (cfg.decode(target as usize), cfg.decode(found as usize));
        assert!(t.same_bank(&f));
        assert_ne!(t.row, f.row);
        Ok(())
    }

    #[test]
    fn test_no_conflict_found() {
        struct Flat;
        impl MemoryTupleTimer for Flat {
            unsafe fn time_subsequent_access_from_ram(&self, _: *const u8, _: *const u8, _: usize) -> u64 {
                200
            }
        }
        let region = region(1);
        let mut rng = StdRng::seed_from_u64(1);
        let search = ConflictSearch {
            max_candidates: 64,
            ..Default::default()
        };
        let res = region.find_conflicting_address(region.addr(0), &Flat, &search, &mut rng);
        assert_eq!(
            res,
            Err(ConflictError::NoConflictFound {
                target: region.ptr() as usize,
                candidates: 64
            })
        );
    }

    #[test]
    fn test_calibrated_threshold_separates_conflicts() {
        let cfg = xor_geometry();
        let region = region(2);
        let mut rng = StdRng::seed_from_u64(3);
        let threshold = region
            .calibrate_conflict_threshold(&GeometryTimer(cfg), cfg.get_bank_count(), 4096, 1, &mut rng)
            .expect("enough banks");
        assert!((240..=520).contains(&threshold), "threshold {}", threshold);
    }

    #[test]
    fn test_calibration_needs_two_banks() {
        let region = region(3);
        let mut rng = StdRng::seed_from_u64(5);
        for banks in [0, 1] {
            assert_eq!(
                region.calibrate_conflict_threshold(&GeometryTimer(xor_geometry()), banks, 64, 1, &mut rng),
                Err(ConflictError::TooFewBanks(banks))
            );
        }
    }

    #[test]
    fn test_single_page_region_gives_up() {
        let region = HammerRegion::initialize(&RegionConfig {
            base_addr: 0x3800000000 + (4 << 30),
            size: Size::KB(4),
            use_huge_pages: false,
            hugetlbfs_path: None,
            fill: DataPattern::Zero,
        })
        .expect("mapping one page");
        let mut rng = StdRng::seed_from_u64(9);
        let search = ConflictSearch {
            max_candidates: 16,
            ..Default::default()
        };
        let res = region.find_conflicting_address(
            region.addr(0x80),
            &GeometryTimer(xor_geometry()),
            &search,
            &mut rng,
        );
        assert_eq!(
            res,
            Err(ConflictError::NoConflictFound {
                target: region.ptr() as usize + 0x80,
                candidates: 0
            })
        );
    }

    #[test]
    fn test_never_measures_target_page() {
        struct SamePageCheck(usize);
        impl MemoryTupleTimer for SamePageCheck {
            unsafe fn time_subsequent_access_from_ram(&self, a: *const u8, b: *const u8, _: usize) -> u64 {
                assert_ne!(a as usize / PAGE_SIZE, b as usize / PAGE_SIZE);
                assert_eq!(a as usize, self.0);
                200
            }
        }
        // two pages: every draw must land on the other one
        let region = HammerRegion::initialize(&RegionConfig {
            base_addr: 0x3800000000 + (5 << 30),
            size: Size::KB(8),
            use_huge_pages: false,
            hugetlbfs_path: None,
            fill: DataPattern::Zero,
        })
        .expect("mapping two pages");
        let target = region.addr(PAGE_SIZE + 8);
        let mut rng = StdRng::seed_from_u64(11);
        let search = ConflictSearch {
            max_candidates: 32,
            ..Default::default()
        };
        let res = region.find_conflicting_address(target, &SamePageCheck(target as usize), &search, &mut rng);
        assert!(matches!(res, Err(ConflictError::NoConflictFound { candidates: 32, .. })));
    }
}
