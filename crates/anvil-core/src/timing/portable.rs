use super::TimingSource;
use std::sync::atomic::{Ordering, fence};
use std::time::Instant;

/// Fallback for targets without native timing instructions.
///
/// Counts nanoseconds instead of cycles and cannot evict cache lines, so it is
/// good for filling and scanning memory but not for hammering.
#[derive(Debug, Clone, Copy)]
pub struct PortableTiming {
    epoch: Instant,
}

impl Default for PortableTiming {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl TimingSource for PortableTiming {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn fence_load(&self) {
        fence(Ordering::Acquire);
    }

    fn fence_store(&self) {
        fence(Ordering::Release);
    }

    fn fence_full(&self) {
        fence(Ordering::SeqCst);
    }

    unsafe fn evict(&self, _addr: *const u8) {}

    fn can_evict(&self) -> bool {
        false
    }
}
