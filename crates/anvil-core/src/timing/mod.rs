//! Architecture-neutral timing and cache-control primitives.
//!
//! Everything timing-sensitive in the fuzzer goes through [`TimingSource`], so
//! the engine itself never names an instruction. [`NativeTiming`] resolves to
//! the implementation for the compilation target.

#[cfg(target_arch = "aarch64")]
mod aarch64;
mod portable;
mod refresh;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use self::aarch64::Arm64Timing;
pub use self::portable::PortableTiming;
pub use self::refresh::{ActCountConfig, RefreshSync, SyncError, count_acts_per_ref};
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86Timing;

use crate::util::median;

/// Timing source used on the current target.
#[cfg(target_arch = "x86_64")]
pub type NativeTiming = X86Timing;
/// Timing source used on the current target.
#[cfg(target_arch = "aarch64")]
pub type NativeTiming = Arm64Timing;
/// Timing source used on the current target.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type NativeTiming = PortableTiming;

/// Cycle counter, memory fences and cache-line eviction.
pub trait TimingSource {
    /// Reads a monotonic cycle counter.
    fn now(&self) -> u64;

    /// Orders all earlier loads before later instructions.
    fn fence_load(&self);

    /// Orders all earlier stores before later stores.
    fn fence_store(&self);

    /// Orders all earlier memory operations before later ones.
    fn fence_full(&self);

    /// Evicts the cache line holding `addr` from all cache levels.
    ///
    /// # Safety
    ///
    /// `addr` must point into mapped memory.
    unsafe fn evict(&self, addr: *const u8);

    /// Whether [`evict`](TimingSource::evict) actually reaches DRAM.
    fn can_evict(&self) -> bool {
        true
    }
}

impl<T: TimingSource + ?Sized> TimingSource for &T {
    fn now(&self) -> u64 {
        (**self).now()
    }
    fn fence_load(&self) {
        (**self).fence_load()
    }
    fn fence_store(&self) {
        (**self).fence_store()
    }
    fn fence_full(&self) {
        (**self).fence_full()
    }
    unsafe fn evict(&self, addr: *const u8) {
        unsafe { (**self).evict(addr) }
    }
    fn can_evict(&self) -> bool {
        (**self).can_evict()
    }
}

/// Measures the latency of accessing `a` and `b` back to back from DRAM.
///
/// Both lines are evicted before every round; the median over `rounds` is
/// returned.
///
/// # Safety
///
/// `a` and `b` must be valid for reads.
pub unsafe fn measure_access_latency<T: TimingSource + ?Sized>(
    timing: &T,
    a: *const u8,
    b: *const u8,
    rounds: usize,
) -> u64 {
    let mut measurements = Vec::with_capacity(rounds);
    for _ in 0..rounds {
        unsafe {
            timing.evict(a);
            timing.evict(b);
        }
        timing.fence_full();
        let before = timing.now();
        timing.fence_load();
        unsafe {
            std::ptr::read_volatile(a);
            std::ptr::read_volatile(b);
        }
        timing.fence_load();
        let after = timing.now();
        measurements.push(after.saturating_sub(before));
    }
    median(measurements)
}

#[cfg(test)]
pub(crate) mod mock {
    use super::TimingSource;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    /// Replays a scripted sequence of access latencies.
    ///
    /// Each call pair of `now()` yields one latency: the first call returns the
    /// running clock, the second advances it by the next scripted value.
    pub struct ScriptedTiming {
        clock: Cell<u64>,
        odd: Cell<bool>,
        script: RefCell<VecDeque<u64>>,
        fallback: u64,
        pub evictions: Cell<usize>,
    }

    impl ScriptedTiming {
        pub fn new(script: impl IntoIterator<Item = u64>, fallback: u64) -> Self {
            Self {
                clock: Cell::new(0),
                odd: Cell::new(false),
                script: RefCell::new(script.into_iter().collect()),
                fallback,
                evictions: Cell::new(0),
            }
        }
    }

    impl TimingSource for ScriptedTiming {
        fn now(&self) -> u64 {
            if self.odd.get() {
                let latency = self.script.borrow_mut().pop_front().unwrap_or(self.fallback);
                self.clock.set(self.clock.get() + latency);
            }
            self.odd.set(!self.odd.get());
            self.clock.get()
        }
        fn fence_load(&self) {}
        fn fence_store(&self) {}
        fn fence_full(&self) {}
        unsafe fn evict(&self, _addr: *const u8) {
            self.evictions.set(self.evictions.get() + 1);
        }
    }
}
