use super::TimingSource;
use std::arch::asm;

/// Generic-timer based timing with `dc civac` eviction.
///
/// `cntvct_el0` ticks much slower than the core clock, so thresholds
/// calibrated on x86 do not carry over.
#[derive(Debug, Default, Clone, Copy)]
pub struct Arm64Timing;

impl TimingSource for Arm64Timing {
    #[inline(always)]
    fn now(&self) -> u64 {
        let ticks: u64;
        unsafe {
            asm!(
                "isb",
                "mrs {ticks}, cntvct_el0",
                ticks = out(reg) ticks,
                options(nostack),
            );
        }
        ticks
    }

    #[inline(always)]
    fn fence_load(&self) {
        unsafe { asm!("dmb ishld", options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    fn fence_store(&self) {
        unsafe { asm!("dmb ishst", options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    fn fence_full(&self) {
        unsafe { asm!("dsb sy", "isb", options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    unsafe fn evict(&self, addr: *const u8) {
        unsafe { asm!("dc civac, {addr}", addr = in(reg) addr, options(nostack, preserves_flags)) }
    }
}
