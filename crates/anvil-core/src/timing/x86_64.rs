use super::TimingSource;
use std::arch::x86_64::{__rdtscp, _mm_clflush, _mm_lfence, _mm_mfence, _mm_sfence};

/// `rdtscp` timing with `clflush` eviction.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Timing;

impl TimingSource for X86Timing {
    #[inline(always)]
    fn now(&self) -> u64 {
        let mut aux = 0;
        unsafe { __rdtscp(&mut aux) }
    }

    #[inline(always)]
    fn fence_load(&self) {
        unsafe { _mm_lfence() }
    }

    #[inline(always)]
    fn fence_store(&self) {
        unsafe { _mm_sfence() }
    }

    #[inline(always)]
    fn fence_full(&self) {
        unsafe { _mm_mfence() }
    }

    #[inline(always)]
    unsafe fn evict(&self, addr: *const u8) {
        unsafe { _mm_clflush(addr) }
    }
}
