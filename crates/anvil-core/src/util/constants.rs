/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Row shift value (13 bits) for 8KB rows
pub const ROW_SHIFT: usize = 13;
/// Standard DRAM row size (8192 bytes)
pub const ROW_SIZE: usize = 1 << ROW_SHIFT;

/// Cache line size (64 bytes)
pub const CL_SIZE: usize = 64;

/// Number of access rounds per latency measurement
pub const TIMER_ROUNDS: usize = 1_000;

/// Default base address of the hammering region.
///
/// Aligned to 1 GiB so that the bits above the addressing matrix stay constant
/// over the whole region.
pub const DEFAULT_BASE_ADDR: usize = 0x2000000000;

/// Latency in cycles above which an access pair is taken to have hit a REFRESH.
pub const REFRESH_SPIKE_CYCLES: u64 = 1000;

/// Duration of one refresh interval (tREFI) in microseconds
pub const REF_INTERVAL_US: f64 = 7.8;

/// Default row-conflict threshold in cycles
pub const DEFAULT_CONFLICT_THRESHOLD: u64 = 430;
