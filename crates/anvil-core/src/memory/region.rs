use super::{BitFlip, BytePointer, DataPattern};
use crate::timing::{NativeTiming, TimingSource};
use crate::util::{CL_SIZE, DEFAULT_BASE_ADDR, PAGE_SIZE, Size};
use lazy_static::lazy_static;
use libc::{
    MAP_ANONYMOUS, MAP_FIXED_NOREPLACE, MAP_HUGE_SHIFT, MAP_HUGETLB, MAP_POPULATE, MAP_PRIVATE,
    MAP_SHARED, PROT_READ, PROT_WRITE, c_void,
};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use thiserror::Error;

// https://www.kernel.org/doc/Documentation/vm/hugetlbpage.txt
//
// The output of "cat /proc/meminfo" includes a line like
// Hugepagesize:    yyy kB
const MEMINFO_PATH: &str = "/proc/meminfo";
const TOKEN: &str = "Hugepagesize:";

lazy_static! {
    static ref HUGEPAGE_SIZE: Option<usize> = {
        let mut buf = String::new();
        if let Err(e) = File::open(MEMINFO_PATH).and_then(|mut f| f.read_to_string(&mut buf)) {
            warn!("reading {} failed: {}", MEMINFO_PATH, e);
            return None;
        }
        parse_hugepage_size(&buf)
    };
}

fn parse_hugepage_size(s: &str) -> Option<usize> {
    let line = s.lines().find_map(|line| line.strip_prefix(TOKEN))?;
    let mut parts = line.split_whitespace();
    let size = parts.next()?.parse::<usize>().ok()?;
    let unit = match parts.next() {
        Some("kB") => 1024,
        _ => 1,
    };
    Some(size * unit).filter(|&s| s > 0)
}

/// Errors raised by the memory manager.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The region could not be mapped at the requested address
    #[error("allocation of {size:#x} bytes at {base:#x} failed: {source}")]
    AllocationFailed {
        /// Requested base address
        base: usize,
        /// Requested size
        size: usize,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
    /// Size or base address do not match the page granularity
    #[error("region base {base:#x} and size {size:#x} must be non-zero multiples of {granularity:#x}")]
    InvalidSize {
        /// Requested base address
        base: usize,
        /// Requested size
        size: usize,
        /// Required alignment
        granularity: usize,
    },
}

/// Parameters of a [`HammerRegion`].
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Fixed virtual base address
    pub base_addr: usize,
    /// Region size
    pub size: Size,
    /// Back the region with huge pages
    pub use_huge_pages: bool,
    /// Map a file on hugetlbfs instead of anonymous huge pages
    pub hugetlbfs_path: Option<PathBuf>,
    /// Initial contents
    pub fill: DataPattern,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            base_addr: DEFAULT_BASE_ADDR,
            size: Size::GB(1),
            use_huge_pages: true,
            hugetlbfs_path: None,
            fill: DataPattern::random(),
        }
    }
}

/// The memory region hammered and scanned by the fuzzer.
///
/// Mapped at a fixed address so that the bits above the addressing matrix are
/// known, filled with a [`DataPattern`] on initialization and unmapped on
/// [`teardown`](HammerRegion::teardown) or drop.
#[derive(Debug)]
pub struct HammerRegion {
    ptr: *mut u8,
    len: usize,
    fill: DataPattern,
    mapped: bool,
    backing_file: Option<PathBuf>,
}

unsafe impl Send for HammerRegion {}

impl HammerRegion {
    /// Maps and fills a region.
    pub fn initialize(config: &RegionConfig) -> Result<Self, MemoryError> {
        let base = config.base_addr;
        let size = config.size.bytes();
        let granularity = if config.use_huge_pages {
            HUGEPAGE_SIZE.ok_or_else(|| MemoryError::AllocationFailed {
                base,
                size,
                source: std::io::Error::new(
                    ErrorKind::Unsupported,
                    "no huge page size reported in /proc/meminfo",
                ),
            })?
        } else {
            PAGE_SIZE
        };
        if size == 0 || size % granularity != 0 || base % granularity != 0 {
            return Err(MemoryError::InvalidSize {
                base,
                size,
                granularity,
            });
        }

        let ptr = match (&config.hugetlbfs_path, config.use_huge_pages) {
            (Some(path), true) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .mode(0o666)
                    .open(path)
                    .map_err(|source| MemoryError::AllocationFailed { base, size, source })?;
                map_fixed(base, size, MAP_SHARED | MAP_POPULATE, file.as_raw_fd())?
            }
            (None, true) => {
                let huge_flags =
                    MAP_HUGETLB | ((granularity.trailing_zeros() as i32) << MAP_HUGE_SHIFT);
                map_fixed(
                    base,
                    size,
                    MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE | huge_flags,
                    -1,
                )?
            }
            (_, false) => map_fixed(base, size, MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE, -1)?,
        };
        info!(
            "mapped {} at {:p} (huge pages: {})",
            config.size, ptr, config.use_huge_pages
        );

        let region = HammerRegion {
            ptr,
            len: size,
            fill: config.fill.clone(),
            mapped: true,
            backing_file: config
                .hugetlbfs_path
                .clone()
                .filter(|_| config.use_huge_pages),
        };
        region.fill(&config.fill);
        Ok(region)
    }

    /// The pattern written on initialization.
    pub fn fill_pattern(&self) -> &DataPattern {
        &self.fill
    }

    /// Writes `pattern` to the whole region and flushes it to DRAM.
    pub fn fill(&self, pattern: &DataPattern) {
        debug!("fill {} bytes with {:?}", self.len, pattern);
        let timing = NativeTiming::default();
        for offset in (0..self.len).step_by(PAGE_SIZE) {
            let page = pattern.page(offset);
            unsafe {
                std::ptr::write_volatile(self.addr(offset) as *mut [u8; PAGE_SIZE], page);
                for line in (0..PAGE_SIZE).step_by(CL_SIZE) {
                    timing.evict(self.addr(offset + line));
                }
            }
        }
        timing.fence_full();
    }

    /// Lazily compares the region against `pattern`.
    ///
    /// The scan never writes: scanning twice without a refill reports the
    /// same flips. Use [`restore`](HammerRegion::restore) to repair them.
    pub fn scan_for_flips(&self, pattern: &DataPattern) -> FlipScan<'_> {
        FlipScan {
            region: self,
            pattern: pattern.clone(),
            next_page: 0,
            pending: VecDeque::new(),
            timing: NativeTiming::default(),
        }
    }

    /// Writes the expected values of `flips` back to memory.
    pub fn restore(&self, flips: &[BitFlip]) {
        let timing = NativeTiming::default();
        for flip in flips {
            let addr = flip.addr as *mut u8;
            if !self.contains(addr) {
                warn!("not restoring {:?}: outside of region", flip);
                continue;
            }
            unsafe {
                std::ptr::write_volatile(addr, flip.expected);
                timing.evict(addr);
            }
        }
        timing.fence_full();
    }

    /// Unmaps the region and removes its hugetlbfs file, if any.
    pub fn teardown(mut self) {
        self.unmap();
    }

    fn unmap(&mut self) {
        if !self.mapped {
            return;
        }
        let ret = unsafe { libc::munmap(self.ptr as *mut c_void, self.len) };
        if ret != 0 {
            warn!(
                "munmap of {:p} failed: {}",
                self.ptr,
                std::io::Error::last_os_error()
            );
        }
        self.mapped = false;
        debug!("unmapped region at {:p}", self.ptr);
        if let Some(path) = self.backing_file.take()
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!("removing {} failed: {}", path.display(), e);
        }
    }
}

impl Drop for HammerRegion {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl BytePointer for HammerRegion {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len, "offset {:#x} out of bounds", offset);
        unsafe { self.ptr.byte_add(offset) }
    }

    fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

fn map_fixed(base: usize, size: usize, flags: i32, fd: i32) -> Result<*mut u8, MemoryError> {
    let p = unsafe {
        libc::mmap(
            base as *mut c_void,
            size,
            PROT_READ | PROT_WRITE,
            flags | MAP_FIXED_NOREPLACE,
            fd,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed {
            base,
            size,
            source: std::io::Error::last_os_error(),
        });
    }
    if p as usize != base {
        // kernels before 4.17 treat MAP_FIXED_NOREPLACE as a hint
        unsafe { libc::munmap(p, size) };
        return Err(MemoryError::AllocationFailed {
            base,
            size,
            source: std::io::Error::from(ErrorKind::AddrInUse),
        });
    }
    Ok(p as *mut u8)
}

/// Lazy iterator over the bit flips of a region.
///
/// Pages are compared with `memcmp` first; only mismatching pages are
/// examined byte by byte.
#[derive(Clone)]
pub struct FlipScan<'a> {
    region: &'a HammerRegion,
    pattern: DataPattern,
    next_page: usize,
    pending: VecDeque<BitFlip>,
    timing: NativeTiming,
}

impl FlipScan<'_> {
    /// Rewinds the scan to the start of the region.
    pub fn restart(&mut self) {
        self.next_page = 0;
        self.pending.clear();
    }

    fn scan_page(&mut self, offset: usize) {
        let expected = self.pattern.page(offset);
        let page = self.region.addr(offset);
        unsafe {
            for line in (0..PAGE_SIZE).step_by(CL_SIZE) {
                self.timing.evict(page.byte_add(line));
            }
            self.timing.fence_full();
            let cmp = libc::memcmp(
                page as *const c_void,
                expected.as_ptr() as *const c_void,
                PAGE_SIZE,
            );
            if cmp == 0 {
                return;
            }
        }
        trace!("page at offset {:#x} differs, locating flips", offset);
        for (i, &expected) in expected.iter().enumerate() {
            let addr = unsafe { page.byte_add(i) };
            let observed = unsafe { std::ptr::read_volatile(addr) };
            if observed != expected {
                self.pending.push_back(BitFlip::new(addr, expected, observed));
            }
        }
    }
}

impl Iterator for FlipScan<'_> {
    type Item = BitFlip;

    fn next(&mut self) -> Option<BitFlip> {
        loop {
            if let Some(flip) = self.pending.pop_front() {
                return Some(flip);
            }
            let offset = self.next_page * PAGE_SIZE;
            if offset >= self.region.len {
                return None;
            }
            self.next_page += 1;
            self.scan_page(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BytePointer;

    // every test maps at its own address so they can run in parallel
    fn region(slot: usize, size: Size, fill: DataPattern) -> HammerRegion {
        HammerRegion::initialize(&RegionConfig {
            base_addr: 0x3000000000 + (slot << 30),
            size,
            use_huge_pages: false,
            hugetlbfs_path: None,
            fill,
        })
        .expect("mapping a small region")
    }

    #[test]
    fn test_parse_hugepage_size() {
        let meminfo = "MemTotal:       16305236 kB\nHugePages_Total:       1\nHugepagesize:    1048576 kB\n";
        assert_eq!(parse_hugepage_size(meminfo), Some(1 << 30));
        assert_eq!(parse_hugepage_size("Hugepagesize: 2048 kB"), Some(2 << 20));
        assert_eq!(parse_hugepage_size("MemTotal: 1 kB"), None);
        assert_eq!(parse_hugepage_size("Hugepagesize: 0 kB"), None);
    }

    #[test]
    fn test_clean_region_has_no_flips() {
        let region = region(0, Size::MB(2), DataPattern::Random { seed: 1 });
        assert_eq!(region.ptr() as usize, 0x3000000000);
        assert_eq!(region.scan_for_flips(region.fill_pattern()).count(), 0);
    }

    #[test]
    fn test_scan_reports_each_corruption() {
        let region = region(1, Size::MB(2), DataPattern::Random { seed: 7 });
        let offsets = [0x10, 0x1fff, 0x4000, 0x1f_ffff];
        for &offset in &offsets {
            let addr = region.addr(offset);
            unsafe { *addr ^= 0b0000_0100 };
        }
        let flips: Vec<BitFlip> = region.scan_for_flips(region.fill_pattern()).collect();
        assert_eq!(flips.len(), offsets.len());
        for (flip, &offset) in flips.iter().zip(&offsets) {
            let expected = region.fill_pattern().page(offset & !(PAGE_SIZE - 1))[offset % PAGE_SIZE];
            assert_eq!(flip.addr, region.ptr() as usize + offset);
            assert_eq!(flip.expected, expected);
            assert_eq!(flip.observed, expected ^ 0b0000_0100);
            assert_eq!(flip.bit_positions(), vec![2]);
        }

        // scanning is read-only
        assert_eq!(region.scan_for_flips(region.fill_pattern()).count(), offsets.len());

        region.restore(&flips);
        assert_eq!(region.scan_for_flips(region.fill_pattern()).count(), 0);
    }

    #[test]
    fn test_scan_restart() {
        let region = region(2, Size::KB(64), DataPattern::Zero);
        unsafe { *region.addr(100) = 0x01 };
        let mut scan = region.scan_for_flips(&DataPattern::Zero);
        assert!(scan.next().is_some());
        assert!(scan.next().is_none());
        scan.restart();
        assert_eq!(scan.count(), 1);
    }

    #[test]
    fn test_collision_fails() {
        let _first = region(3, Size::KB(64), DataPattern::One);
        let second = HammerRegion::initialize(&RegionConfig {
            base_addr: 0x3000000000 + (3 << 30),
            size: Size::KB(64),
            use_huge_pages: false,
            hugetlbfs_path: None,
            fill: DataPattern::One,
        });
        assert!(matches!(second, Err(MemoryError::AllocationFailed { .. })));
    }

    #[test]
    fn test_invalid_size() {
        let res = HammerRegion::initialize(&RegionConfig {
            base_addr: 0x3000000000 + (4 << 30),
            size: Size::B(100),
            use_huge_pages: false,
            hugetlbfs_path: None,
            fill: DataPattern::Zero,
        });
        assert!(matches!(res, Err(MemoryError::InvalidSize { .. })));
    }

    #[test]
    fn test_teardown_frees_address() {
        let first = region(5, Size::KB(64), DataPattern::Zero);
        first.teardown();
        let again = region(5, Size::KB(64), DataPattern::Checkered);
        assert_eq!(again.scan_for_flips(again.fill_pattern()).count(), 0);
    }

    #[test]
    fn test_teardown_removes_backing_file() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("anvil-backing-{}", std::process::id()));
        std::fs::write(&path, b"")?;
        let mut region = region(7, Size::KB(64), DataPattern::Zero);
        region.backing_file = Some(path.clone());
        region.teardown();
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_drop_unmaps() {
        drop(region(6, Size::KB(64), DataPattern::One));
        let _again = region(6, Size::KB(64), DataPattern::Zero);
    }
}
