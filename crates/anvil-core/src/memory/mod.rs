//! DRAM addressing, the hammering region and bit-flip reporting.
//!
//! - [`MemConfiguration`] / [`DRAMAddr`]: translation between linear addresses
//!   and (bank, row, column) under an XOR bit-function geometry.
//! - [`HammerRegion`]: the fixed-address buffer that is filled with a known
//!   [`DataPattern`] and scanned for [`BitFlip`]s after every burst.
//! - [`MemoryTupleTimer`]: access-pair latency used for row-conflict search.
mod conflict;
mod dram_addr;
mod mem_configuration;
mod region;
mod timer;

pub use self::conflict::{ConflictError, ConflictSearch};
pub use self::dram_addr::DRAMAddr;
pub use self::mem_configuration::{AddressError, BitDef, GeometryError, MTX_SIZE, MemConfiguration};
pub use self::region::{FlipScan, HammerRegion, MemoryError, RegionConfig};
pub use self::timer::{LatencyTimer, MemoryTupleTimer, TimerError, construct_memory_tuple_timer};

use crate::util::{PAGE_SIZE, ROW_SHIFT, Rng};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Pointer type for aggressor row addresses.
pub type AggressorPtr = *const u8;

/// Trait for accessing memory as a byte pointer.
#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    /// Returns a pointer to the byte at the given offset.
    ///
    /// Panics if `offset` lies outside of the memory.
    fn addr(&self, offset: usize) -> *mut u8;

    /// Returns the base pointer.
    fn ptr(&self) -> *mut u8;

    /// Returns the length in bytes.
    fn len(&self) -> usize;

    /// Whether `addr` falls inside the memory.
    fn contains(&self, addr: *const u8) -> bool {
        let base = self.ptr() as usize;
        (base..base + self.len()).contains(&(addr as usize))
    }
}

/// Known contents written to the region before hammering.
///
/// Contents are a pure function of the page offset, so the expected value of
/// any byte can be recomputed during a scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataPattern {
    /// Pseudo-random bytes, reseeded per page from `seed`
    Random {
        /// Base seed
        seed: u64,
    },
    /// All zeros (0x00)
    Zero,
    /// All ones (0xFF)
    One,
    /// 0x55 on even rows, 0xAA on odd rows
    Checkered,
}

impl DataPattern {
    /// Returns a random pattern with a fresh seed.
    pub fn random() -> Self {
        DataPattern::Random {
            seed: rand::random(),
        }
    }

    /// Expected contents of the page at `offset` bytes into the region.
    pub fn page(&self, offset: usize) -> [u8; PAGE_SIZE] {
        match self {
            DataPattern::Random { seed } => {
                let mut page = [0u8; PAGE_SIZE];
                Rng::for_page(*seed, offset / PAGE_SIZE).fill_bytes(&mut page);
                page
            }
            DataPattern::Zero => [0x00; PAGE_SIZE],
            DataPattern::One => [0xFF; PAGE_SIZE],
            DataPattern::Checkered => match (offset >> ROW_SHIFT) % 2 {
                0 => [0x55; PAGE_SIZE],
                _ => [0xAA; PAGE_SIZE],
            },
        }
    }
}

/// A byte whose contents differ from the fill pattern.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BitFlip {
    /// Virtual address of the corrupted byte
    pub addr: usize,
    /// Value written during initialization
    pub expected: u8,
    /// Value read back during the scan
    pub observed: u8,
}

/// Direction of bit flip transitions.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub enum FlipDirection {
    /// Bit flipped from 0 to 1
    ZeroToOne,
    /// Bit flipped from 1 to 0
    OneToZero,
    /// Multiple bits flipped in (potentially) different directions
    Multiple(Vec<FlipDirection>),
    /// No bit flip occurred
    None,
}

impl core::fmt::Debug for BitFlip {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitFlip")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("expected", &format_args!("{:#04x}", self.expected))
            .field("observed", &format_args!("{:#04x}", self.observed))
            .finish()
    }
}

impl BitFlip {
    /// Constructor for BitFlip
    pub fn new(addr: *const u8, expected: u8, observed: u8) -> Self {
        BitFlip {
            addr: addr as usize,
            expected,
            observed,
        }
    }

    /// Bits that differ between expected and observed value.
    pub fn bitmask(&self) -> u8 {
        self.expected ^ self.observed
    }

    /// Positions (0 = LSB) of the flipped bits.
    pub fn bit_positions(&self) -> Vec<u8> {
        (0..8).filter(|i| self.bitmask() & (1 << i) != 0).collect()
    }

    /// Calculate the FlipDirection (1->0 or 0->1 or Multiple) observed in this BitFlip
    pub fn flip_direction(&self) -> FlipDirection {
        let direction = |bit: u8| {
            if self.expected & (1 << bit) != 0 {
                FlipDirection::OneToZero
            } else {
                FlipDirection::ZeroToOne
            }
        };
        match self.bit_positions().as_slice() {
            [] => FlipDirection::None,
            [bit] => direction(*bit),
            bits => FlipDirection::Multiple(bits.iter().map(|&b| direction(b)).collect()),
        }
    }
}

#[test]
fn test_pattern_random_is_reproducible() {
    let pattern = DataPattern::Random { seed: 0xC0FFEE };
    assert_eq!(pattern.page(0), pattern.clone().page(0));
    assert_eq!(pattern.page(3 * PAGE_SIZE), pattern.page(3 * PAGE_SIZE + 17));
    assert_ne!(pattern.page(0), pattern.page(PAGE_SIZE));
}

#[test]
fn test_pattern_checkered_alternates_rows() {
    let pattern = DataPattern::Checkered;
    assert_eq!(pattern.page(0)[0], 0x55);
    assert_eq!(pattern.page(PAGE_SIZE)[0], 0x55);
    assert_eq!(pattern.page(1 << ROW_SHIFT)[0], 0xAA);
}

#[test]
fn test_bitflip_direction() {
    let flip = BitFlip::new(std::ptr::null(), 0xFF, 0xFF);
    assert_eq!(flip.flip_direction(), FlipDirection::None);
    let flip = BitFlip::new(std::ptr::null(), 0b0000_0001, 0b0000_0000);
    assert_eq!(flip.flip_direction(), FlipDirection::OneToZero);

    let flip = BitFlip::new(std::ptr::null(), 0b1111_1110, 0b1111_1111);
    assert_eq!(flip.flip_direction(), FlipDirection::ZeroToOne);

    let flip = BitFlip::new(std::ptr::null(), 0b0000_0010, 0b0000_0001);
    assert_eq!(
        flip.flip_direction(),
        FlipDirection::Multiple(vec![FlipDirection::ZeroToOne, FlipDirection::OneToZero])
    );
    assert_eq!(flip.bit_positions(), vec![0, 1]);
    assert_eq!(flip.bitmask(), 0b11);
}
