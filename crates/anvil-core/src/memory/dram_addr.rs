use crate::memory::{AddressError, AggressorPtr, MemConfiguration};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// DRAM address with bank, row, and column components.
///
/// `msb` holds the address bits above the addressing matrix. They are carried
/// through decoding unchanged and OR-ed back in when encoding, so a decoded
/// address round-trips to the exact linear address it came from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DRAMAddr {
    /// Bank number
    pub bank: usize,
    /// Row number
    pub row: usize,
    /// Column number
    pub col: usize,
    /// High-order address bits above the addressing matrix
    #[serde(default, skip_serializing_if = "is_zero")]
    pub msb: usize,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

impl Display for DRAMAddr {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "({}, {}, {})", self.bank, self.row, self.col)
    }
}

impl DRAMAddr {
    /// Creates a new DRAM address without high-order bits.
    pub fn new(bank: usize, row: usize, col: usize) -> Self {
        DRAMAddr {
            bank,
            row,
            col,
            msb: 0,
        }
    }

    /// Returns a copy placed in the 1 GiB window containing `base`.
    pub fn with_msb(&self, base: AggressorPtr) -> Self {
        DRAMAddr {
            msb: (base as usize) & !MemConfiguration::MATRIX_MASK,
            ..self.clone()
        }
    }

    /// Decodes a virtual address into DRAM components.
    pub fn from_virt(addr: AggressorPtr, mem_config: &MemConfiguration) -> DRAMAddr {
        mem_config.decode(addr as usize)
    }

    /// Linearizes the bank, row and column fields without applying the matrix.
    pub fn linearize(&self, mem_config: &MemConfiguration) -> usize {
        (self.bank << mem_config.bk_shift)
            | (self.row << mem_config.row_shift)
            | (self.col << mem_config.col_shift)
    }

    /// Converts this DRAM address to a pointer in the window of `base_msb`.
    ///
    /// Assumes the window is backed by physically contiguous memory, e.g. a
    /// 1 GiB huge page.
    pub fn to_virt(
        &self,
        base_msb: AggressorPtr,
        mem_config: &MemConfiguration,
    ) -> Result<AggressorPtr, AddressError> {
        mem_config
            .encode(&self.with_msb(base_msb))
            .map(|addr| addr as AggressorPtr)
    }

    /// Adds offsets to each component. High-order bits are kept.
    pub fn add(&self, bank: usize, row: usize, col: usize) -> DRAMAddr {
        DRAMAddr {
            bank: self.bank + bank,
            row: self.row + row,
            col: self.col + col,
            msb: self.msb,
        }
    }

    /// Whether both addresses lie in the same bank.
    pub fn same_bank(&self, other: &DRAMAddr) -> bool {
        self.bank == other.bank
    }

    /// Whether both addresses lie in the same row of the same bank.
    pub fn same_row(&self, other: &DRAMAddr) -> bool {
        self.bank == other.bank && self.row == other.row
    }
}
