use crate::memory::DRAMAddr;
use crate::util::ROW_SHIFT;
use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of DRAM addressing matrices
pub const MTX_SIZE: usize = 30;

/// Defines which physical address bits are used for DRAM mapping.
///
/// Can specify a single bit or the XOR of multiple bits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BitDef {
    /// Single bit function
    Single(u64),
    /// XOR of multiple bits
    Multi(Vec<u64>),
}

impl BitDef {
    /// Converts the bit definition to a bitmask with bits set at the given positions.
    pub fn to_bitstr(&self) -> usize {
        match self {
            BitDef::Single(bit) => 1 << bit,
            BitDef::Multi(bits) => bits.iter().fold(0, |acc, bit| acc | 1 << bit),
        }
    }

    fn bits(&self) -> &[u64] {
        match self {
            BitDef::Single(bit) => std::slice::from_ref(bit),
            BitDef::Multi(bits) => bits,
        }
    }
}

/// Errors raised while building a [`MemConfiguration`] from bit functions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    /// The bit functions do not add up to the matrix width
    #[error(
        "bank_bits ({bank}) + row_bits ({row}) + col_bits ({col}) must define exactly {expected} functions"
    )]
    BitCount {
        /// Number of bank functions
        bank: usize,
        /// Number of row functions
        row: usize,
        /// Number of column functions
        col: usize,
        /// Required total
        expected: usize,
    },
    /// A function references an address bit outside of the matrix
    #[error("{field}: bit {bit} lies outside the {width}-bit addressing matrix")]
    BitOutOfRange {
        /// Offending parameter
        field: &'static str,
        /// Offending bit index
        bit: u64,
        /// Matrix width
        width: usize,
    },
    /// A function without any bits, or no bank functions at all
    #[error("{field}: empty bit function")]
    EmptyFunction {
        /// Offending parameter
        field: &'static str,
    },
    /// The functions are linearly dependent over GF(2)
    #[error("bank_bits, row_bits and col_bits are linearly dependent; the mapping is not invertible")]
    NotInvertible,
}

/// Errors raised by [`MemConfiguration::encode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// A field does not fit its bit width
    #[error("{field} {value} exceeds the maximum of {max}")]
    OutOfRange {
        /// Field name (`bank`, `row` or `col`)
        field: &'static str,
        /// Requested value
        value: usize,
        /// Largest representable value
        max: usize,
    },
    /// The high-order bits overlap the matrix-controlled bits
    #[error("high-order bits {msb:#x} overlap the addressing matrix")]
    UnalignedMsb {
        /// Offending high-order bits
        msb: usize,
    },
}

/// DRAM addressing configuration.
///
/// Defines how linear addresses map to DRAM organization (bank, row, column)
/// using a pair of mutually inverse XOR matrices over the low [`MTX_SIZE`]
/// address bits.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MemConfiguration {
    /// Bit shift for bank extraction
    pub bk_shift: usize,
    /// Bit mask for bank extraction
    pub bk_mask: usize,
    /// Bit shift for row extraction
    pub row_shift: usize,
    /// Bit mask for row extraction
    pub row_mask: usize,
    /// Bit shift for column extraction
    pub col_shift: usize,
    /// Bit mask for column extraction
    pub col_mask: usize,
    /// DRAM addressing matrix (linear to DRAM)
    pub dram_mtx: [usize; MTX_SIZE],
    /// Address reconstruction matrix (DRAM to linear)
    pub addr_mtx: [usize; MTX_SIZE],
    /// Maximum bank bit position
    pub max_bank_bit: u64,
}

impl MemConfiguration {
    /// Address bits controlled by the matrices.
    pub const MATRIX_MASK: usize = (1 << MTX_SIZE) - 1;

    /// Builds a configuration from per-DIMM bit functions.
    ///
    /// Matrix rows are ordered bank, column, row; the inverse is computed by
    /// Gauss-Jordan elimination over GF(2).
    pub fn from_bitdefs(
        bank_bits: &[BitDef],
        row_bits: &[BitDef],
        col_bits: &[BitDef],
    ) -> Result<Self, GeometryError> {
        if bank_bits.len() + col_bits.len() + row_bits.len() != MTX_SIZE {
            return Err(GeometryError::BitCount {
                bank: bank_bits.len(),
                row: row_bits.len(),
                col: col_bits.len(),
                expected: MTX_SIZE,
            });
        }
        if bank_bits.is_empty() {
            return Err(GeometryError::EmptyFunction { field: "bank_bits" });
        }
        for (field, defs) in [
            ("bank_bits", bank_bits),
            ("row_bits", row_bits),
            ("col_bits", col_bits),
        ] {
            for def in defs {
                if def.bits().is_empty() {
                    return Err(GeometryError::EmptyFunction { field });
                }
                if let Some(&bit) = def.bits().iter().find(|&&b| b >= MTX_SIZE as u64) {
                    return Err(GeometryError::BitOutOfRange {
                        field,
                        bit,
                        width: MTX_SIZE,
                    });
                }
            }
        }

        let mut out = MemConfiguration {
            bk_shift: MTX_SIZE - bank_bits.len(),
            bk_mask: (1 << bank_bits.len()) - 1,
            col_shift: MTX_SIZE - bank_bits.len() - col_bits.len(),
            col_mask: (1 << col_bits.len()) - 1,
            row_shift: 0,
            row_mask: (1 << row_bits.len()) - 1,
            max_bank_bit: bank_bits
                .iter()
                .flat_map(|def| def.bits().iter().copied())
                .max()
                .unwrap_or_default(),
            ..Default::default()
        };

        for (i, def) in bank_bits.iter().chain(col_bits).chain(row_bits).enumerate() {
            out.dram_mtx[i] = def.to_bitstr();
        }
        out.addr_mtx = invert_gf2(&out.dram_mtx).ok_or(GeometryError::NotInvertible)?;
        Ok(out)
    }

    /// Returns the periodicity of the bank function in rows.
    ///
    /// Indicates how many rows must be iterated before the bank function repeats.
    pub fn bank_function_period(&self) -> u64 {
        1 << (self.max_bank_bit + 1).saturating_sub(ROW_SHIFT as u64)
    }

    /// Returns the number of banks in this DRAM configuration.
    pub fn get_bank_count(&self) -> usize {
        1 << self.bk_mask.count_ones()
    }

    /// Returns the number of rows in this DRAM configuration.
    pub fn get_row_count(&self) -> usize {
        1 << self.row_mask.count_ones()
    }

    /// Encodes a DRAM address into a linear address.
    ///
    /// Fields are never truncated: a value wider than its field fails with
    /// [`AddressError::OutOfRange`].
    pub fn encode(&self, addr: &DRAMAddr) -> Result<usize, AddressError> {
        for (field, value, max) in [
            ("bank", addr.bank, self.bk_mask),
            ("row", addr.row, self.row_mask),
            ("col", addr.col, self.col_mask),
        ] {
            if value > max {
                return Err(AddressError::OutOfRange { field, value, max });
            }
        }
        if addr.msb & Self::MATRIX_MASK != 0 {
            return Err(AddressError::UnalignedMsb { msb: addr.msb });
        }
        let l = addr.linearize(self);
        Ok(addr.msb | apply(&self.addr_mtx, l))
    }

    /// Decodes a linear address into its DRAM components.
    pub fn decode(&self, linear: usize) -> DRAMAddr {
        let res = apply(&self.dram_mtx, linear);
        DRAMAddr {
            bank: (res >> self.bk_shift) & self.bk_mask,
            row: (res >> self.row_shift) & self.row_mask,
            col: (res >> self.col_shift) & self.col_mask,
            msb: linear & !Self::MATRIX_MASK,
        }
    }
}

/// Multiplies `v` with a matrix stored as row bitmasks; row 0 yields the MSB.
fn apply(mtx: &[usize; MTX_SIZE], v: usize) -> usize {
    mtx.iter()
        .fold(0, |res, &row| (res << 1) | ((v & row).count_ones() as usize & 1))
}

fn invert_gf2(dram_mtx: &[usize; MTX_SIZE]) -> Option<[usize; MTX_SIZE]> {
    let mut matrix = SMatrix::<u8, MTX_SIZE, MTX_SIZE>::zeros();
    for row in 0..MTX_SIZE {
        for col in 0..MTX_SIZE {
            matrix[(row, col)] = ((dram_mtx[row] >> (MTX_SIZE - col - 1)) & 1) as u8;
        }
    }
    let mut inverse = SMatrix::<u8, MTX_SIZE, MTX_SIZE>::identity();
    for col in 0..MTX_SIZE {
        let pivot = (col..MTX_SIZE).find(|&r| matrix[(r, col)] == 1)?;
        matrix.swap_rows(col, pivot);
        inverse.swap_rows(col, pivot);
        for row in 0..MTX_SIZE {
            if row == col || matrix[(row, col)] == 0 {
                continue;
            }
            for k in 0..MTX_SIZE {
                let (m, i) = (matrix[(col, k)], inverse[(col, k)]);
                matrix[(row, k)] ^= m;
                inverse[(row, k)] ^= i;
            }
        }
    }

    let mut addr_mtx = [0; MTX_SIZE];
    for (row, entry) in addr_mtx.iter_mut().enumerate() {
        for col in 0..MTX_SIZE {
            *entry |= (inverse[(row, col)] as usize) << (MTX_SIZE - col - 1);
        }
    }
    Some(addr_mtx)
}

/// Geometry with XOR bank functions used throughout the tests.
#[cfg(test)]
pub(crate) fn xor_geometry() -> MemConfiguration {
    let bank_bits = vec![
        BitDef::Multi(vec![6, 13]),
        BitDef::Multi(vec![14, 18]),
        BitDef::Multi(vec![15, 19]),
        BitDef::Multi(vec![16, 20]),
        BitDef::Multi(vec![17, 21]),
    ];
    let row_bits = (18..30).rev().map(BitDef::Single).collect::<Vec<_>>();
    let col_bits = (0..14)
        .rev()
        .filter(|&b| b != 6)
        .map(BitDef::Single)
        .collect::<Vec<_>>();
    MemConfiguration::from_bitdefs(&bank_bits, &row_bits, &col_bits)
        .expect("geometry is invertible")
}
