use crate::pattern::{AggressorAccessPattern, AggressorId, FuzzingParameterSet, HammeringPattern, new_pattern_id};
use anvil_core::memory::{
    AddressError, AggressorPtr, BitFlip, BytePointer, ConflictError, ConflictSearch, DRAMAddr,
    HammerRegion, MemConfiguration, MemoryTupleTimer,
};
use itertools::Itertools;
use log::{debug, info, warn};
use rand::Rng;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;

/// Attempts to find a free random row for a tuple head.
const MAX_ROW_ASSIGNMENT_TRIALS: usize = 7;

/// Rows handed to the pre-burst random accesses.
const NUM_RANDOM_ROWS: usize = 1024;

/// A bit flip as persisted in a mapping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DramBitFlip {
    /// DRAM address where the bit flip occurred
    pub dram_addr: DRAMAddr,
    /// Bitmask indicating which bits flipped
    pub bitmask: u8,
    /// Data value after the flip
    pub data: u8,
}

impl DramBitFlip {
    /// Decodes a scanned flip.
    pub fn from_flip(flip: &BitFlip, mem_config: &MemConfiguration) -> Self {
        DramBitFlip {
            dram_addr: DRAMAddr::from_virt(flip.addr as AggressorPtr, mem_config),
            bitmask: flip.bitmask(),
            data: flip.observed,
        }
    }

    /// Bits that flipped from 0 to 1.
    pub fn count_z2o(&self) -> usize {
        (self.bitmask & self.data).count_ones() as usize
    }

    /// Bits that flipped from 1 to 0.
    pub fn count_o2z(&self) -> usize {
        (self.bitmask & !self.data).count_ones() as usize
    }
}

/// Errors raised while turning a mapping into hammering addresses.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The schedule references an aggressor the mapping does not bind
    #[error("no address bound to aggressor {0}")]
    MissingAggressor(AggressorId),
    /// A bound address cannot be encoded with the geometry
    #[error(transparent)]
    Address(#[from] AddressError),
    /// A bound address lies outside the hammered region
    #[error("address {addr:p} of aggressor {id} lies outside the region")]
    OutsideRegion {
        /// Aggressor id
        id: AggressorId,
        /// Encoded address
        addr: AggressorPtr,
    },
    /// Conflict search failed for a tuple head
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

/// Binds the aggressors of a pattern to DRAM rows of one bank.
///
/// One mapping is one probe of a pattern. It records the flips observed at
/// every location it was hammered at.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PatternAddressMapper {
    /// Mapping UUID
    pub id: String,
    /// Minimum row number in this mapping
    pub min_row: usize,
    /// Maximum row number in this mapping
    pub max_row: usize,
    /// Bank number for this mapping
    pub bank_no: usize,
    /// Map from aggressor IDs to their DRAM addresses
    #[serde_as(as = "Vec<(_, _)>")]
    pub aggressor_to_addr: BTreeMap<AggressorId, DRAMAddr>,
    /// Bit flips per hammered location
    #[serde(default)]
    pub bit_flips: Vec<Vec<DramBitFlip>>,
    /// Share of replays that reproduced flips
    #[serde(default)]
    pub reproducibility_score: f64,
}

impl PatternAddressMapper {
    /// Creates an empty mapping with a fresh id.
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        PatternAddressMapper {
            id: new_pattern_id(rng),
            min_row: 0,
            max_row: 0,
            bank_no: 0,
            aggressor_to_addr: BTreeMap::new(),
            bit_flips: vec![],
            reproducibility_score: 0.0,
        }
    }

    /// Chooses new rows for every aggressor of `groups` in bank `bank_no`.
    ///
    /// Tuple heads are placed `agg_inter_distance` rows after the previous
    /// head (sequential mode) or at a random free row; the remaining members
    /// of a tuple follow at `agg_intra_distance`. A head may also reuse a row
    /// that is already taken, which is how patterns with fewer distinct rows
    /// than referenced aggressors come about. Rows wrap at `max_row`.
    pub fn randomize_addresses<R: Rng + ?Sized>(
        &mut self,
        params: &FuzzingParameterSet,
        groups: &[AggressorAccessPattern],
        bank_no: usize,
        max_row: usize,
        rng: &mut R,
    ) {
        self.aggressor_to_addr.clear();
        self.bank_no = bank_no;
        let max_row = max_row.max(1);
        let use_seq_addresses = params.get_random_use_seq_addresses(rng);
        let start_row = params.get_random_start_row(rng);
        debug!(
            "bank {}, sequential {}, start row {}",
            bank_no, use_seq_addresses, start_row
        );

        let referenced: usize = groups.iter().map(|g| g.n_sided()).sum();
        let reuse_probability =
            1.0 - (params.num_aggressors as f64 / referenced.max(1) as f64).min(1.0);
        debug!(
            "{} rows for {} referenced aggressors, reuse probability {:.2}",
            params.num_aggressors, referenced, reuse_probability
        );

        let mut occupied_rows = BTreeSet::new();
        let mut cur_row = start_row % max_row;
        for group in groups {
            let mut prev: Option<usize> = None;
            for agg in group.aggressors() {
                let row = if let Some(addr) = self.aggressor_to_addr.get(&agg.id) {
                    addr.row
                } else if let Some(prev_row) = prev {
                    cur_row = (prev_row + params.agg_intra_distance) % max_row;
                    cur_row
                } else {
                    cur_row = (cur_row + params.agg_inter_distance) % max_row;
                    let reused = if !occupied_rows.is_empty() && rng.random_bool(reuse_probability) {
                        occupied_rows.iter().copied().choose(rng)
                    } else {
                        None
                    };
                    match reused {
                        Some(row) => row,
                        None if use_seq_addresses => cur_row,
                        None => {
                            let mut row = rng.random_range(0..max_row);
                            let mut trials = 1;
                            while occupied_rows.contains(&row) && trials < MAX_ROW_ASSIGNMENT_TRIALS {
                                row = rng.random_range(0..max_row);
                                trials += 1;
                            }
                            if occupied_rows.contains(&row) {
                                debug!(
                                    "no free row for aggressor {} after {} trials",
                                    agg.id, trials
                                );
                            }
                            row
                        }
                    }
                };
                occupied_rows.insert(row);
                self.aggressor_to_addr
                    .insert(agg.id, DRAMAddr::new(bank_no, row, 0));
                prev = Some(row);
            }
        }
        self.update_row_bounds();
    }

    /// Like [`randomize_addresses`](Self::randomize_addresses), but tuple
    /// heads are rows that the row-conflict side channel places in the bank
    /// of a random anchor address.
    #[allow(clippy::too_many_arguments)]
    pub fn bind_by_conflict<R: Rng + ?Sized>(
        &mut self,
        params: &FuzzingParameterSet,
        groups: &[AggressorAccessPattern],
        region: &HammerRegion,
        timer: &dyn MemoryTupleTimer,
        search: &ConflictSearch,
        mem_config: &MemConfiguration,
        max_row: usize,
        rng: &mut R,
    ) -> Result<(), MappingError> {
        self.aggressor_to_addr.clear();
        let max_row = max_row.max(1);
        let anchor = region.addr(rng.random_range(0..region.len()));
        let anchor_addr = DRAMAddr::from_virt(anchor, mem_config);
        self.bank_no = anchor_addr.bank;
        debug!("conflict anchor {:p} {}", anchor, anchor_addr);

        for group in groups {
            let mut prev: Option<usize> = None;
            for agg in group.aggressors() {
                let row = if let Some(addr) = self.aggressor_to_addr.get(&agg.id) {
                    addr.row
                } else if let Some(prev_row) = prev {
                    (prev_row + params.agg_intra_distance) % max_row
                } else {
                    let conflict = region.find_conflicting_address(anchor, timer, search, rng)?;
                    let found = DRAMAddr::from_virt(conflict, mem_config);
                    if !found.same_bank(&anchor_addr) {
                        debug!(
                            "conflict {} decodes to bank {}, expected {}",
                            found, found.bank, anchor_addr.bank
                        );
                    }
                    found.row % max_row
                };
                self.aggressor_to_addr
                    .insert(agg.id, DRAMAddr::new(self.bank_no, row, 0));
                prev = Some(row);
            }
        }
        self.update_row_bounds();
        Ok(())
    }

    /// Translates the pattern schedule into pointers inside `region`.
    pub fn export_pattern(
        &self,
        pattern: &HammeringPattern,
        region: &dyn BytePointer,
        mem_config: &MemConfiguration,
    ) -> Result<Vec<AggressorPtr>, MappingError> {
        let base = region.ptr() as AggressorPtr;
        pattern
            .access_ids
            .iter()
            .map(|agg| {
                let addr = self
                    .aggressor_to_addr
                    .get(&agg.id)
                    .ok_or(MappingError::MissingAggressor(agg.id))?;
                let ptr = addr.to_virt(base, mem_config)?;
                if !region.contains(ptr) {
                    return Err(MappingError::OutsideRegion { id: agg.id, addr: ptr });
                }
                Ok(ptr)
            })
            .collect()
    }

    /// Random rows of this mapping's bank that are not accessed by the
    /// pattern, used to keep the memory controller busy before a burst.
    pub fn get_random_nonaccessed_rows<R: Rng + ?Sized>(
        &self,
        row_upper_bound: usize,
        region: &dyn BytePointer,
        mem_config: &MemConfiguration,
        rng: &mut R,
    ) -> Vec<AggressorPtr> {
        let row_upper_bound = row_upper_bound.max(1);
        let accessed: HashSet<usize> = self.aggressor_to_addr.values().map(|a| a.row).collect();
        let base = region.ptr() as AggressorPtr;
        (0..NUM_RANDOM_ROWS)
            .map(|_| rng.random_range(self.max_row..=self.max_row + self.min_row) % row_upper_bound)
            .filter(|row| !accessed.contains(row))
            .filter_map(|row| DRAMAddr::new(self.bank_no, row, 0).to_virt(base, mem_config).ok())
            .filter(|&ptr| region.contains(ptr))
            .collect()
    }

    /// Moves aggressors `rows` rows up, wrapping at `max_row`. Only the
    /// aggressors of `groups` move, or all of them when `groups` is empty.
    pub fn shift_mapping(&mut self, rows: usize, max_row: usize, groups: &[AggressorAccessPattern]) {
        let movable: HashSet<AggressorId> = groups
            .iter()
            .flat_map(|g| g.aggressors())
            .map(|a| a.id)
            .collect();
        let max_row = max_row.max(1);
        for (id, addr) in self.aggressor_to_addr.iter_mut() {
            if movable.is_empty() || movable.contains(id) {
                addr.row = (addr.row + rows) % max_row;
            }
        }
        self.update_row_bounds();
    }

    /// Moves the whole mapping so that its lowest row lands on
    /// `new_location`, keeping row distances.
    pub fn remap_aggressors(&mut self, new_location: &DRAMAddr) {
        let Some(smallest) = self.aggressor_to_addr.values().map(|a| a.row).min() else {
            return;
        };
        for addr in self.aggressor_to_addr.values_mut() {
            addr.bank = new_location.bank;
            addr.row = new_location.row + (addr.row - smallest);
        }
        self.bank_no = new_location.bank;
        self.update_row_bounds();
    }

    /// Appends the flips observed at one location.
    pub fn record_flips(&mut self, flips: &[BitFlip], mem_config: &MemConfiguration) {
        self.bit_flips.push(
            flips
                .iter()
                .map(|f| DramBitFlip::from_flip(f, mem_config))
                .collect(),
        );
    }

    /// Returns the total number of bit flips in this pattern mapping.
    pub fn count_bitflips(&self) -> usize {
        self.bit_flips.iter().map(|b| b.len()).sum()
    }

    /// Compact `id -> (bank, row, col)` listing, three entries per line.
    pub fn get_mapping_text_repr(&self) -> String {
        let entries: Vec<String> = self
            .aggressor_to_addr
            .iter()
            .map(|(id, addr)| format!("{:<3} -> {:<13}", id, addr.to_string()))
            .collect();
        entries.chunks(3).map(|line| line.join("   ")).join("\n")
    }

    fn update_row_bounds(&mut self) {
        let rows = self.aggressor_to_addr.values().map(|a| a.row);
        match rows.minmax().into_option() {
            Some((min, max)) => {
                self.min_row = min;
                self.max_row = max;
            }
            None => warn!("mapping {} binds no aggressors", self.id),
        }
    }

    pub(crate) fn log_mapping(&self) {
        info!("Aggressor ID to DRAM address mapping (bank, row, column):");
        for line in self.get_mapping_text_repr().lines() {
            info!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{FuzzingRanges, ParamRange, PatternBuilder, create_aggressors};
    use anvil_core::memory::BitDef;
    use rand::{SeedableRng, rngs::StdRng};

    fn params(rng: &mut StdRng) -> FuzzingParameterSet {
        FuzzingParameterSet::new(FuzzingRanges::default(), Some(40), rng).unwrap()
    }

    #[test]
    fn test_every_referenced_aggressor_is_bound() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut params = params(&mut rng);
        for bank in 0..8 {
            params.randomize(&mut rng);
            let pattern = PatternBuilder::generate(&params, &mut rng);
            let mut mapper = PatternAddressMapper::new(&mut rng);
            mapper.randomize_addresses(&params, &pattern.agg_access_patterns, bank, 4096, &mut rng);
            for agg in pattern.referenced_aggressors() {
                let addr = &mapper.aggressor_to_addr[&agg.id];
                assert_eq!(addr.bank, bank);
                assert!(addr.row < 4096);
                assert!((mapper.min_row..=mapper.max_row).contains(&addr.row));
            }
        }
    }

    #[test]
    fn test_tuple_members_follow_intra_distance() {
        let mut rng = StdRng::seed_from_u64(22);
        let mut params = params(&mut rng);
        params.num_aggressors = 64;
        params.agg_intra_distance = 2;
        let groups = vec![
            AggressorAccessPattern::new(8, 1, &create_aggressors(&[0, 1, 2]), 0),
            AggressorAccessPattern::new(8, 2, &create_aggressors(&[3, 4]), 3),
        ];
        let mut mapper = PatternAddressMapper::new(&mut rng);
        mapper.randomize_addresses(&params, &groups, 3, 4096, &mut rng);
        let row = |id| mapper.aggressor_to_addr[&id].row;
        assert_eq!(row(1), (row(0) + 2) % 4096);
        assert_eq!(row(2), (row(1) + 2) % 4096);
        assert_eq!(row(4), (row(3) + 2) % 4096);
    }

    #[test]
    fn test_sequential_heads_use_inter_distance() {
        let mut rng = StdRng::seed_from_u64(23);
        let ranges = FuzzingRanges {
            start_row: ParamRange::new(10, 10),
            ..Default::default()
        };
        let mut params = FuzzingParameterSet::new(ranges, Some(40), &mut rng).unwrap();
        params.num_aggressors = 64;
        params.agg_inter_distance = 5;
        let groups = vec![
            AggressorAccessPattern::new(8, 1, &create_aggressors(&[0, 1]), 0),
            AggressorAccessPattern::new(8, 1, &create_aggressors(&[2, 3]), 2),
        ];
        // sequential placement is a coin flip per mapping; look for one
        let mapper = (0..64)
            .map(|_| {
                let mut m = PatternAddressMapper::new(&mut rng);
                m.randomize_addresses(&params, &groups, 0, 4096, &mut rng);
                m
            })
            .find(|m| m.aggressor_to_addr[&0].row == 15)
            .expect("no sequential mapping drawn");
        assert_eq!(mapper.aggressor_to_addr[&1].row, 17);
        assert_eq!(mapper.aggressor_to_addr[&2].row, 22);
        assert_eq!(mapper.aggressor_to_addr[&3].row, 24);
    }

    #[test]
    fn test_shift_wraps_and_remap_keeps_distances() {
        let mut rng = StdRng::seed_from_u64(24);
        let mut mapper = PatternAddressMapper::new(&mut rng);
        mapper.aggressor_to_addr = BTreeMap::from([
            (0, DRAMAddr::new(1, 30, 0)),
            (1, DRAMAddr::new(1, 10, 0)),
        ]);
        mapper.shift_mapping(4, 32, &[]);
        assert_eq!(mapper.aggressor_to_addr[&0].row, 2);
        assert_eq!(mapper.aggressor_to_addr[&1].row, 14);
        assert_eq!((mapper.min_row, mapper.max_row), (2, 14));

        let moved = [AggressorAccessPattern::new(4, 1, &create_aggressors(&[1]), 0)];
        mapper.shift_mapping(1, 32, &moved);
        assert_eq!(mapper.aggressor_to_addr[&0].row, 2);
        assert_eq!(mapper.aggressor_to_addr[&1].row, 15);

        mapper.remap_aggressors(&DRAMAddr::new(5, 100, 0));
        assert_eq!(mapper.aggressor_to_addr[&0], DRAMAddr::new(5, 100, 0));
        assert_eq!(mapper.aggressor_to_addr[&1], DRAMAddr::new(5, 113, 0));
        assert_eq!(mapper.bank_no, 5);
    }

    #[test]
    fn test_flip_counts() {
        let flip = DramBitFlip {
            dram_addr: DRAMAddr::new(0, 1, 2),
            bitmask: 0b0000_0110,
            data: 0b0000_0100,
        };
        assert_eq!(flip.count_z2o(), 1);
        assert_eq!(flip.count_o2z(), 1);
        let mut rng = StdRng::seed_from_u64(25);
        let mut mapper = PatternAddressMapper::new(&mut rng);
        mapper.bit_flips = vec![vec![flip.clone()], vec![], vec![flip.clone(), flip]];
        assert_eq!(mapper.count_bitflips(), 3);
    }

    #[test]
    fn test_json_shape() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(26);
        let mut mapper = PatternAddressMapper::new(&mut rng);
        mapper.aggressor_to_addr = BTreeMap::from([(3, DRAMAddr::new(1, 10, 0))]);
        let json = serde_json::to_value(&mapper)?;
        assert_eq!(
            json["aggressor_to_addr"],
            serde_json::json!([[3, {"bank": 1, "row": 10, "col": 0}]])
        );
        let back: PatternAddressMapper = serde_json::from_value(json)?;
        assert_eq!(back, mapper);
        Ok(())
    }

    #[test]
    fn test_flip_is_decoded_to_dram_address() -> anyhow::Result<()> {
        let singles = |bits: std::ops::Range<u64>| bits.rev().map(BitDef::Single).collect::<Vec<_>>();
        let cfg = MemConfiguration::from_bitdefs(&singles(13..17), &singles(17..30), &singles(0..13))?;
        let at = DRAMAddr::new(3, 17, 0x40);
        let linear = cfg.encode(&at)?;
        let flip = BitFlip::new(linear as AggressorPtr, 0b0000_0001, 0b0000_0011);
        let decoded = DramBitFlip::from_flip(&flip, &cfg);
        assert_eq!(decoded.dram_addr, at);
        assert_eq!(decoded.bitmask, 0b0000_0010);
        assert_eq!(decoded.data, 0b0000_0011);
        assert_eq!(decoded.count_z2o(), 1);
        Ok(())
    }
}
