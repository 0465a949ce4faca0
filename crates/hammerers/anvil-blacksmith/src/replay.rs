use crate::fuzzer::{FuzzError, FuzzReport, FuzzyHammerer, PatternMappingStat, Phase, ProbeError};
use crate::pattern::{FuzzSummary, FuzzingParameterSet, HammeringPattern};
use crate::{DramBitFlip, PatternAddressMapper};
use anvil_core::hammerer::Hammering;
use anvil_core::memory::DRAMAddr;
use anvil_core::util::GroupBy;
use itertools::Itertools;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Flips observed with a mapping moved by `offset` rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepObservation {
    /// Rows the mapping was moved by
    pub offset: usize,
    /// Bank hammered
    pub bank: usize,
    /// Lowest aggressor row
    pub min_row: usize,
    /// Highest aggressor row
    pub max_row: usize,
    /// Flips of this offset
    pub flips: Vec<DramBitFlip>,
}

impl SweepObservation {
    /// Number of flips per victim row.
    pub fn flips_per_row(&self) -> BTreeMap<usize, usize> {
        self.flips
            .clone()
            .group_by(|f| f.dram_addr.row)
            .into_iter()
            .map(|(row, flips)| (row, flips.len()))
            .collect()
    }
}

/// Outcome of sweeping one (pattern, mapping) pair over contiguous rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Pattern UUID
    pub pattern_id: String,
    /// Mapping UUID
    pub mapping_id: String,
    /// One entry per hammered offset
    pub observations: Vec<SweepObservation>,
    /// All flips
    pub total_flips: usize,
    /// Bits flipped from 0 to 1
    pub num_flips_z2o: usize,
    /// Bits flipped from 1 to 0
    pub num_flips_o2z: usize,
}

impl SweepSummary {
    fn new(pattern_id: &str, mapping_id: &str, observations: Vec<SweepObservation>) -> Self {
        let flips = || observations.iter().flat_map(|o| o.flips.iter());
        SweepSummary {
            pattern_id: pattern_id.to_string(),
            mapping_id: mapping_id.to_string(),
            total_flips: flips().count(),
            num_flips_z2o: flips().map(DramBitFlip::count_z2o).sum(),
            num_flips_o2z: flips().map(DramBitFlip::count_o2z).sum(),
            observations,
        }
    }

    /// Logs offsets with flips and the totals.
    pub fn log(&self) {
        info!(
            "Sweep of pattern {} / mapping {}: {} flips ({} 0->1, {} 1->0) over {} offsets",
            self.pattern_id,
            self.mapping_id,
            self.total_flips,
            self.num_flips_z2o,
            self.num_flips_o2z,
            self.observations.len()
        );
        for obs in self.observations.iter().filter(|o| !o.flips.is_empty()) {
            let rows = obs
                .flips_per_row()
                .iter()
                .map(|(row, n)| format!("{}:{}", row, n))
                .join(" ");
            info!(
                "  offset {:>4} rows {}..={} bank {}: {}",
                obs.offset, obs.min_row, obs.max_row, obs.bank, rows
            );
        }
    }
}

/// Re-hammers known patterns: minisweeps to rank them, full sweeps of the
/// best one, and replay of patterns from an earlier run.
pub struct ReplayingHammerer<'e, 'a, H: Hammering> {
    pub(crate) engine: &'e mut FuzzyHammerer<'a, H>,
}

impl<'e, 'a, H: Hammering> ReplayingHammerer<'e, 'a, H> {
    /// Borrows the engine's region, hammerer factory and random generator.
    pub fn new(engine: &'e mut FuzzyHammerer<'a, H>) -> Self {
        ReplayingHammerer { engine }
    }

    fn params_for(&mut self, pattern: &HammeringPattern) -> Result<FuzzingParameterSet, FuzzError> {
        Ok(FuzzingParameterSet::new(
            self.engine.config.ranges.clone(),
            Some(pattern.acts_per_ref().max(2)),
            &mut self.engine.rng,
        )?)
    }

    /// Moves `mapping` up one row at a time for `num_rows` rows and hammers
    /// it at every offset.
    pub fn sweep_pattern(
        &mut self,
        pattern: &HammeringPattern,
        mapping: &PatternAddressMapper,
        num_rows: usize,
    ) -> Result<SweepSummary, FuzzError> {
        let params = self.params_for(pattern)?;
        let max_row = self.engine.config.max_row;
        let mut mapping = mapping.clone();
        let bar = self.engine.add_bar(num_rows as u64, "Sweeping rows");

        let mut observations = Vec::with_capacity(num_rows);
        for offset in 1..=num_rows {
            if self.engine.interrupt.is_raised() {
                info!("Interrupted. Stopping sweep after {} offsets.", offset - 1);
                break;
            }
            if let Some(bar) = &bar {
                bar.set_position(offset as u64);
            }
            mapping.shift_mapping(1, max_row, &[]);
            match self.engine.hammer_mapping(&mapping, pattern, &params) {
                Ok(flips) => {
                    let flips: Vec<DramBitFlip> = flips
                        .iter()
                        .map(|f| DramBitFlip::from_flip(f, &self.engine.mem_config))
                        .collect();
                    debug!("offset {}: {} flips", offset, flips.len());
                    observations.push(SweepObservation {
                        offset,
                        bank: mapping.bank_no,
                        min_row: mapping.min_row,
                        max_row: mapping.max_row,
                        flips,
                    });
                }
                Err(e) => {
                    warn!("Skipping offset {}: {}", offset, e);
                    self.engine.count_failed_burst(&e);
                }
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(SweepSummary::new(&pattern.id, &mapping.id, observations))
    }

    /// Minisweeps every (pattern, mapping) pair at one common random
    /// location and ranks the pairs by flips, most first. Pairs with equal
    /// flips keep their input order.
    pub fn rank_effective_patterns(
        &mut self,
        patterns: &[HammeringPattern],
    ) -> Result<Vec<PatternMappingStat>, FuzzError> {
        let rows = self.engine.config.minisweep_rows;
        if rows == 0 {
            return Ok(vec![]);
        }
        let sweep_start = DRAMAddr::new(
            self.engine
                .rng
                .random_range(0..self.engine.mem_config.get_bank_count()),
            self.engine.rng.random_range(0..self.engine.config.max_row),
            0,
        );
        info!(
            "Minisweeping {} pattern(s) over {} rows from {}",
            patterns.len(),
            rows,
            sweep_start
        );

        let mut ranking = vec![];
        for pattern in patterns {
            for mapping in &pattern.address_mappings {
                if self.engine.interrupt.is_raised() {
                    break;
                }
                let mut moved = mapping.clone();
                moved.remap_aggressors(&sweep_start);
                let sweep = self.sweep_pattern(pattern, &moved, rows)?;
                debug!(
                    "minisweep of {} / {}: {} flips",
                    pattern.id, mapping.id, sweep.total_flips
                );
                ranking.push(PatternMappingStat {
                    pattern_id: pattern.id.clone(),
                    mapping_id: mapping.id.clone(),
                    num_bit_flips: sweep.total_flips,
                });
            }
        }
        ranking.sort_by(|a, b| b.num_bit_flips.cmp(&a.num_bit_flips));
        if let Some(best) = ranking.first() {
            info!(
                "Best pair: pattern {} / mapping {} with {} flips",
                best.pattern_id, best.mapping_id, best.num_bit_flips
            );
        }
        Ok(ranking)
    }

    /// Sweeps the pair named by `stat` over `rows` rows from its recorded
    /// location. Returns `None` when the pair is not among `patterns`.
    pub fn sweep_pair(
        &mut self,
        patterns: &[HammeringPattern],
        stat: &PatternMappingStat,
        rows: usize,
    ) -> Result<Option<SweepSummary>, FuzzError> {
        let Some((pattern, mapping)) = patterns
            .iter()
            .find(|p| p.id == stat.pattern_id)
            .and_then(|p| p.find_mapping(&stat.mapping_id).map(|m| (p, m)))
        else {
            warn!("pair {} / {} not found", stat.pattern_id, stat.mapping_id);
            return Ok(None);
        };
        info!("Sweeping pattern {} over {} rows", pattern.id, rows);
        let sweep = self.sweep_pattern(pattern, mapping, rows)?;
        sweep.log();
        Ok(Some(sweep))
    }

    /// Hammers `mapping` at its recorded location `rounds` times and returns
    /// the flips seen and the share of completed rounds that flipped.
    /// Interrupted and unsynchronized rounds count towards neither share.
    pub fn replay_mapping(
        &mut self,
        pattern: &HammeringPattern,
        mapping: &PatternAddressMapper,
        rounds: usize,
    ) -> Result<(usize, f64), FuzzError> {
        let params = self.params_for(pattern)?;
        let mut flips = 0;
        let mut rounds_with_flips = 0;
        let mut completed = 0;
        for _ in 0..rounds {
            if self.engine.interrupt.is_raised() {
                break;
            }
            match self.engine.hammer_mapping(mapping, pattern, &params) {
                Ok(found) => {
                    completed += 1;
                    if !found.is_empty() {
                        flips += found.len();
                        rounds_with_flips += 1;
                    }
                }
                Err(e @ ProbeError::Mapping(_)) => {
                    warn!("Giving up on mapping {}: {}", mapping.id, e);
                    break;
                }
                Err(e) => {
                    debug!("Replay round dropped: {}", e);
                    self.engine.count_failed_burst(&e);
                }
            }
        }
        let score = if completed == 0 {
            0.0
        } else {
            rounds_with_flips as f64 / completed as f64
        };
        Ok((flips, score))
    }

    /// Loads the patterns `pattern_ids` (all when empty) from the summary at
    /// `path`, replays each mapping at its original location, keeps the
    /// most effective one and sweeps it.
    pub fn replay_patterns(&mut self, path: &Path, pattern_ids: &[String]) -> Result<FuzzReport, FuzzError> {
        let start_ts = chrono::Local::now().timestamp();
        let loaded = FuzzSummary::from_jsonfile(path)?;
        let mut patterns = loaded.select(pattern_ids)?;
        info!("Replaying {} pattern(s) from {}", patterns.len(), path.display());

        let rounds = self.engine.config.replay_rounds;
        let mut sweeps = vec![];
        let mut best: Option<PatternMappingStat> = None;
        for pattern in patterns.iter_mut() {
            if self.engine.interrupt.is_raised() {
                break;
            }
            self.engine.set_phase(Phase::Probe);
            let mut best_mapping: Option<(usize, usize, f64)> = None;
            for (idx, mapping) in pattern.address_mappings.iter().enumerate() {
                mapping.log_mapping();
                let (flips, score) = self.replay_mapping(pattern, mapping, rounds)?;
                info!(
                    "Mapping {} triggered {} flips (reproducibility {:.2})",
                    mapping.id, flips, score
                );
                if best_mapping.is_none_or(|(_, most, _)| flips > most) {
                    best_mapping = Some((idx, flips, score));
                }
            }
            let Some((idx, flips, score)) = best_mapping else {
                warn!("Pattern {} has no mapping to replay", pattern.id);
                continue;
            };
            let mut mapping = pattern.address_mappings.swap_remove(idx);
            mapping.reproducibility_score = score;
            pattern.address_mappings = vec![mapping.clone()];

            let stat = PatternMappingStat {
                pattern_id: pattern.id.clone(),
                mapping_id: mapping.id.clone(),
                num_bit_flips: flips,
            };
            if best.as_ref().is_none_or(|b| stat.num_bit_flips > b.num_bit_flips) {
                best = Some(stat);
            }
            if self.engine.config.sweep {
                let rows = self.engine.config.sweep_rows;
                let sweep = self.sweep_pattern(pattern, &mapping, rows)?;
                sweep.log();
                sweeps.push(sweep);
            }
        }

        let summary = FuzzSummary {
            metadata: Some(self.engine.metadata(start_ts, patterns.len())),
            hammering_patterns: patterns,
        };
        Ok(FuzzReport {
            summary,
            best,
            sweeps,
            stats: self.engine.stats.clone(),
        })
    }
}
