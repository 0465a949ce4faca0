use crate::pattern::{
    FuzzMetadata, FuzzSummary, FuzzingParameterSet, HammeringPattern, PatternBuilder,
    PatternLoadError,
};
use crate::replay::{ReplayingHammerer, SweepSummary};
use crate::{ConfigError, FuzzConfig, HammerJob, MappingError, Mode, PatternAddressMapper, ProbeStrategy};
use anvil_core::hammerer::{HammerError, Hammering, InterruptFlag};
use anvil_core::memory::{BitFlip, HammerRegion, MemConfiguration, MemoryTupleTimer};
use anvil_core::util::NamedProgress;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Rows a mapping moves between two locations are drawn from `1..=MAX_LOCATION_SHIFT`.
const MAX_LOCATION_SHIFT: usize = 32;

/// Builds the hammerer for one burst.
pub type HammererFactory<'a, H> = Box<dyn Fn(HammerJob) -> H + 'a>;

/// Where the engine currently is.
///
/// `Idle -> Generate -> Probe -> Synchronize -> Hammer -> Verify ->
/// (Record | Discard) -> Generate | Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Not started
    Idle,
    /// Drawing parameters and building a pattern
    Generate,
    /// Binding aggressors to rows
    Probe,
    /// Waiting for REFRESH
    Synchronize,
    /// Issuing the burst
    Hammer,
    /// Scanning the region
    Verify,
    /// Keeping a mapping
    Record,
    /// Dropping a mapping or a burst
    Discard,
    /// Run finished
    Done,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Generate => "generate",
            Phase::Probe => "probe",
            Phase::Synchronize => "synchronize",
            Phase::Hammer => "hammer",
            Phase::Verify => "verify",
            Phase::Record => "record",
            Phase::Discard => "discard",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Fatal errors of a fuzzing or replay run.
#[derive(Debug, Error)]
pub enum FuzzError {
    /// Invalid run parameters
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Replay input could not be loaded
    #[error(transparent)]
    Pattern(#[from] PatternLoadError),
    /// Conflict-search probing without an access timer
    #[error("probe strategy ConflictSearch needs a memory tuple timer")]
    MissingTimer,
    /// No hammerer factory given to the builder
    #[error("no hammerer factory specified")]
    MissingHammerer,
}

/// Why a single location produced no result.
#[derive(Debug, Error)]
pub(crate) enum ProbeError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Hammer(#[from] HammerError),
}

/// Counters of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeStats {
    /// Generated patterns
    pub patterns: usize,
    /// Started probes
    pub probes: usize,
    /// Issued bursts
    pub bursts: usize,
    /// Probes whose mapping could not be bound or exported
    pub abandoned_probes: usize,
    /// Locations skipped because REFRESH was not found
    pub sync_failures: usize,
    /// Bursts that stopped early
    pub interrupted_bursts: usize,
    /// Probes that produced at least one flip
    pub effective_probes: usize,
    /// Recorded bit flips
    pub total_flips: usize,
}

/// Flips of one (pattern, mapping) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMappingStat {
    /// Pattern UUID
    pub pattern_id: String,
    /// Mapping UUID
    pub mapping_id: String,
    /// Flips observed
    pub num_bit_flips: usize,
}

/// Result of [`FuzzyHammerer::run`].
#[derive(Debug, Clone, Serialize)]
pub struct FuzzReport {
    /// Effective patterns with their kept mappings
    pub summary: FuzzSummary,
    /// Best-ranked (pattern, mapping) pair
    pub best: Option<PatternMappingStat>,
    /// Sweeps performed after fuzzing or during replay
    pub sweeps: Vec<SweepSummary>,
    /// Run counters
    pub stats: ProbeStats,
}

enum ProbeOutcome {
    Kept(PatternAddressMapper),
    Discarded,
    Abandoned,
    Interrupted,
}

/// The fuzzing and hammering engine.
///
/// Generates frequency-based patterns, probes each at several address
/// mappings, hammers them through a [`Hammering`] implementation built per
/// burst and keeps the mappings that flip bits. Runs until the time budget,
/// the pattern bound or the [`InterruptFlag`] stops it.
///
/// Use [`FuzzyHammerer::builder`] to construct one.
pub struct FuzzyHammerer<'a, H: Hammering> {
    pub(crate) region: &'a HammerRegion,
    pub(crate) mem_config: MemConfiguration,
    pub(crate) config: FuzzConfig,
    hammerer_factory: HammererFactory<'a, H>,
    timer: Option<&'a dyn MemoryTupleTimer>,
    pub(crate) progress: Option<MultiProgress>,
    pub(crate) interrupt: InterruptFlag,
    pub(crate) rng: StdRng,
    phase: Phase,
    pub(crate) stats: ProbeStats,
    next_bank: usize,
}

impl<'a, H: Hammering> FuzzyHammerer<'a, H> {
    /// Creates a builder hammering `region` under the geometry `mem_config`.
    pub fn builder(region: &'a HammerRegion, mem_config: MemConfiguration) -> FuzzyHammererBuilder<'a, H> {
        FuzzyHammererBuilder {
            region,
            mem_config,
            config: FuzzConfig::default(),
            hammerer_factory: None,
            timer: None,
            progress: None,
            interrupt: InterruptFlag::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Counters collected so far.
    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    /// Runs the configured mode.
    pub fn run(&mut self) -> Result<FuzzReport, FuzzError> {
        let report = match self.config.mode.clone() {
            Mode::Fuzz => self.fuzz(),
            Mode::Replay { path, pattern_ids } => {
                ReplayingHammerer::new(self).replay_patterns(&path, &pattern_ids)
            }
        };
        self.set_phase(Phase::Done);
        report
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!("phase {} -> {}", self.phase, phase);
        }
        self.phase = phase;
    }

    pub(crate) fn metadata(&self, start: i64, num_patterns: usize) -> FuzzMetadata {
        FuzzMetadata {
            start,
            end: chrono::Local::now().timestamp(),
            num_patterns,
            dimm_id: self.config.dimm_id,
            memory_config: Some(self.mem_config),
        }
    }

    /// Books a burst without a usable result in the run counters.
    pub(crate) fn count_failed_burst(&mut self, e: &ProbeError) {
        match e {
            ProbeError::Hammer(HammerError::InterruptedBurst { .. }) => {
                self.stats.interrupted_bursts += 1
            }
            ProbeError::Hammer(HammerError::Synchronization(_)) => self.stats.sync_failures += 1,
            ProbeError::Mapping(_) => {}
        }
    }

    pub(crate) fn add_bar(&self, len: u64, name: &str) -> Option<ProgressBar> {
        self.progress.as_ref().map(|p| {
            let bar = p.add(ProgressBar::new(len));
            bar.set_style(ProgressStyle::named_bar(name));
            bar
        })
    }

    fn fuzz(&mut self) -> Result<FuzzReport, FuzzError> {
        let start = Instant::now();
        let start_ts = chrono::Local::now().timestamp();
        let timeout = Some(self.config.runtime_limit).filter(|limit| !limit.is_zero());
        info!(
            "Fuzzing for {} on {} rank(s), {} banks, rows below {}",
            humanize(timeout),
            self.config.num_ranks,
            self.mem_config.get_bank_count(),
            self.config.max_row
        );

        let mut params = FuzzingParameterSet::new(
            self.config.ranges.clone(),
            self.config.acts_per_ref,
            &mut self.rng,
        )?;
        params.log_static_parameters();

        let time_bar = timeout.and_then(|t| {
            let bar = self.add_bar(t.as_secs(), "Fuzzing time")?;
            bar.enable_steady_tick(Duration::from_secs(1));
            Some(bar)
        });
        let pattern_bar = self
            .config
            .max_patterns
            .and_then(|n| self.add_bar(n as u64, "Patterns"));

        let mut patterns: Vec<HammeringPattern> = vec![];
        'fuzzing: loop {
            if check_timeout(timeout, start.elapsed()) {
                info!("Time budget exhausted. Stopping.");
                break;
            }
            if self
                .config
                .max_patterns
                .is_some_and(|max| self.stats.patterns >= max)
            {
                info!("Pattern bound reached. Stopping.");
                break;
            }
            if self.interrupt.is_raised() {
                info!("Interrupted. Stopping.");
                break;
            }
            if let Some(bar) = &time_bar {
                bar.set_position(start.elapsed().as_secs());
            }

            self.set_phase(Phase::Generate);
            params.randomize(&mut self.rng);
            let mut pattern = PatternBuilder::generate(&params, &mut self.rng);
            self.stats.patterns += 1;
            if let Some(bar) = &pattern_bar {
                bar.set_position(self.stats.patterns as u64);
            }
            info!(
                "Pattern {} ({}): {} groups, base period {}, {} activations per REFRESH",
                self.stats.patterns,
                pattern.id,
                pattern.agg_access_patterns.len(),
                pattern.base_period,
                pattern.acts_per_ref()
            );
            trace!("{}", pattern.get_pattern_text_repr());
            pattern.agg_access_patterns.shuffle(&mut self.rng);

            for probe in 0..self.config.probes_per_pattern {
                if probe > 0 && check_timeout(timeout, start.elapsed()) {
                    break;
                }
                match self.probe_pattern(&params, &pattern) {
                    ProbeOutcome::Kept(mapping) => pattern.address_mappings.push(mapping),
                    ProbeOutcome::Discarded | ProbeOutcome::Abandoned => {}
                    ProbeOutcome::Interrupted if self.interrupt.is_raised() => {
                        if !pattern.address_mappings.is_empty() {
                            patterns.push(pattern);
                        }
                        info!("Interrupted. Stopping.");
                        break 'fuzzing;
                    }
                    ProbeOutcome::Interrupted => {}
                }
            }

            if pattern.address_mappings.is_empty() {
                debug!("pattern {} produced no flips", pattern.id);
            } else {
                info!(
                    "Pattern {} kept with {} mapping(s), {} flips",
                    pattern.id,
                    pattern.address_mappings.len(),
                    pattern.count_bitflips()
                );
                patterns.push(pattern);
            }
        }
        if let Some(bar) = time_bar {
            bar.finish_and_clear();
        }
        if let Some(bar) = pattern_bar {
            bar.finish_and_clear();
        }

        info!(
            "Fuzzing done: {} patterns, {} probes, {} effective, {} flips",
            self.stats.patterns,
            self.stats.probes,
            self.stats.effective_probes,
            self.stats.total_flips
        );

        let mut sweeps = vec![];
        let mut best = best_by_flips(&patterns);
        if !patterns.is_empty() && !self.interrupt.is_raised() {
            let mut replay = ReplayingHammerer::new(self);
            let ranking = replay.rank_effective_patterns(&patterns)?;
            if let Some(top) = ranking.into_iter().next() {
                best = Some(top);
            }
            if let Some(best) = &best
                && replay.engine.config.sweep
            {
                let rows = replay.engine.config.sweep_rows;
                if let Some(sweep) = replay.sweep_pair(&patterns, best, rows)? {
                    sweeps.push(sweep);
                }
            }
        }

        let summary = FuzzSummary {
            metadata: Some(self.metadata(start_ts, self.stats.patterns)),
            hammering_patterns: patterns,
        };
        Ok(FuzzReport {
            summary,
            best,
            sweeps,
            stats: self.stats.clone(),
        })
    }

    fn probe_pattern(&mut self, params: &FuzzingParameterSet, pattern: &HammeringPattern) -> ProbeOutcome {
        self.set_phase(Phase::Probe);
        self.stats.probes += 1;
        let mut mapping = PatternAddressMapper::new(&mut self.rng);
        if let Err(e) = self.bind(&mut mapping, params, pattern) {
            warn!("Abandoning probe of pattern {}: {}", pattern.id, e);
            self.stats.abandoned_probes += 1;
            self.set_phase(Phase::Discard);
            return ProbeOutcome::Abandoned;
        }
        mapping.log_mapping();

        for location in 0..self.config.locations_per_mapping {
            match self.hammer_mapping(&mapping, pattern, params) {
                Ok(flips) => {
                    if !flips.is_empty() {
                        info!("Location {}: {} bit flip(s)", location, flips.len());
                    }
                    mapping.record_flips(&flips, &self.mem_config);
                }
                Err(ProbeError::Mapping(e)) => {
                    warn!("Abandoning probe at location {}: {}", location, e);
                    self.stats.abandoned_probes += 1;
                    self.set_phase(Phase::Discard);
                    return ProbeOutcome::Abandoned;
                }
                Err(e @ ProbeError::Hammer(HammerError::Synchronization(_))) => {
                    warn!("Skipping location {}: {}", location, e);
                    self.count_failed_burst(&e);
                }
                Err(e @ ProbeError::Hammer(HammerError::InterruptedBurst { .. })) => {
                    warn!("Discarding probe: {}", e);
                    self.count_failed_burst(&e);
                    self.set_phase(Phase::Discard);
                    return ProbeOutcome::Interrupted;
                }
            }
            let shift = self.rng.random_range(1..=MAX_LOCATION_SHIFT);
            mapping.shift_mapping(shift, self.config.max_row, &[]);
        }

        let flips = mapping.count_bitflips();
        if flips > 0 {
            self.stats.effective_probes += 1;
            self.stats.total_flips += flips;
        }
        if flips > 0 || self.config.record_all {
            self.set_phase(Phase::Record);
            ProbeOutcome::Kept(mapping)
        } else {
            self.set_phase(Phase::Discard);
            ProbeOutcome::Discarded
        }
    }

    fn bind(
        &mut self,
        mapping: &mut PatternAddressMapper,
        params: &FuzzingParameterSet,
        pattern: &HammeringPattern,
    ) -> Result<(), MappingError> {
        match (self.config.probe_strategy, self.timer) {
            (ProbeStrategy::ConflictSearch, Some(timer)) => mapping.bind_by_conflict(
                params,
                &pattern.agg_access_patterns,
                self.region,
                timer,
                &self.config.conflict,
                &self.mem_config,
                self.config.max_row,
                &mut self.rng,
            ),
            _ => {
                let bank = self.next_bank % self.mem_config.get_bank_count();
                self.next_bank += 1;
                mapping.randomize_addresses(
                    params,
                    &pattern.agg_access_patterns,
                    bank,
                    self.config.max_row,
                    &mut self.rng,
                );
                Ok(())
            }
        }
    }

    /// Hammers `pattern` under `mapping` once and returns the flips of the
    /// burst. The region is restored before returning, whatever the outcome.
    pub(crate) fn hammer_mapping(
        &mut self,
        mapping: &PatternAddressMapper,
        pattern: &HammeringPattern,
        params: &FuzzingParameterSet,
    ) -> Result<Vec<BitFlip>, ProbeError> {
        let aggressors = mapping.export_pattern(pattern, self.region, &self.mem_config)?;
        let random_rows = mapping.get_random_nonaccessed_rows(
            self.config.max_row,
            self.region,
            &self.mem_config,
            &mut self.rng,
        );
        let wait_us = params.get_random_wait_until_start_hammering_us(&mut self.rng);
        let job = HammerJob::new(
            aggressors,
            pattern.acts_per_ref(),
            params.hammering_total_num_activations,
            random_rows,
            wait_us,
        );

        self.set_phase(Phase::Synchronize);
        let hammerer = (self.hammerer_factory)(job);
        self.set_phase(Phase::Hammer);
        let result: Result<_, HammerError> = hammerer.hammer().map_err(Into::into);
        self.stats.bursts += 1;

        self.set_phase(Phase::Verify);
        let flips: Vec<BitFlip> = self
            .region
            .scan_for_flips(self.region.fill_pattern())
            .collect();
        self.region.restore(&flips);
        match result {
            Ok(burst) => {
                debug!(
                    "burst: {} activations, {} REFRESH alignments, {} flips",
                    burst.activations,
                    burst.refresh_syncs,
                    flips.len()
                );
                Ok(flips)
            }
            Err(e) => {
                if !flips.is_empty() {
                    debug!("dropping {} flips of an unverified burst", flips.len());
                }
                Err(e.into())
            }
        }
    }
}

/// Builder for [`FuzzyHammerer`].
pub struct FuzzyHammererBuilder<'a, H: Hammering> {
    region: &'a HammerRegion,
    mem_config: MemConfiguration,
    config: FuzzConfig,
    hammerer_factory: Option<HammererFactory<'a, H>>,
    timer: Option<&'a dyn MemoryTupleTimer>,
    progress: Option<MultiProgress>,
    interrupt: InterruptFlag,
}

impl<'a, H: Hammering> FuzzyHammererBuilder<'a, H> {
    /// Run parameters.
    pub fn config(mut self, config: FuzzConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the hammerer of every burst.
    pub fn hammerer_factory(mut self, factory: impl Fn(HammerJob) -> H + 'a) -> Self {
        self.hammerer_factory = Some(Box::new(factory));
        self
    }

    /// Access-pair timer, required for [`ProbeStrategy::ConflictSearch`].
    pub fn timer(mut self, timer: &'a dyn MemoryTupleTimer) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Shows progress bars on `progress`.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Flag that stops the run at the next REFRESH boundary. Share it with
    /// the hammerers built by the factory.
    pub fn interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> Result<FuzzyHammerer<'a, H>, FuzzError> {
        self.config.validate(self.mem_config.get_row_count())?;
        if self.config.probe_strategy == ProbeStrategy::ConflictSearch && self.timer.is_none() {
            return Err(FuzzError::MissingTimer);
        }
        let seed = self.config.seed.unwrap_or_else(rand::random);
        info!("Random seed: {}", seed);
        Ok(FuzzyHammerer {
            region: self.region,
            mem_config: self.mem_config,
            config: self.config,
            hammerer_factory: self.hammerer_factory.ok_or(FuzzError::MissingHammerer)?,
            timer: self.timer,
            progress: self.progress,
            interrupt: self.interrupt,
            rng: StdRng::seed_from_u64(seed),
            phase: Phase::Idle,
            stats: ProbeStats::default(),
            next_bank: 0,
        })
    }
}

fn check_timeout(timeout: Option<Duration>, duration: Duration) -> bool {
    timeout.is_some_and(|timeout| duration > timeout)
}

fn humanize(timeout: Option<Duration>) -> String {
    match timeout {
        Some(t) => format!("{} minutes", t.as_secs() / 60),
        None => "an unbounded time".into(),
    }
}

fn best_by_flips(patterns: &[HammeringPattern]) -> Option<PatternMappingStat> {
    patterns
        .iter()
        .filter_map(|p| {
            p.determine_most_effective_mapping()
                .map(|m| PatternMappingStat {
                    pattern_id: p.id.clone(),
                    mapping_id: m.id.clone(),
                    num_bit_flips: m.count_bitflips(),
                })
        })
        .max_by_key(|stat| stat.num_bit_flips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_timeout() {
        assert!(!check_timeout(None, Duration::from_secs(1000)));
        assert!(!check_timeout(Some(Duration::from_secs(10)), Duration::from_secs(10)));
        assert!(check_timeout(Some(Duration::from_secs(10)), Duration::from_secs(11)));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Synchronize.to_string(), "synchronize");
        assert_eq!(Phase::Done.to_string(), "done");
    }

    #[test]
    fn test_best_by_flips() {
        use anvil_core::memory::DRAMAddr;

        let mut rng = StdRng::seed_from_u64(31);
        let flip = crate::DramBitFlip {
            dram_addr: DRAMAddr::new(0, 1, 0),
            bitmask: 1,
            data: 1,
        };
        let mut weak = PatternAddressMapper::new(&mut rng);
        weak.bit_flips = vec![vec![flip.clone()]];
        let mut strong = PatternAddressMapper::new(&mut rng);
        strong.bit_flips = vec![vec![flip.clone()], vec![flip]];
        let mut pattern = HammeringPattern::new("p".into());
        pattern.address_mappings = vec![weak, strong.clone()];

        let best = best_by_flips(&[pattern]).unwrap();
        assert_eq!(best.mapping_id, strong.id);
        assert_eq!(best.num_bit_flips, 2);
        assert_eq!(best_by_flips(&[]), None);
    }
}
