use anvil::blacksmith::pattern::{FuzzSummary, FuzzingRanges, ParamRange};
use anvil::blacksmith::{
    BlacksmithConfig, FuzzConfig, FuzzError, FuzzyHammerer, HammerJob, Mode, ProbeStrategy,
};
use anvil::memory::{BitDef, DataPattern, HammerRegion, MemConfiguration, RegionConfig};
use anvil::util::Size;
use anvil::InterruptFlag;
use anvil_dummy::{Dummy, FlipAddr};
use std::cell::Cell;
use std::time::Duration;

const CONFIG_FILE: &str = "config/bs-config.json";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 16 banks on bits 13..=16, rows above, columns below. Rows below 32 stay
/// within the first 4 MiB of the window.
fn small_geometry() -> anyhow::Result<MemConfiguration> {
    let singles = |bits: std::ops::RangeInclusive<u64>| bits.rev().map(BitDef::Single).collect::<Vec<_>>();
    Ok(MemConfiguration::from_bitdefs(
        &singles(13..=16),
        &singles(17..=29),
        &singles(0..=12),
    )?)
}

// every test maps at its own address so they can run in parallel
fn region(slot: usize) -> anyhow::Result<HammerRegion> {
    Ok(HammerRegion::initialize(&RegionConfig {
        base_addr: 0x5000000000 + (slot << 30),
        size: Size::MB(8),
        use_huge_pages: false,
        hugetlbfs_path: None,
        fill: DataPattern::Random { seed: 0xA5A5 + slot as u64 },
    })?)
}

fn config() -> FuzzConfig {
    FuzzConfig {
        runtime_limit: Duration::from_secs(120),
        max_patterns: Some(2),
        probes_per_pattern: 2,
        locations_per_mapping: 2,
        minisweep_rows: 3,
        sweep_rows: 4,
        max_row: 32,
        use_huge_pages: false,
        seed: Some(7),
        ranges: FuzzingRanges {
            start_row: ParamRange::new(0, 8),
            wait_until_start_hammering_refs: ParamRange::new(0, 0),
            hammering_total_num_activations: 1000,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Flips the byte after the first aggressor of every burst.
fn flip_first(job: &HammerJob) -> Dummy {
    let targets = job
        .aggressors
        .first()
        .map(|&agg| FlipAddr::from(agg.wrapping_add(1)))
        .into_iter()
        .collect();
    Dummy::new(targets)
}

fn assert_clean(region: &HammerRegion) {
    assert_eq!(region.scan_for_flips(region.fill_pattern()).count(), 0);
}

#[test]
fn test_fuzzing_records_flips() -> anyhow::Result<()> {
    init_logging();
    let region = region(0)?;
    let mut engine = FuzzyHammerer::builder(&region, small_geometry()?)
        .config(config())
        .hammerer_factory(|job: HammerJob| flip_first(&job))
        .build()?;
    let report = engine.run()?;

    let stats = &report.stats;
    assert_eq!(stats.patterns, 2);
    assert_eq!(stats.probes, 4);
    assert_eq!(stats.abandoned_probes, 0);
    assert_eq!(stats.effective_probes, 4);
    assert_eq!(stats.total_flips, 8);
    // fuzzing, then 3 minisweep rows per mapping, then the full sweep
    assert_eq!(stats.bursts, 8 + 4 * 3 + 4);

    let patterns = &report.summary.hammering_patterns;
    assert_eq!(patterns.len(), 2);
    for pattern in patterns {
        assert_eq!(pattern.address_mappings.len(), 2);
        for mapping in &pattern.address_mappings {
            assert_eq!(mapping.bit_flips.len(), 2);
            assert!(mapping.bit_flips.iter().all(|flips| flips.len() == 1));
            assert!(mapping.aggressor_to_addr.values().all(|a| a.row < 32));
        }
    }
    let metadata = report.summary.metadata.as_ref().expect("metadata");
    assert_eq!(metadata.num_patterns, 2);
    assert!(metadata.end >= metadata.start);

    let best = report.best.as_ref().expect("best pair");
    assert_eq!(best.num_bit_flips, 3);
    assert_eq!(report.sweeps.len(), 1);
    let sweep = &report.sweeps[0];
    assert_eq!(sweep.pattern_id, best.pattern_id);
    assert_eq!(sweep.observations.len(), 4);
    assert_eq!(sweep.total_flips, 4);
    assert_eq!(
        sweep.observations.iter().map(|o| o.offset).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_clean(&region);
    Ok(())
}

#[test]
fn test_interrupted_bursts_are_never_recorded() -> anyhow::Result<()> {
    init_logging();
    let region = region(1)?;
    let mut engine = FuzzyHammerer::builder(&region, small_geometry()?)
        .config(config())
        .hammerer_factory(|job: HammerJob| flip_first(&job).interrupted_after(3))
        .build()?;
    let report = engine.run()?;

    assert_eq!(report.stats.patterns, 2);
    assert_eq!(report.stats.interrupted_bursts, 4);
    assert_eq!(report.stats.effective_probes, 0);
    assert_eq!(report.stats.total_flips, 0);
    assert!(report.summary.hammering_patterns.is_empty());
    assert_eq!(report.best, None);
    assert!(report.sweeps.is_empty());
    assert_clean(&region);
    Ok(())
}

#[test]
fn test_interrupt_flag_stops_run() -> anyhow::Result<()> {
    init_logging();
    let region = region(2)?;
    let interrupt = InterruptFlag::new();
    let bursts = Cell::new(0);
    let mut engine = FuzzyHammerer::builder(&region, small_geometry()?)
        .config(config())
        .interrupt(interrupt.clone())
        .hammerer_factory(|job: HammerJob| {
            bursts.set(bursts.get() + 1);
            if bursts.get() == 2 {
                // as if a signal handler fired during the second burst
                interrupt.raise();
                return flip_first(&job).interrupted_after(1);
            }
            flip_first(&job)
        })
        .build()?;
    let report = engine.run()?;

    assert_eq!(bursts.get(), 2);
    assert_eq!(report.stats.patterns, 1);
    assert_eq!(report.stats.interrupted_bursts, 1);
    // the first location flipped, but the pattern never finished
    assert!(report.summary.hammering_patterns.is_empty());
    assert!(report.sweeps.is_empty());
    assert_clean(&region);
    Ok(())
}

#[test]
fn test_replay_of_saved_summary() -> anyhow::Result<()> {
    init_logging();
    let region = region(3)?;
    let config = FuzzConfig {
        sweep: false,
        minisweep_rows: 0,
        ..config()
    };
    let mut fuzzer = FuzzyHammerer::builder(&region, small_geometry()?)
        .config(config.clone())
        .hammerer_factory(|job: HammerJob| flip_first(&job))
        .build()?;
    let fuzzed = fuzzer.run()?;
    assert!(fuzzed.sweeps.is_empty());

    let path = std::env::temp_dir().join(format!("anvil-replay-{}.json", std::process::id()));
    fuzzed.summary.to_jsonfile(&path)?;
    let loaded = FuzzSummary::from_jsonfile(&path)?;
    assert_eq!(loaded, fuzzed.summary);

    let wanted = loaded.hammering_patterns[1].id.clone();
    let mut replayer = FuzzyHammerer::builder(&region, small_geometry()?)
        .config(FuzzConfig {
            mode: Mode::Replay {
                path: path.clone(),
                pattern_ids: vec![wanted.clone()],
            },
            replay_rounds: 2,
            sweep: true,
            sweep_rows: 3,
            ..config
        })
        .hammerer_factory(|job: HammerJob| flip_first(&job))
        .build()?;
    let replayed = replayer.run()?;
    std::fs::remove_file(&path)?;

    let patterns = &replayed.summary.hammering_patterns;
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].id, wanted);
    assert_eq!(patterns[0].address_mappings.len(), 1);
    assert_eq!(patterns[0].address_mappings[0].reproducibility_score, 1.0);
    assert_eq!(replayed.best.as_ref().map(|b| b.num_bit_flips), Some(2));
    assert_eq!(replayed.sweeps.len(), 1);
    assert_eq!(replayed.sweeps[0].total_flips, 3);
    assert_clean(&region);
    Ok(())
}

#[test]
fn test_replay_ignores_interrupted_rounds() -> anyhow::Result<()> {
    init_logging();
    let region = region(6)?;
    let config = FuzzConfig {
        sweep: false,
        minisweep_rows: 0,
        ..config()
    };
    let mut fuzzer = FuzzyHammerer::builder(&region, small_geometry()?)
        .config(config.clone())
        .hammerer_factory(|job: HammerJob| flip_first(&job))
        .build()?;
    let fuzzed = fuzzer.run()?;
    let path = std::env::temp_dir().join(format!("anvil-replay-int-{}.json", std::process::id()));
    fuzzed.summary.to_jsonfile(&path)?;
    let wanted = fuzzed.summary.hammering_patterns[0].id.clone();

    // every second burst is cut short, every completed one flips
    let bursts = Cell::new(0);
    let mut replayer = FuzzyHammerer::builder(&region, small_geometry()?)
        .config(FuzzConfig {
            mode: Mode::Replay {
                path: path.clone(),
                pattern_ids: vec![wanted],
            },
            replay_rounds: 2,
            ..config
        })
        .hammerer_factory(|job: HammerJob| {
            bursts.set(bursts.get() + 1);
            if bursts.get() % 2 == 0 {
                flip_first(&job).interrupted_after(1)
            } else {
                flip_first(&job)
            }
        })
        .build()?;
    let replayed = replayer.run()?;
    std::fs::remove_file(&path)?;

    // two mappings, two rounds each
    assert_eq!(bursts.get(), 4);
    assert_eq!(replayed.stats.interrupted_bursts, 2);
    let mapping = &replayed.summary.hammering_patterns[0].address_mappings[0];
    assert_eq!(mapping.reproducibility_score, 1.0);
    assert_eq!(replayed.best.as_ref().map(|b| b.num_bit_flips), Some(1));
    assert_clean(&region);
    Ok(())
}

#[test]
fn test_replay_of_unknown_pattern_fails() -> anyhow::Result<()> {
    let region = region(4)?;
    let path = std::env::temp_dir().join(format!("anvil-empty-{}.json", std::process::id()));
    FuzzSummary::default().to_jsonfile(&path)?;
    let mut engine = FuzzyHammerer::builder(&region, small_geometry()?)
        .config(FuzzConfig {
            mode: Mode::Replay {
                path: path.clone(),
                pattern_ids: vec!["missing".into()],
            },
            ..config()
        })
        .hammerer_factory(|job: HammerJob| flip_first(&job))
        .build()?;
    let result = engine.run();
    std::fs::remove_file(&path)?;
    assert!(matches!(result, Err(FuzzError::Pattern(_))));
    Ok(())
}

#[test]
fn test_builder_checks() -> anyhow::Result<()> {
    let region = region(5)?;
    let geometry = small_geometry()?;

    let missing_timer = FuzzyHammerer::builder(&region, geometry)
        .config(FuzzConfig {
            probe_strategy: ProbeStrategy::ConflictSearch,
            ..config()
        })
        .hammerer_factory(|job: HammerJob| flip_first(&job))
        .build();
    assert!(matches!(missing_timer, Err(FuzzError::MissingTimer)));

    let missing_factory = FuzzyHammerer::<Dummy>::builder(&region, geometry)
        .config(config())
        .build();
    assert!(matches!(missing_factory, Err(FuzzError::MissingHammerer)));

    let invalid = FuzzyHammerer::builder(&region, geometry)
        .config(FuzzConfig {
            max_row: 1 << 20,
            ..config()
        })
        .hammerer_factory(|job: HammerJob| flip_first(&job))
        .build();
    assert!(matches!(invalid, Err(FuzzError::Config(_))));
    Ok(())
}

#[test]
fn test_dimm_config() -> anyhow::Result<()> {
    let config = BlacksmithConfig::from_jsonfile(CONFIG_FILE)?;
    let mem_config = config.mem_config()?;
    assert_eq!(mem_config.get_bank_count(), 32);
    assert_eq!(mem_config.get_row_count(), 4096);
    assert_eq!(mem_config.bank_function_period(), 512);
    Ok(())
}
