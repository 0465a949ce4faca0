use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anvil_bin::init_logging_with_progress;
use anvil_blacksmith::{
    BlacksmithConfig, FuzzConfig, FuzzReport, FuzzyHammerer, HammerJob, Mode, ProbeStrategy,
    SyncHammerer,
};
use anvil_core::memory::{
    BytePointer, DRAMAddr, DataPattern, HammerRegion, RegionConfig, construct_memory_tuple_timer,
};
use anvil_core::timing::{ActCountConfig, NativeTiming, count_acts_per_ref};
use anvil_core::util::{DEFAULT_BASE_ADDR, Size, TIMER_ROUNDS};
use anvil_core::InterruptFlag;
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

/// CLI arguments for the `fuzz` binary.
#[derive(Debug, Parser)]
struct CliArgs {
    /// The `blacksmith` config file describing the DIMM.
    #[clap(long = "config", default_value = "config/bs-config.json")]
    config: PathBuf,
    /// Run parameters as JSON; unset fields keep their defaults.
    #[clap(long = "fuzz-config")]
    fuzz_config: Option<PathBuf>,
    /// The runtime limit in minutes.
    #[clap(long = "runtime-limit")]
    runtime_limit: Option<u64>,
    /// Stop after this many patterns.
    #[clap(long = "max-patterns")]
    max_patterns: Option<usize>,
    /// Fixed activations per refresh interval.
    #[clap(long = "acts-per-ref")]
    acts_per_ref: Option<usize>,
    /// Measure the activations per refresh interval before fuzzing.
    #[clap(long = "measure-acts")]
    measure_acts: bool,
    /// Bind aggressors with the row-conflict side channel.
    #[clap(long = "conflict-search")]
    conflict_search: bool,
    /// Calibrate the row-conflict threshold instead of using the config value.
    #[clap(long = "calibrate-threshold")]
    calibrate_threshold: bool,
    /// Replay patterns from this fuzzing summary instead of fuzzing.
    #[clap(long = "replay")]
    replay: Option<PathBuf>,
    /// Patterns to replay (all when empty).
    #[clap(long = "pattern-ids", value_delimiter = ',')]
    pattern_ids: Vec<String>,
    /// Skip the sweep of the best pattern.
    #[clap(long = "no-sweep")]
    no_sweep: bool,
    /// Keep mappings without flips in the summary.
    #[clap(long = "record-all")]
    record_all: bool,
    /// Operator-supplied DIMM identifier.
    #[clap(long = "dimm-id")]
    dimm_id: Option<u32>,
    /// Size of the hammered region, e.g. `1GB`.
    #[clap(long = "size", default_value = "1GB")]
    size: Size,
    /// Fixed virtual base address of the region.
    #[clap(long = "base-addr", value_parser = parse_hex, default_value_t = DEFAULT_BASE_ADDR)]
    base_addr: usize,
    /// Back the region with 4 KiB pages.
    #[clap(long = "no-huge-pages")]
    no_huge_pages: bool,
    /// Map a file on hugetlbfs instead of anonymous huge pages.
    #[clap(long = "hugetlbfs-path")]
    hugetlbfs_path: Option<PathBuf>,
    /// Seed of the engine's random generator.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Output file for the fuzzing summary (JSON format).
    #[clap(long = "output", default_value = "fuzz-summary.json")]
    output: PathBuf,
    /// Output file for the full report (JSON format).
    #[clap(long = "report")]
    report: Option<PathBuf>,
}

fn parse_hex(s: &str) -> Result<usize, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn fuzz_config(args: &CliArgs, bs_config: &BlacksmithConfig) -> Result<FuzzConfig> {
    let mut config = match &args.fuzz_config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            serde_json::from_reader(file).with_context(|| format!("parsing {}", path.display()))?
        }
        None => FuzzConfig::default(),
    };
    config.num_ranks = bs_config.ranks as usize;
    config.max_row = config.max_row.min(bs_config.max_rows as usize);
    config.conflict.threshold = bs_config.threshold;
    config.use_huge_pages = !args.no_huge_pages;
    config.record_all |= args.record_all;
    config.sweep &= !args.no_sweep;
    if let Some(minutes) = args.runtime_limit {
        config.runtime_limit = Duration::from_secs(minutes * 60);
    }
    if args.max_patterns.is_some() {
        config.max_patterns = args.max_patterns;
    }
    if args.acts_per_ref.is_some() {
        config.acts_per_ref = args.acts_per_ref;
    }
    if args.conflict_search {
        config.probe_strategy = ProbeStrategy::ConflictSearch;
    }
    if args.dimm_id.is_some() {
        config.dimm_id = args.dimm_id;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(path) = &args.replay {
        config.mode = Mode::Replay {
            path: path.clone(),
            pattern_ids: args.pattern_ids.clone(),
        };
    }
    Ok(config)
}

fn save_json<T: serde::Serialize>(value: &T, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    info!("Results saved to {}", path.display());
    Ok(())
}

fn log_report(report: &FuzzReport) {
    let stats = &report.stats;
    info!("=== FUZZING SUMMARY ===");
    info!("Patterns: {}", stats.patterns);
    info!(
        "Probes: {} ({} effective, {} abandoned)",
        stats.probes, stats.effective_probes, stats.abandoned_probes
    );
    info!(
        "Bursts: {} ({} without REFRESH sync, {} interrupted)",
        stats.bursts, stats.sync_failures, stats.interrupted_bursts
    );
    info!("Bit flips: {}", stats.total_flips);
    info!(
        "Effective patterns: {}",
        report.summary.hammering_patterns.len()
    );
    if let Some(best) = &report.best {
        info!(
            "Best pattern: {} (mapping {}, {} flips)",
            best.pattern_id, best.mapping_id, best.num_bit_flips
        );
    }
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;
    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    let bs_config = BlacksmithConfig::from_jsonfile(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mem_config = bs_config.mem_config()?;
    info!(
        "DIMM {}: {} banks, {} rows, bank function period {}",
        bs_config.name,
        mem_config.get_bank_count(),
        mem_config.get_row_count(),
        mem_config.bank_function_period()
    );
    let mut config = fuzz_config(&args, &bs_config)?;

    let region = HammerRegion::initialize(&RegionConfig {
        base_addr: args.base_addr,
        size: args.size,
        use_huge_pages: config.use_huge_pages,
        hugetlbfs_path: args.hugetlbfs_path.clone(),
        fill: DataPattern::random(),
    })?;
    let timer = construct_memory_tuple_timer()?;

    if args.calibrate_threshold {
        let mut rng = rand::rng();
        config.conflict.threshold = region.calibrate_conflict_threshold(
            timer.as_ref(),
            mem_config.get_bank_count(),
            1000,
            TIMER_ROUNDS,
            &mut rng,
        )?;
    }
    if args.measure_acts && config.acts_per_ref.is_none() {
        let base = region.ptr() as *const u8;
        let a = DRAMAddr::new(0, 0, 0).to_virt(base, &mem_config)?;
        let b = DRAMAddr::new(0, 1, 0).to_virt(base, &mem_config)?;
        let timing = NativeTiming::default();
        match unsafe { count_acts_per_ref(&timing, a, b, &ActCountConfig::default()) } {
            Ok(acts) => {
                info!("Measured {} activations per refresh interval", acts);
                config.acts_per_ref = Some(acts);
            }
            Err(e) => warn!("Could not measure activations per refresh interval: {}", e),
        }
    }

    let interrupt = InterruptFlag::new();
    let handler_flag = interrupt.clone();
    ctrlc::set_handler(move || {
        handler_flag.raise();
    })
    .context("ctrlc setup failed")?;

    let sync = config.sync;
    let hammer_flag = interrupt.clone();
    let mut engine = FuzzyHammerer::builder(&region, mem_config)
        .config(config)
        .hammerer_factory(move |job: HammerJob| {
            SyncHammerer::new(job, NativeTiming::default(), sync, hammer_flag.clone())
        })
        .timer(timer.as_ref())
        .progress(progress)
        .interrupt(interrupt)
        .build()?;
    let report = engine.run()?;
    drop(engine);
    region.teardown();

    log_report(&report);
    save_json(&report.summary, &args.output)?;
    if let Some(path) = &args.report {
        save_json(&report, path)?;
    }
    Ok(())
}
