use crate::ConfigError;
use anvil_core::util::REF_INTERVAL_US;
use log::{debug, info, warn};
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Inclusive range a fuzzing parameter is drawn from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRange {
    /// Smallest value
    pub min: usize,
    /// Largest value
    pub max: usize,
}

impl ParamRange {
    /// Creates the range `min..=max`.
    pub const fn new(min: usize, max: usize) -> Self {
        ParamRange { min, max }
    }

    /// Draws a uniform value.
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        rng.random_range(self.min..=self.max.max(self.min))
    }
}

/// Operator-tunable bounds of the pattern search space.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FuzzingRanges {
    /// Activations per refresh interval, when not fixed
    pub acts_per_ref: ParamRange,
    /// Aggressors per frequency group; `max` is exclusive for the weighted draw
    pub n_sided: ParamRange,
    /// Relative weights of each group size
    pub n_sided_weights: Vec<(usize, u32)>,
    /// Upper amplitude bound as a multiple of `acts_per_ref`
    pub amplitude_factor: usize,
    /// Distinct aggressors per pattern
    pub num_aggressors: ParamRange,
    /// Exponent of the number of refresh intervals one pattern spans
    pub refresh_intervals_exp: ParamRange,
    /// Row distance between two aggressor tuples
    pub agg_inter_distance: ParamRange,
    /// Row distance within an aggressor tuple
    pub agg_intra_distance: usize,
    /// First row of sequential mappings
    pub start_row: ParamRange,
    /// Refresh intervals of random accesses before a burst
    pub wait_until_start_hammering_refs: ParamRange,
    /// Activations per burst
    pub hammering_total_num_activations: usize,
    /// Lower bound of the base period
    pub min_base_period: usize,
}

impl Default for FuzzingRanges {
    fn default() -> Self {
        let n_sided = ParamRange::new(2, 12);
        FuzzingRanges {
            acts_per_ref: ParamRange::new(20, 100),
            n_sided,
            n_sided_weights: (n_sided.min..n_sided.max).map(|k| (k, 100)).collect(),
            amplitude_factor: 4,
            num_aggressors: ParamRange::new(4, 64),
            refresh_intervals_exp: ParamRange::new(2, 6),
            agg_inter_distance: ParamRange::new(2, 12),
            agg_intra_distance: 2,
            start_row: ParamRange::new(0, 32),
            wait_until_start_hammering_refs: ParamRange::new(10, 128),
            hammering_total_num_activations: 10_000_000,
            min_base_period: 4,
        }
    }
}

/// Parameters of the pattern currently being generated.
///
/// [`randomize`](FuzzingParameterSet::randomize) draws the per-pattern values;
/// the `get_random_*` methods draw per-group and per-probe values.
#[derive(Debug, Clone)]
pub struct FuzzingParameterSet {
    ranges: FuzzingRanges,
    fixed_acts_per_ref: Option<usize>,
    n_sided_dist: WeightedIndex<u32>,
    /// Activations per refresh interval (even)
    pub acts_per_ref: usize,
    /// Distinct aggressors of the pattern
    pub num_aggressors: usize,
    /// Refresh intervals one pattern repetition spans (power of two)
    pub num_refresh_intervals: usize,
    /// Slots of one pattern repetition
    pub total_acts_pattern: usize,
    /// Slots per base period
    pub base_period: usize,
    /// Row distance between aggressor tuples
    pub agg_inter_distance: usize,
    /// Row distance within an aggressor tuple
    pub agg_intra_distance: usize,
    /// Activations per burst
    pub hammering_total_num_activations: usize,
}

impl FuzzingParameterSet {
    /// Creates a parameter set and draws initial values.
    pub fn new<R: Rng + ?Sized>(
        ranges: FuzzingRanges,
        fixed_acts_per_ref: Option<usize>,
        rng: &mut R,
    ) -> Result<Self, ConfigError> {
        let mut weights = vec![0; ranges.n_sided.max + 1];
        for &(k, w) in &ranges.n_sided_weights {
            let slot = weights.get_mut(k).ok_or_else(|| ConfigError::InvalidParameter {
                name: "n_sided_weights",
                reason: format!("group size {} exceeds n_sided.max {}", k, ranges.n_sided.max),
            })?;
            *slot = w;
        }
        let n_sided_dist =
            WeightedIndex::new(&weights).map_err(|e| ConfigError::InvalidParameter {
                name: "n_sided_weights",
                reason: e.to_string(),
            })?;
        if fixed_acts_per_ref.is_some_and(|acts| acts < 2) {
            return Err(ConfigError::InvalidParameter {
                name: "acts_per_ref",
                reason: "must be at least 2".into(),
            });
        }

        let mut params = FuzzingParameterSet {
            agg_intra_distance: ranges.agg_intra_distance,
            hammering_total_num_activations: ranges.hammering_total_num_activations,
            ranges,
            fixed_acts_per_ref,
            n_sided_dist,
            acts_per_ref: 0,
            num_aggressors: 0,
            num_refresh_intervals: 0,
            total_acts_pattern: 0,
            base_period: 0,
            agg_inter_distance: 0,
        };
        params.randomize(rng);
        Ok(params)
    }

    /// Draws new per-pattern values.
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let acts = self
            .fixed_acts_per_ref
            .unwrap_or_else(|| self.ranges.acts_per_ref.random(rng));
        // pattern generation needs an even slot count per refresh interval
        self.acts_per_ref = acts - acts % 2;
        self.num_aggressors = self.ranges.num_aggressors.random(rng);
        self.num_refresh_intervals = 1 << self.ranges.refresh_intervals_exp.random(rng);
        self.total_acts_pattern = self.acts_per_ref * self.num_refresh_intervals;
        self.base_period =
            get_random_even_divisor(self.total_acts_pattern, self.ranges.min_base_period, rng);
        self.agg_inter_distance = self.ranges.agg_inter_distance.random(rng);
        debug!(
            "acts_per_ref {}, num_aggressors {}, num_refresh_intervals {}, total_acts_pattern {}, base_period {}, agg_inter_distance {}",
            self.acts_per_ref,
            self.num_aggressors,
            self.num_refresh_intervals,
            self.total_acts_pattern,
            self.base_period,
            self.agg_inter_distance
        );
    }

    /// Logs the values that stay fixed for the whole run.
    pub fn log_static_parameters(&self) {
        info!("agg_intra_distance: {}", self.agg_intra_distance);
        info!("N_sided weights: {:?}", self.ranges.n_sided_weights);
        info!(
            "hammering_total_num_activations: {}",
            self.hammering_total_num_activations
        );
        match self.fixed_acts_per_ref {
            Some(acts) => info!("acts_per_ref: {} (fixed)", acts),
            None => info!("acts_per_ref: randomized per pattern"),
        }
    }

    /// Base periods per pattern repetition.
    pub fn num_base_periods(&self) -> usize {
        self.total_acts_pattern / self.base_period.max(1)
    }

    /// Draws a group size not larger than `upper_bound`.
    pub fn get_random_n_sided<R: Rng + ?Sized>(&self, upper_bound: usize, rng: &mut R) -> usize {
        if self.ranges.n_sided.max > upper_bound {
            return ParamRange::new(self.ranges.n_sided.min.min(upper_bound), upper_bound)
                .random(rng);
        }
        self.n_sided_dist.sample(rng)
    }

    /// Draws an amplitude not larger than `max`.
    pub fn get_random_amplitude<R: Rng + ?Sized>(&self, max: usize, rng: &mut R) -> i32 {
        let upper = (self.acts_per_ref * self.ranges.amplitude_factor).min(max).max(1);
        ParamRange::new(1, upper).random(rng) as i32
    }

    /// Whether the next mapping places tuples sequentially.
    pub fn get_random_use_seq_addresses<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.random_bool(0.5)
    }

    /// First row of a sequential mapping.
    pub fn get_random_start_row<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        self.ranges.start_row.random(rng)
    }

    /// Microseconds of random accesses before a burst.
    pub fn get_random_wait_until_start_hammering_us<R: Rng + ?Sized>(&self, rng: &mut R) -> u128 {
        let refs = self.ranges.wait_until_start_hammering_refs.random(rng);
        (refs as f64 * REF_INTERVAL_US) as u128
    }
}

/// Returns a random even divisor of `n` that is at least `min_value`, or `n`
/// itself when there is none.
pub fn get_random_even_divisor<R: Rng + ?Sized>(n: usize, min_value: usize, rng: &mut R) -> usize {
    let mut divisors: Vec<usize> = (1..=n)
        .take_while(|i| i * i <= n)
        .filter(|i| n % i == 0)
        .flat_map(|i| [i, n / i])
        .filter(|d| d % 2 == 0)
        .collect();
    divisors.dedup();
    divisors.shuffle(rng);
    divisors
        .into_iter()
        .find(|&d| d >= min_value)
        .unwrap_or_else(|| {
            warn!("no even divisor of {} >= {}, using {}", n, min_value, n);
            n
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn test_even_divisor() {
        let mut rng = StdRng::seed_from_u64(1);
        for n in [8usize, 36, 76, 152, 400, 1600] {
            for _ in 0..32 {
                let d = get_random_even_divisor(n, 4, &mut rng);
                assert_eq!(n % d, 0);
                assert_eq!(d % 2, 0);
                assert!(d >= 4);
            }
        }
        assert_eq!(get_random_even_divisor(2, 4, &mut rng), 2);
    }

    #[test]
    fn test_randomized_values_respect_ranges() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let mut params = FuzzingParameterSet::new(FuzzingRanges::default(), None, &mut rng)?;
        for _ in 0..200 {
            params.randomize(&mut rng);
            assert_eq!(params.acts_per_ref % 2, 0);
            assert!((20..=100).contains(&params.acts_per_ref));
            assert!((4..=64).contains(&params.num_aggressors));
            assert!([4, 8, 16, 32, 64].contains(&params.num_refresh_intervals));
            assert_eq!(params.total_acts_pattern % params.base_period, 0);
            assert!(params.base_period >= 4);
            assert!((2..=12).contains(&params.agg_inter_distance));
        }
        Ok(())
    }

    #[test]
    fn test_fixed_acts_is_made_even() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let params = FuzzingParameterSet::new(FuzzingRanges::default(), Some(77), &mut rng)?;
        assert_eq!(params.acts_per_ref, 76);
        Ok(())
    }

    #[test]
    fn test_bounded_draws() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let params = FuzzingParameterSet::new(FuzzingRanges::default(), Some(40), &mut rng)?;
        for _ in 0..500 {
            let n = params.get_random_n_sided(3, &mut rng);
            assert!((2..=3).contains(&n));
            let n = params.get_random_n_sided(64, &mut rng);
            assert!((2..12).contains(&n));
            let amp = params.get_random_amplitude(5, &mut rng);
            assert!((1..=5).contains(&amp));
        }
        Ok(())
    }

    #[test]
    fn test_invalid_weights() {
        let mut rng = StdRng::seed_from_u64(5);
        let ranges = FuzzingRanges {
            n_sided_weights: vec![(2, 0), (3, 0)],
            ..Default::default()
        };
        assert!(matches!(
            FuzzingParameterSet::new(ranges, None, &mut rng),
            Err(ConfigError::InvalidParameter { name: "n_sided_weights", .. })
        ));
    }
}
