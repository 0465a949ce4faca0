use super::{Aggressor, AggressorAccessPattern, FuzzingParameterSet, HammeringPattern, new_pattern_id};
use log::{debug, trace};
use rand::Rng;
use std::f64::consts::PI;

/// Builds frequency-based hammering patterns.
///
/// The first base period is walked slot by slot. Every free slot starts a new
/// group whose period is the base period times a power of two; further groups
/// of the same shape are added until the slot is taken in every base period
/// of the pattern.
pub struct PatternBuilder<'a> {
    params: &'a FuzzingParameterSet,
    accesses: Vec<Aggressor>,
    groups: Vec<AggressorAccessPattern>,
    next_id: i32,
}

impl<'a> PatternBuilder<'a> {
    /// Generates a new pattern from the current values of `params`.
    pub fn generate<R: Rng + ?Sized>(params: &'a FuzzingParameterSet, rng: &mut R) -> HammeringPattern {
        let mut builder = PatternBuilder {
            params,
            accesses: vec![Aggressor::EMPTY; params.total_acts_pattern],
            groups: vec![],
            next_id: 0,
        };
        builder.fill_pattern(rng);

        let mut pattern = HammeringPattern::new(new_pattern_id(rng));
        pattern.base_period = params.base_period;
        pattern.max_period = builder.groups.iter().map(|g| g.frequency).max().unwrap_or(0);
        pattern.total_activations = params.total_acts_pattern;
        pattern.num_refresh_intervals = params.num_refresh_intervals;
        pattern.access_ids = builder.accesses;
        pattern.agg_access_patterns = builder.groups;
        debug!(
            "generated pattern {} with {} groups, {} aggressors",
            pattern.id,
            pattern.agg_access_patterns.len(),
            builder.next_id
        );
        pattern
    }

    fn fill_pattern<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let base_period = self.params.base_period;
        if base_period == 0 || self.accesses.is_empty() {
            return;
        }
        let num_base_periods = self.params.num_base_periods();
        let allowed_multipliers: Vec<usize> = (0..usize::BITS)
            .map(|exp| 1usize << exp)
            .take_while(|&m| m <= num_base_periods.max(1))
            .collect();

        for k in 0..base_period {
            if !self.accesses[k].is_empty() {
                continue;
            }
            let mut multipliers = allowed_multipliers.clone();
            let slots_left = base_period - k;
            let num_aggressors = if slots_left == 1 {
                1
            } else {
                self.params.get_random_n_sided(slots_left, rng).max(1)
            };
            let amplitude = if num_aggressors == 1 {
                1
            } else {
                self.params
                    .get_random_amplitude(slots_left / num_aggressors, rng)
            };

            let mut start = k;
            loop {
                let multiplier = multipliers[random_gaussian_index(multipliers.len(), rng)];
                multipliers.retain(|&m| m >= multiplier);
                let period = base_period * multiplier;
                let aggressors = self.fresh_aggressors(num_aggressors);
                trace!(
                    "slot {}: {} aggressors, period {}, amplitude {}",
                    start, num_aggressors, period, amplitude
                );
                self.fill_slots(start, period, amplitude as usize, &aggressors);
                self.groups.push(AggressorAccessPattern::new(
                    period, amplitude, &aggressors, start,
                ));
                match self.next_empty_slot(k) {
                    Some(next) => start = next,
                    None => break,
                }
            }
        }
    }

    fn fresh_aggressors(&mut self, n: usize) -> Vec<Aggressor> {
        let aggressors = (0..n as i32)
            .map(|i| Aggressor::new(self.next_id + i))
            .collect();
        self.next_id += n as i32;
        aggressors
    }

    /// Writes `amplitude` back-to-back invocations of `aggressors` every
    /// `period` slots from `start`. Invocations whose first slot is taken are
    /// skipped so groups never overwrite each other.
    fn fill_slots(&mut self, start: usize, period: usize, amplitude: usize, aggressors: &[Aggressor]) {
        let len = self.accesses.len();
        for idx in (start..len).step_by(period) {
            if !self.accesses[idx].is_empty() {
                continue;
            }
            let invocation = (0..amplitude).flat_map(|_| aggressors.iter().copied());
            for (offset, agg) in invocation.enumerate() {
                match self.accesses.get_mut(idx + offset) {
                    Some(slot) => *slot = agg,
                    None => return,
                }
            }
        }
    }

    /// First slot at phase `offset` that is still empty in any base period.
    fn next_empty_slot(&self, offset: usize) -> Option<usize> {
        (offset..self.accesses.len())
            .step_by(self.params.base_period)
            .find(|&idx| self.accesses[idx].is_empty())
    }
}

/// Draws an index of a list of length `len` from a normal distribution
/// centered on the middle element, rejecting draws outside the list.
fn random_gaussian_index<R: Rng + ?Sized>(len: usize, rng: &mut R) -> usize {
    if len <= 1 {
        return 0;
    }
    let mean = (if len % 2 == 0 { len / 2 - 1 } else { (len - 1) / 2 }) as f64;
    loop {
        // Box-Muller
        let u1: f64 = 1.0 - rng.random::<f64>();
        let u2: f64 = rng.random();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        let idx = (mean + z).trunc();
        if idx >= 0.0 && (idx as usize) < len {
            return idx as usize;
        }
    }
}
