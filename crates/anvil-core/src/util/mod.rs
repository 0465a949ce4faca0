//! Utility functions and types used throughout Anvil.
//!
//! This module provides various helper types and traits including:
//! - [`Size`] - Memory size representation
//! - Constants for memory operations ([`PAGE_SIZE`], [`ROW_SIZE`], etc.)
//! - [`GroupBy`] trait for collection grouping operations
//! - Progress reporting utilities ([`NamedProgress`])
//! - Random number generation ([`Rng`])

mod constants;
mod named_progress;
mod rng;
mod size;

pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::rng::Rng;
pub use self::size::{ParseSizeError, Size};

use std::collections::BTreeMap;

/// Trait for grouping collection elements by a key function.
///
/// Groups come back ordered by key, so reports built from them are stable.
pub trait GroupBy<V> {
    /// Groups elements by the result of applying a function to each element.
    fn group_by<K: Ord, F: Fn(&V) -> K>(self, f: F) -> BTreeMap<K, Vec<V>>;
}

impl<T> GroupBy<T> for Vec<T> {
    fn group_by<K: Ord, F: Fn(&T) -> K>(self, f: F) -> BTreeMap<K, Vec<T>> {
        let mut out = BTreeMap::new();
        for elem in self {
            let k = f(&elem);
            out.entry(k).or_insert_with(Vec::new).push(elem);
        }
        out
    }
}

/// Median of a set of samples. Returns 0 for an empty set.
///
/// ```
/// use anvil_core::util::median;
///
/// assert_eq!(median(vec![5, 1, 9]), 5);
/// assert_eq!(median(vec![]), 0);
/// ```
pub fn median(mut samples: Vec<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();
    samples[samples.len() / 2]
}
