//! Frequency-based hammering patterns.
//!
//! A [`HammeringPattern`] is a schedule of symbolic [`Aggressor`]s built from
//! [`AggressorAccessPattern`] groups. Patterns carry no addresses; a
//! [`PatternAddressMapper`](crate::PatternAddressMapper) binds them to rows.

mod access_pattern;
mod aggressor;
mod builder;
mod hammering_pattern;
mod params;

pub use self::access_pattern::AggressorAccessPattern;
pub use self::aggressor::{Aggressor, AggressorId, create_aggressors, get_agg_ids};
pub use self::builder::PatternBuilder;
pub use self::hammering_pattern::{FuzzMetadata, FuzzSummary, HammeringPattern, PatternLoadError};
pub use self::params::{FuzzingParameterSet, FuzzingRanges, ParamRange, get_random_even_divisor};

use rand::Rng;

/// Random UUID v4 drawn from `rng`, so seeded runs reproduce their ids.
pub fn new_pattern_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    uuid::Builder::from_random_bytes(rng.random())
        .into_uuid()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::new_pattern_id;
    use rand::{SeedableRng, rngs::StdRng};
    use uuid::{Uuid, Version};

    #[test]
    fn test_pattern_id_format() {
        let mut rng = StdRng::seed_from_u64(9);
        let id = new_pattern_id(&mut rng);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(parts[2].starts_with('4'));
        assert!(matches!(&parts[3][..1], "8" | "9" | "a" | "b"));
        assert_ne!(new_pattern_id(&mut rng), id);

        let parsed = Uuid::parse_str(&id).expect("valid uuid");
        assert_eq!(parsed.get_version(), Some(Version::Random));
        assert_eq!(new_pattern_id(&mut StdRng::seed_from_u64(9)), id);
    }
}
