use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Identifier type of an [`Aggressor`].
pub type AggressorId = i32;

/// A symbolic participant of a hammering pattern.
///
/// Aggressors carry no location; a [`PatternAddressMapper`](crate::PatternAddressMapper)
/// binds them to rows per probe. Identity is the id alone, and the reserved id
/// `-1` marks an empty slot.
#[derive(Serialize, Deserialize, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Aggressor {
    /// Aggressor id
    pub id: AggressorId,
}

impl Aggressor {
    /// Sentinel for "no aggressor".
    pub const EMPTY: Aggressor = Aggressor { id: -1 };

    /// Creates an aggressor with the given id.
    pub const fn new(id: AggressorId) -> Self {
        Aggressor { id }
    }

    /// Whether this is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl Default for Aggressor {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Display for Aggressor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.is_empty() {
            write!(f, "EMPTY")
        } else {
            write!(f, "agg{:02}", self.id)
        }
    }
}

/// Turns an ordered id sequence into aggressors. Repeated ids yield equal
/// aggressors.
pub fn create_aggressors(ids: &[AggressorId]) -> Vec<Aggressor> {
    ids.iter().copied().map(Aggressor::new).collect()
}

/// Extracts the ids of `aggressors`, preserving order.
pub fn get_agg_ids(aggressors: &[Aggressor]) -> Vec<AggressorId> {
    aggressors.iter().map(|a| a.id).collect()
}

/// Serializes a list of aggressors as plain ids.
pub(crate) mod id_list {
    use super::{Aggressor, AggressorId, create_aggressors, get_agg_ids};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(aggs: &[Aggressor], s: S) -> Result<S::Ok, S::Error> {
        get_agg_ids(aggs).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Aggressor>, D::Error> {
        let ids = Vec::<AggressorId>::deserialize(d)?;
        Ok(create_aggressors(&ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Aggressor::default().to_string(), "EMPTY");
        assert_eq!(Aggressor::new(7).to_string(), "agg07");
        assert_eq!(Aggressor::new(12).to_string(), "agg12");
        assert_eq!(Aggressor::new(123).to_string(), "agg123");
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let ids = vec![3, 4, 3, 9, 9];
        let aggs = create_aggressors(&ids);
        assert_eq!(aggs[0], aggs[2]);
        assert_eq!(get_agg_ids(&aggs), ids);
        assert_eq!(create_aggressors(&get_agg_ids(&aggs)), aggs);
    }

    #[test]
    fn test_json_record() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&Aggressor::new(5))?, r#"{"id":5}"#);
        let agg: Aggressor = serde_json::from_str(r#"{ "id": -1 }"#)?;
        assert!(agg.is_empty());
        Ok(())
    }
}
