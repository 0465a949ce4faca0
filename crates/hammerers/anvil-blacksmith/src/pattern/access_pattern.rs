use super::{Aggressor, AggressorId};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// One frequency group of a [`HammeringPattern`](crate::HammeringPattern).
///
/// The group fires every `frequency` slots starting at `start_offset`; each
/// time it issues its aggressors `amplitude` times back to back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AggressorAccessPattern {
    /// Period in slots between two invocations
    pub frequency: usize,
    /// Consecutive repetitions per invocation
    pub amplitude: i32,
    /// Phase within the base period
    pub start_offset: usize,
    /// Position within an invocation to aggressor
    pub offset_aggressor_map: BTreeMap<AggressorId, Aggressor>,
}

impl AggressorAccessPattern {
    /// Creates a group whose aggressors take positions `0..aggressors.len()`.
    pub fn new(
        frequency: usize,
        amplitude: i32,
        aggressors: &[Aggressor],
        start_offset: usize,
    ) -> Self {
        AggressorAccessPattern {
            frequency,
            amplitude,
            start_offset,
            offset_aggressor_map: aggressors
                .iter()
                .enumerate()
                .map(|(i, &agg)| (i as AggressorId, agg))
                .collect(),
        }
    }

    /// The aggressors in position order.
    pub fn aggressors(&self) -> impl Iterator<Item = Aggressor> + '_ {
        self.offset_aggressor_map.values().copied()
    }

    /// Number of aggressors in this group (the "N" of N-sided).
    pub fn n_sided(&self) -> usize {
        self.offset_aggressor_map.len()
    }
}

impl Display for AggressorAccessPattern {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{{{}}} freq {} amp {} offset {}",
            self.aggressors().join(", "),
            self.frequency,
            self.amplitude,
            self.start_offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::create_aggressors;

    #[test]
    fn test_positions_follow_input_order() {
        let group = AggressorAccessPattern::new(8, 2, &create_aggressors(&[5, 2, 5]), 1);
        assert_eq!(group.n_sided(), 3);
        assert_eq!(
            group.aggressors().collect::<Vec<_>>(),
            create_aggressors(&[5, 2, 5])
        );
        assert_eq!(group.to_string(), "{agg05, agg02, agg05} freq 8 amp 2 offset 1");
    }

    #[test]
    fn test_json_map_of_id_records() -> anyhow::Result<()> {
        let json = r#"{
            "frequency": 16, "amplitude": 1, "start_offset": 4,
            "offset_aggressor_map": { "1": { "id": 9 }, "0": { "id": 8 } }
        }"#;
        let group: AggressorAccessPattern = serde_json::from_str(json)?;
        assert_eq!(
            group.aggressors().collect::<Vec<_>>(),
            create_aggressors(&[8, 9])
        );
        Ok(())
    }
}
