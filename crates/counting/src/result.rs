//! Divergence classification of a single count observation.

use core::fmt;
use core::str::FromStr;

use countsync_core::DomainError;
use serde::{Deserialize, Serialize};

/// Outcome of comparing a counted quantity with the expected stock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CountResult {
    /// Counted quantity equals the expected quantity.
    #[serde(rename = "correto")]
    Correct,
    /// Fewer units found than expected.
    #[serde(rename = "falta")]
    Short,
    /// More units found than expected; a second count is required.
    #[serde(rename = "sobra")]
    Surplus,
    /// The counter explicitly discarded the slot.
    #[serde(rename = "descartado")]
    Discarded,
}

impl CountResult {
    /// Classify an observation.
    ///
    /// Strict three-way comparison, no tolerance band. Every place that computes
    /// a result (optimistic projection, reference server) goes through here.
    pub fn classify(expected_qty: u32, counted_qty: u32, discarded: bool) -> Self {
        if discarded {
            return Self::Discarded;
        }
        match counted_qty.cmp(&expected_qty) {
            core::cmp::Ordering::Greater => Self::Surplus,
            core::cmp::Ordering::Less => Self::Short,
            core::cmp::Ordering::Equal => Self::Correct,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correct => "correto",
            Self::Short => "falta",
            Self::Surplus => "sobra",
            Self::Discarded => "descartado",
        }
    }

    pub fn is_surplus(&self) -> bool {
        matches!(self, Self::Surplus)
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded)
    }
}

impl fmt::Display for CountResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CountResult {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "correto" => Ok(Self::Correct),
            "falta" => Ok(Self::Short),
            "sobra" => Ok(Self::Surplus),
            "descartado" => Ok(Self::Discarded),
            other => Err(DomainError::validation(format!("unknown count result '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_match_is_correct() {
        assert_eq!(CountResult::classify(10, 10, false), CountResult::Correct);
    }

    #[test]
    fn discard_wins_over_quantities() {
        assert_eq!(CountResult::classify(10, 12, true), CountResult::Discarded);
        assert_eq!(CountResult::classify(0, 0, true), CountResult::Discarded);
    }

    #[test]
    fn parses_wire_tokens_case_insensitively() {
        assert_eq!("SOBRA".parse::<CountResult>().unwrap(), CountResult::Surplus);
        assert!("meh".parse::<CountResult>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 1000,
            ..ProptestConfig::default()
        })]

        /// Property: classification is exactly the three-way comparison.
        #[test]
        fn classification_matches_three_way_comparison(
            expected in 0u32..10_000,
            counted in 0u32..10_000,
            discarded in any::<bool>()
        ) {
            let result = CountResult::classify(expected, counted, discarded);
            prop_assert_eq!(result == CountResult::Discarded, discarded);
            if !discarded {
                prop_assert_eq!(result == CountResult::Surplus, counted > expected);
                prop_assert_eq!(result == CountResult::Short, counted < expected);
                prop_assert_eq!(result == CountResult::Correct, counted == expected);
            }
        }
    }
}
