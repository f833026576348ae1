//! Proptest settings shared by the property test modules.
//!
//! Byte-level codec properties are cheap, so they run many cases. Whole-message
//! properties build vectors of records per case and run fewer. Miri interprets every
//! case, so both tiers shrink to a handful there.

use proptest::test_runner::Config as ProptestConfig;

/// Rough cost of one property case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaseWeight {
    /// Reader/writer primitives over a few bytes.
    Field,
    /// Full packets, rosters and RNG streams.
    Message,
}

impl CaseWeight {
    /// Cases to run for a property of this weight.
    pub(crate) const fn cases(self) -> u32 {
        match (self, cfg!(miri)) {
            (Self::Field, false) => 1024,
            (Self::Message, false) => 256,
            (Self::Field, true) => 8,
            (Self::Message, true) => 4,
        }
    }
}

/// Proptest config for a property of the given weight.
///
/// Shrinking is capped so a failing message property reports quickly.
pub(crate) fn proptest_config(weight: CaseWeight) -> ProptestConfig {
    ProptestConfig {
        cases: weight.cases(),
        max_shrink_iters: 512,
        ..ProptestConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_properties_run_more_cases_than_message_properties() {
        assert!(CaseWeight::Field.cases() > CaseWeight::Message.cases());
    }

    #[test]
    fn config_carries_weighted_case_count() {
        let config = proptest_config(CaseWeight::Message);
        assert_eq!(config.cases, CaseWeight::Message.cases());
        assert_eq!(config.max_shrink_iters, 512);
    }

    #[test]
    fn miri_shrinks_case_counts() {
        if cfg!(miri) {
            assert!(CaseWeight::Field.cases() <= 8);
        } else {
            assert_eq!(CaseWeight::Field.cases(), 1024);
            assert_eq!(CaseWeight::Message.cases(), 256);
        }
    }
}
