//! Volume sizes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ModelError;

const MIB_PER_GIB: u64 = 1024;
const MIB_PER_TIB: u64 = 1024 * 1024;

/// A volume size, stored in mebibytes.
///
/// Parsed from strings with an `M`, `G` or `T` suffix (`512M`, `10G`, `1T`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size(u64);

impl Size {
    /// Creates a size from a number of mebibytes.
    #[must_use]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib)
    }

    /// Returns the size in mebibytes.
    #[must_use]
    pub const fn mib(&self) -> u64 {
        self.0
    }

    /// Returns `percent`% of this size, rounded up to a whole mebibyte.
    #[must_use]
    pub fn percent(&self, percent: u8) -> Size {
        let scaled = self.0 * u64::from(percent);
        Size(scaled.div_ceil(100))
    }
}

impl FromStr for Size {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ModelError::InvalidSize {
            value: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let Some(unit) = trimmed.chars().last() else {
            return Err(invalid("size is empty"));
        };
        let multiplier = match unit.to_ascii_uppercase() {
            'M' => 1,
            'G' => MIB_PER_GIB,
            'T' => MIB_PER_TIB,
            _ => return Err(invalid("expected an M, G or T suffix")),
        };

        let digits = &trimmed[..trimmed.len() - unit.len_utf8()];
        let value: u64 = digits
            .parse()
            .map_err(|_| invalid("expected a whole number before the suffix"))?;
        if value == 0 {
            return Err(invalid("size must be greater than zero"));
        }

        value
            .checked_mul(multiplier)
            .map(Size)
            .ok_or_else(|| invalid("size is too large"))
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % MIB_PER_TIB == 0 {
            write!(f, "{}T", self.0 / MIB_PER_TIB)
        } else if self.0 % MIB_PER_GIB == 0 {
            write!(f, "{}G", self.0 / MIB_PER_GIB)
        } else {
            write!(f, "{}M", self.0)
        }
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("512M", 512)]
    #[case("10G", 10 * 1024)]
    #[case("1T", 1024 * 1024)]
    #[case("4g", 4 * 1024)]
    fn test_parse_sizes(#[case] input: &str, #[case] mib: u64) {
        assert_eq!(input.parse::<Size>().unwrap().mib(), mib);
    }

    #[rstest]
    #[case("")]
    #[case("10")]
    #[case("0G")]
    #[case("G")]
    #[case("1.5G")]
    fn test_reject_bad_sizes(#[case] input: &str) {
        assert!(input.parse::<Size>().is_err());
    }

    #[test]
    fn test_display_uses_largest_exact_unit() {
        assert_eq!(Size::from_mib(2048).to_string(), "2G");
        assert_eq!(Size::from_mib(1536).to_string(), "1536M");
        assert_eq!(Size::from_mib(1024 * 1024).to_string(), "1T");
    }

    #[test]
    fn test_percent_rounds_up() {
        assert_eq!(Size::from_mib(1000).percent(20).mib(), 200);
        assert_eq!(Size::from_mib(1001).percent(10).mib(), 101);
        assert_eq!(Size::from_mib(1000).percent(0).mib(), 0);
        assert_eq!(Size::from_mib(1000).percent(100).mib(), 1000);
    }

    proptest! {
        #[test]
        fn prop_display_parses_back(mib in 1..=u64::MAX) {
            let size = Size::from_mib(mib);
            prop_assert_eq!(size.to_string().parse::<Size>().unwrap(), size);
        }

        #[test]
        fn prop_percent_stays_within_size(mib in 0u64..(1 << 50), percent in 0u8..=100) {
            let reserved = Size::from_mib(mib).percent(percent);
            prop_assert!(reserved.mib() <= mib);
            prop_assert!(reserved.mib() * 100 >= mib * u64::from(percent));
        }
    }
}
