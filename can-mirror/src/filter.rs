//! Receive-side acceptance filter

use crate::types::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Acceptance pattern on CAN identifiers
///
/// An identifier passes when `(id & mask) == value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanIdPattern {
    pub value: u32,
    pub mask: u32,
}

impl CanIdPattern {
    /// Pattern accepting only `id`
    pub fn exact(id: u32) -> Self {
        Self {
            value: id,
            mask: 0xFFFF_FFFF,
        }
    }

    /// True if the identifier is accepted
    pub fn matches(&self, id: u32) -> bool {
        (id & self.mask) == self.value
    }
}

impl FromStr for CanIdPattern {
    type Err = MirrorError;

    /// Parse a user pattern
    ///
    /// - `1234`: exactly 0x1234
    /// - `*123`: low digits equal 0x123 (mask 0x00000FFF)
    /// - `123*`: high digits of a 32-bit id equal 0x123 (mask 0xFFF00000)
    /// - `MASK,VALUE`: explicit mask and value
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some((mask, value)) = s.split_once(',') {
            return Ok(Self {
                value: parse_hex(value, s)?,
                mask: parse_hex(mask, s)?,
            });
        }

        if let Some(low) = s.strip_prefix('*') {
            let value = parse_hex(low, s)?;
            let bits = 4 * low.len() as u32;
            let mask = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
            return Ok(Self { value, mask });
        }

        if let Some(high) = s.strip_suffix('*') {
            let value = parse_hex(high, s)?;
            let bits = 4 * high.len() as u32;
            if bits == 0 || bits > 32 {
                return Err(MirrorError::InvalidPattern(format!(
                    "'{}' must hold between 1 and 8 hex digits",
                    s
                )));
            }
            let shift = 32 - bits;
            let mask = if bits == 32 { u32::MAX } else { ((1u32 << bits) - 1) << shift };
            return Ok(Self {
                value: value << shift,
                mask,
            });
        }

        parse_hex(s, s).map(Self::exact)
    }
}

impl TryFrom<String> for CanIdPattern {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CanIdPattern> for String {
    fn from(pattern: CanIdPattern) -> Self {
        format!("{:08X},{:08X}", pattern.mask, pattern.value)
    }
}

impl fmt::Display for CanIdPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}; mask 0x{:08X}", self.value, self.mask)
    }
}

fn parse_hex(digits: &str, pattern: &str) -> Result<u32> {
    let digits = digits.trim();
    u32::from_str_radix(digits, 16).map_err(|_| {
        MirrorError::InvalidPattern(format!(
            "expected hex digits around '*' in '{}'",
            pattern
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        let cases = [
            ((0x0120_0000, 0xFFF0_0000), 0x0123_4567, true),
            ((0x1120_0000, 0xFFF0_0000), 0x0123_4567, false),
            ((0x0023_4000, 0x00FF_F000), 0x0123_4567, true),
            ((0x0023_0000, 0x00FF_F000), 0x0123_4567, false),
        ];
        for ((value, mask), id, expected) in cases {
            let pattern = CanIdPattern { value, mask };
            assert_eq!(pattern.matches(id), expected, "{} vs 0x{:X}", pattern, id);
        }
    }

    #[test]
    fn test_parse_patterns() {
        let parse = |s: &str| s.parse::<CanIdPattern>().unwrap();
        assert_eq!(parse("1234"), CanIdPattern::exact(0x1234));
        assert_eq!(parse("*1234"), CanIdPattern { value: 0x1234, mask: 0x0000_FFFF });
        assert_eq!(parse("1234*"), CanIdPattern { value: 0x1234_0000, mask: 0xFFFF_0000 });
        assert_eq!(parse("12345*"), CanIdPattern { value: 0x1234_5000, mask: 0xFFFF_F000 });
        assert_eq!(parse("12*"), CanIdPattern { value: 0x1200_0000, mask: 0xFF00_0000 });
        assert_eq!(parse("00000FFF,00000123"), CanIdPattern { value: 0x123, mask: 0xFFF });
    }

    #[test]
    fn test_parse_rejects_invalid_patterns() {
        for bad in ["1234$", "12$4*", "*12$4", "*", "1,2,3"] {
            assert!(
                matches!(bad.parse::<CanIdPattern>(), Err(MirrorError::InvalidPattern(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_string_round_trip_for_config_files() {
        let pattern: CanIdPattern = "*321".parse().unwrap();
        let text: String = pattern.into();
        assert_eq!(CanIdPattern::try_from(text).unwrap(), pattern);
    }
}
