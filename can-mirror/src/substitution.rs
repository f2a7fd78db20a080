//! Identifier substitution and file naming
//!
//! Files are named after their message by default. When a substitution rule
//! is configured, they are named after the message identifier rewritten by
//! the rule instead. Either way the mapping must be a bijection over the
//! catalog so that an edited file always resolves to exactly one message.

use crate::catalog::Catalog;
use crate::types::{MirrorError, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Extension of every mirrored file
pub const JSON_EXTENSION: &str = "json";

/// Digit-wise identifier rewrite
///
/// Both patterns are hex digits or `*`, one character per identifier digit.
/// An identifier is rewritten when every hex digit of the match pattern
/// equals the identifier's digit at the same position. A rewritten digit
/// takes the replacement digit, or keeps the original under a `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutionRule {
    match_digits: Vec<Option<u8>>,
    replacement_digits: Vec<Option<u8>>,
}

impl SubstitutionRule {
    /// Build a rule from its match and replacement patterns
    pub fn new(match_pattern: &str, replacement: &str) -> Result<Self> {
        let match_digits = parse_pattern(match_pattern)?;
        let replacement_digits = parse_pattern(replacement)?;

        if match_digits.len() != replacement_digits.len() {
            return Err(MirrorError::InvalidPattern(format!(
                "'{}' and '{}' must have the same length",
                match_pattern, replacement
            )));
        }
        if match_digits.is_empty() || match_digits.len() > 8 {
            return Err(MirrorError::InvalidPattern(format!(
                "'{}' must cover between 1 and 8 hex digits",
                match_pattern
            )));
        }

        Ok(Self {
            match_digits,
            replacement_digits,
        })
    }

    /// Number of hex digits in a rewritten identifier
    pub fn width(&self) -> usize {
        self.match_digits.len()
    }

    /// Hex digits of `id`, most significant first, or `None` if too wide
    fn digits(&self, id: u32) -> Option<Vec<u8>> {
        let width = self.width();
        if width < 8 && id >> (4 * width) != 0 {
            return None;
        }
        Some(
            (0..width)
                .rev()
                .map(|position| ((id >> (4 * position)) & 0xF) as u8)
                .collect(),
        )
    }

    /// True if the rule rewrites `id`
    pub fn matches(&self, id: u32) -> bool {
        self.digits(id).map_or(false, |digits| {
            digits
                .iter()
                .zip(&self.match_digits)
                .all(|(digit, expected)| expected.map_or(true, |e| e == *digit))
        })
    }

    /// File stem for `id`
    pub fn apply(&self, id: u32) -> Result<String> {
        let digits = self.digits(id).ok_or_else(|| {
            MirrorError::InvalidPattern(format!(
                "identifier 0x{:X} does not fit in a {} digit pattern",
                id,
                self.width()
            ))
        })?;

        let rewrite = self.matches(id);
        Ok(digits
            .iter()
            .zip(&self.replacement_digits)
            .map(|(digit, replacement)| {
                let digit = match replacement {
                    Some(r) if rewrite => *r,
                    _ => *digit,
                };
                char::from_digit(u32::from(digit), 16)
                    .unwrap_or('0')
                    .to_ascii_uppercase()
            })
            .collect())
    }
}

impl FromStr for SubstitutionRule {
    type Err = MirrorError;

    /// Parse `MATCH:REPLACEMENT`, e.g. `12**:AB**`
    fn from_str(s: &str) -> Result<Self> {
        let (match_pattern, replacement) = s.split_once(':').ok_or_else(|| {
            MirrorError::InvalidPattern(format!(
                "expected MATCH:REPLACEMENT, got '{}'",
                s
            ))
        })?;
        Self::new(match_pattern.trim(), replacement.trim())
    }
}

impl fmt::Display for SubstitutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |digits: &[Option<u8>]| -> String {
            digits
                .iter()
                .map(|d| match d {
                    Some(d) => char::from_digit(u32::from(*d), 16)
                        .unwrap_or('?')
                        .to_ascii_uppercase(),
                    None => '*',
                })
                .collect()
        };
        write!(f, "{}:{}", render(&self.match_digits), render(&self.replacement_digits))
    }
}

fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let pattern = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    pattern
        .chars()
        .map(|c| match c {
            '*' => Ok(None),
            c => c.to_digit(16).map(|d| Some(d as u8)).ok_or_else(|| {
                MirrorError::InvalidPattern(format!(
                    "'{}' in '{}' is neither a hex digit nor '*'",
                    c, pattern
                ))
            }),
        })
        .collect()
}

/// Bijective mapping between catalog identifiers and file stems
#[derive(Debug, Clone)]
pub struct FileNaming {
    forward: HashMap<u32, String>,
    reverse: HashMap<String, u32>,
}

impl FileNaming {
    /// Build the mapping for every message of the catalog
    ///
    /// Without a rule, files are named after their message. Two identifiers
    /// landing on the same stem is a configuration failure.
    pub fn new(catalog: &Catalog, rule: Option<&SubstitutionRule>) -> Result<Self> {
        let mut forward = HashMap::new();
        let mut reverse: HashMap<String, u32> = HashMap::new();

        for message in catalog.messages() {
            let stem = match rule {
                Some(rule) => rule.apply(message.id)?,
                None => message.name.clone(),
            };
            if let Some(&first) = reverse.get(&stem) {
                return Err(MirrorError::AmbiguousSubstitution {
                    first,
                    second: message.id,
                    name: stem,
                });
            }
            reverse.insert(stem.clone(), message.id);
            forward.insert(message.id, stem);
        }

        if let Some(rule) = rule {
            log::info!(
                "Substitution {} rewrites {} of {} identifiers",
                rule,
                catalog.ids().filter(|id| rule.matches(*id)).count(),
                catalog.messages().len()
            );
        }

        Ok(Self { forward, reverse })
    }

    /// File stem for an identifier
    pub fn forward(&self, id: u32) -> Option<&str> {
        self.forward.get(&id).map(String::as_str)
    }

    /// Identifier for a file stem
    pub fn reverse(&self, stem: &str) -> Option<u32> {
        self.reverse.get(stem).copied()
    }

    /// File name (with extension) for an identifier
    pub fn file_name(&self, id: u32) -> Option<String> {
        self.forward(id).map(|stem| format!("{}.{}", stem, JSON_EXTENSION))
    }

    /// Identifier for a file name, if it is a mirrored file
    pub fn id_for_file_name(&self, file_name: &str) -> Option<u32> {
        file_name
            .strip_suffix(JSON_EXTENSION)
            .and_then(|rest| rest.strip_suffix('.'))
            .and_then(|stem| self.reverse(stem))
    }
}
