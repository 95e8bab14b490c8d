//! Multi-channel bit patterns with wildcards.
use crate::error::{AppResult, AutomationError};
use crate::instrument::ChannelId;
use serde::{Deserialize, Serialize};

/// Expected logic states of a list of channels.
///
/// Written as a string with one character per channel, in channel-list order:
/// `1` (high), `0` (low) or `X` (don't care). Internally the expected bits and the
/// wildcard mask are kept as bit maps, bit `i` belonging to `channels[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PatternRepr", into = "PatternRepr")]
pub struct BitPattern {
    channels: Vec<ChannelId>,
    expected: u64,
    /// Set bits are compared; cleared bits are wildcards.
    care_mask: u64,
}

#[derive(Clone, Serialize, Deserialize)]
struct PatternRepr {
    channels: Vec<ChannelId>,
    pattern: String,
}

impl TryFrom<PatternRepr> for BitPattern {
    type Error = AutomationError;

    fn try_from(repr: PatternRepr) -> Result<Self, Self::Error> {
        BitPattern::parse(repr.channels, &repr.pattern)
    }
}

impl From<BitPattern> for PatternRepr {
    fn from(pattern: BitPattern) -> Self {
        PatternRepr {
            pattern: pattern.to_pattern_string(),
            channels: pattern.channels,
        }
    }
}

impl BitPattern {
    pub const MAX_CHANNELS: usize = 64;

    /// Parses a pattern such as `"11X1"` against `channels`.
    pub fn parse(channels: Vec<ChannelId>, pattern: &str) -> AppResult<Self> {
        let symbols: Vec<char> = pattern.chars().filter(|c| !c.is_whitespace() && *c != '_').collect();
        if symbols.len() != channels.len() {
            return Err(AutomationError::Configuration(format!(
                "Pattern '{}' has {} positions for {} channels",
                pattern,
                symbols.len(),
                channels.len()
            )));
        }
        if channels.is_empty() || channels.len() > Self::MAX_CHANNELS {
            return Err(AutomationError::Configuration(format!(
                "Pattern needs between 1 and {} channels",
                Self::MAX_CHANNELS
            )));
        }
        let (expected, care_mask) = parse_bits(&symbols, pattern)?;
        Ok(Self {
            channels,
            expected,
            care_mask,
        })
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Whether the given bit map (bit `i` for position `i`) matches on all cared positions.
    pub fn matches_bits(&self, bits: u64) -> bool {
        (bits ^ self.expected) & self.care_mask == 0
    }

    /// Whether a concrete state string such as `"1101"` matches.
    pub fn matches_str(&self, states: &str) -> AppResult<bool> {
        let symbols: Vec<char> = states.chars().filter(|c| !c.is_whitespace()).collect();
        if symbols.len() != self.channels.len() {
            return Err(AutomationError::Configuration(format!(
                "State '{}' does not have {} positions",
                states,
                self.channels.len()
            )));
        }
        let (bits, mask) = parse_bits(&symbols, states)?;
        if mask.count_ones() as usize != symbols.len() {
            return Err(AutomationError::Configuration(format!(
                "State '{}' must not contain wildcards",
                states
            )));
        }
        Ok(self.matches_bits(bits))
    }

    /// Matches the logic levels of `levels` (one per channel, in channel order).
    pub fn matches_levels(&self, levels: &[bool]) -> bool {
        let bits = levels
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, high)| if *high { acc | (1 << i) } else { acc });
        self.matches_bits(bits)
    }

    pub fn to_pattern_string(&self) -> String {
        (0..self.channels.len())
            .map(|i| {
                if self.care_mask & (1 << i) == 0 {
                    'X'
                } else if self.expected & (1 << i) != 0 {
                    '1'
                } else {
                    '0'
                }
            })
            .collect()
    }
}

fn parse_bits(symbols: &[char], source: &str) -> AppResult<(u64, u64)> {
    let mut expected = 0u64;
    let mut care = 0u64;
    for (i, symbol) in symbols.iter().enumerate() {
        match symbol {
            '1' | 'H' | 'h' => {
                expected |= 1 << i;
                care |= 1 << i;
            }
            '0' | 'L' | 'l' => care |= 1 << i,
            'X' | 'x' => {}
            other => {
                return Err(AutomationError::Configuration(format!(
                    "Invalid pattern symbol '{}' in '{}'",
                    other, source
                )))
            }
        }
    }
    Ok((expected, care))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_channels() -> Vec<ChannelId> {
        (1..=4).map(ChannelId).collect()
    }

    #[test]
    fn test_wildcard_pattern() {
        let pattern = BitPattern::parse(four_channels(), "11X1").unwrap();
        assert!(pattern.matches_str("1101").unwrap());
        assert!(pattern.matches_str("1111").unwrap());
        assert!(!pattern.matches_str("1100").unwrap());
        assert!(!pattern.matches_str("0101").unwrap());
    }

    #[test]
    fn test_matches_levels() {
        let pattern = BitPattern::parse(four_channels(), "10XX").unwrap();
        assert!(pattern.matches_levels(&[true, false, true, true]));
        assert!(!pattern.matches_levels(&[true, true, false, false]));
    }

    #[test]
    fn test_parse_errors() {
        assert!(BitPattern::parse(four_channels(), "11X").is_err());
        assert!(BitPattern::parse(four_channels(), "11Z1").is_err());
        let pattern = BitPattern::parse(four_channels(), "11X1").unwrap();
        assert!(pattern.matches_str("11X1").is_err());
    }

    #[test]
    fn test_pattern_string_round_trip() {
        let pattern = BitPattern::parse(four_channels(), "1x0H").unwrap();
        assert_eq!(pattern.to_pattern_string(), "1X01");
        let json = serde_json::to_string(&pattern).unwrap();
        assert!(json.contains("\"1X01\""));
        let back: BitPattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pattern);
    }
}
