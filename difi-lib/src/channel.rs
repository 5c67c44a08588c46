//! Channel selection.
//!
//! A [ChannelSet] is the ordered list of VITA channel indices a run records. Its order is the
//! interleave order of recorded frames; its bitmask is what stream identifiers are tested
//! against.
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::prelude::*;
use crate::vita::StreamId;

/// Channel indices are bit positions in a 32-bit stream identifier.
pub const MAX_CHANNEL: u8 = 31;

/// Ordered set of distinct channel indices.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelSet {
    channels: Vec<u8>,
}

impl ChannelSet {
    /// Construct from channel indices in interleave order.
    ///
    /// # Errors
    /// [Error::InvalidChannelSet] if `channels` is empty, has duplicates, or contains an index
    /// greater than [MAX_CHANNEL].
    pub fn new(channels: &[u8]) -> Result<Self> {
        if channels.is_empty() {
            return Err(Error::InvalidChannelSet("no channels".to_string()));
        }
        for (i, ch) in channels.iter().enumerate() {
            if *ch > MAX_CHANNEL {
                return Err(Error::InvalidChannelSet(format!(
                    "channel {ch} is greater than {MAX_CHANNEL}"
                )));
            }
            if channels[..i].contains(ch) {
                return Err(Error::InvalidChannelSet(format!(
                    "channel {ch} listed more than once"
                )));
            }
        }
        Ok(ChannelSet {
            channels: channels.to_vec(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Always false, a [ChannelSet] has at least one channel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    #[must_use]
    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    /// Bitmask with one bit set per configured channel.
    #[must_use]
    pub fn mask(&self) -> u32 {
        self.channels.iter().fold(0, |mask, ch| mask | 1 << ch)
    }

    /// Position within this set of the first channel `stream_id` belongs to.
    ///
    /// The search covers each configured channel once.
    ///
    /// # Errors
    /// [Error::ChannelMismatch] if `stream_id` has no bit in common with any configured
    /// channel.
    pub fn select(&self, stream_id: StreamId) -> Result<usize> {
        self.channels
            .iter()
            .position(|ch| stream_id & (1 << ch) != 0)
            .ok_or(Error::ChannelMismatch { stream_id })
    }

    /// Position of the last channel; the packet at this position completes a frame.
    #[must_use]
    pub fn last_position(&self) -> usize {
        self.channels.len() - 1
    }
}

impl FromStr for ChannelSet {
    type Err = Error;

    /// Parse a channel list such as `0`, `0,1`, or `"1,0"`.
    fn from_str(s: &str) -> Result<Self> {
        let mut channels = Vec::default();
        for tok in s.split(['"', '\'', ',']) {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            let ch = tok
                .parse::<u8>()
                .map_err(|_| Error::InvalidChannelSet(format!("invalid channel {tok:?}")))?;
            channels.push(ch);
        }
        ChannelSet::new(&channels)
    }
}

impl Display for ChannelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strs: Vec<String> = self.channels.iter().map(ToString::to_string).collect();
        write!(f, "{}", strs.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("0", &[0] ; "single")]
    #[test_case("0,1", &[0, 1] ; "pair")]
    #[test_case("\"1,0\"", &[1, 0] ; "quoted reversed")]
    #[test_case(" 3, 5 ,7", &[3, 5, 7] ; "whitespace")]
    #[test_case("31", &[31] ; "max channel")]
    fn parse_channel_set(input: &str, expected: &[u8]) {
        let set: ChannelSet = input.parse().unwrap();
        assert_eq!(set.channels(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("," ; "only separators")]
    #[test_case("0,0" ; "duplicate")]
    #[test_case("32" ; "out of range")]
    #[test_case("a" ; "not a number")]
    #[test_case("-1" ; "negative")]
    fn parse_channel_set_fails(input: &str) {
        let zult = input.parse::<ChannelSet>();
        assert!(
            matches!(zult, Err(Error::InvalidChannelSet(_))),
            "got {zult:?} for {input:?}"
        );
    }

    #[test]
    fn mask_has_bit_per_channel() {
        let set = ChannelSet::new(&[0, 1, 4]).unwrap();
        assert_eq!(set.mask(), 0b1_0011);
    }

    #[test]
    fn select_returns_position_not_channel() {
        let set = ChannelSet::new(&[4, 1]).unwrap();

        assert_eq!(set.select(1 << 4).unwrap(), 0);
        assert_eq!(set.select(1 << 1).unwrap(), 1);
        assert_eq!(set.last_position(), 1);
    }

    #[test]
    fn select_mismatch_is_err_for_every_set_size() {
        for n in 1..=MAX_CHANNEL {
            let channels: Vec<u8> = (0..n).collect();
            let set = ChannelSet::new(&channels).unwrap();
            let stream_id = 1u32 << n;

            let zult = set.select(stream_id);
            assert!(
                matches!(zult, Err(Error::ChannelMismatch { stream_id: x }) if x == stream_id),
                "got {zult:?} for {n} channels"
            );
        }
    }

    #[test]
    fn display_roundtrips() {
        let set: ChannelSet = "2,0,1".parse().unwrap();
        assert_eq!(set.to_string(), "2,0,1");
    }
}
