//! Transfer amount codec
//!
//! A bridge transfer carries its metadata inside the transferred value: a
//! fixed-width block of decimal digits (the sequence tag) overwrites the
//! low-order digits of the amount. On the source side the tag is
//! `9000 + destination chain id`; on the destination side it is the user's
//! source nonce. Chains whose amounts must stay packable (zk-rollups) only
//! keep a limited number of significant digits, so their tag sits at the end
//! of the significant prefix instead of at the end of the number.

mod packable;

pub use packable::{closest_packable_amount, is_packable};

use crate::error::{RelayerError, RelayerResult};

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Default number of tag digits
pub const TAG_DIGITS: u32 = 4;

/// Tags from this value upward mark the destination chain
pub const DESTINATION_MARKER_BASE: u64 = 9000;

/// A decoded or to-be-encoded sequence tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceTag(u64);

impl SequenceTag {
    /// Tag a source transfer must carry to be settled on `dest_chain_id`
    pub fn destination_marker(dest_chain_id: u64) -> Self {
        Self(DESTINATION_MARKER_BASE + dest_chain_id)
    }

    /// Ordinary tag (0..=8999), used for payouts
    pub fn ordinary(sequence: u64) -> Option<Self> {
        (sequence < DESTINATION_MARKER_BASE).then_some(Self(sequence))
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Destination chain id if this is a marker tag
    pub fn destination_chain(self) -> Option<u64> {
        self.0.checked_sub(DESTINATION_MARKER_BASE)
    }
}

impl fmt::Display for SequenceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the tag lives in a chain's amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecRule {
    pub tag_digits: u32,
    /// Significant-digit limit for chains with packed amounts
    pub significant_digits: Option<u32>,
}

impl Default for CodecRule {
    fn default() -> Self {
        Self {
            tag_digits: TAG_DIGITS,
            significant_digits: None,
        }
    }
}

impl CodecRule {
    pub fn packed(significant_digits: u32) -> Self {
        Self {
            tag_digits: TAG_DIGITS,
            significant_digits: Some(significant_digits),
        }
    }

    /// Digit range `[start, end)` holding the tag in an amount of `len` digits
    fn tag_window(&self, len: usize) -> Option<(usize, usize)> {
        let width = self.tag_digits as usize;
        if len < width {
            return None;
        }
        match self.significant_digits.map(|s| s as usize) {
            Some(sig) if len > sig && sig >= width => Some((sig - width, sig)),
            _ => Some((len - width, len)),
        }
    }
}

/// Result of decoding a wire amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAmount {
    pub real_amount: U256,
    pub tag: SequenceTag,
}

/// Per-chain amount encoder/decoder
#[derive(Debug, Clone, Default)]
pub struct AmountCodec {
    rules: HashMap<u64, CodecRule>,
}

impl AmountCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the tag layout for a chain
    pub fn with_rule(mut self, chain_id: u64, rule: CodecRule) -> Self {
        self.rules.insert(chain_id, rule);
        self
    }

    pub fn set_rule(&mut self, chain_id: u64, rule: CodecRule) {
        self.rules.insert(chain_id, rule);
    }

    pub fn rule(&self, chain_id: u64) -> CodecRule {
        self.rules.get(&chain_id).copied().unwrap_or_default()
    }

    /// Split a wire amount into its real amount and sequence tag
    pub fn decode(&self, chain_id: u64, wire_amount: &str) -> RelayerResult<DecodedAmount> {
        let invalid = |message: &str| RelayerError::Codec {
            chain_id,
            amount: wire_amount.to_string(),
            message: message.to_string(),
        };

        if wire_amount.is_empty() || !wire_amount.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("not a decimal integer"));
        }
        let value = U256::from_dec_str(wire_amount).map_err(|_| invalid("out of range"))?;
        let digits = value.to_string();

        let rule = self.rule(chain_id);
        let (start, end) = rule
            .tag_window(digits.len())
            .ok_or_else(|| invalid("fewer digits than the tag width"))?;

        let tag = digits[start..end]
            .parse::<u64>()
            .map_err(|_| invalid("unreadable tag"))?;

        let mut real = String::with_capacity(digits.len());
        real.push_str(&digits[..start]);
        real.extend(std::iter::repeat('0').take(digits.len() - start));
        let real_amount = U256::from_dec_str(&real).map_err(|_| invalid("out of range"))?;

        Ok(DecodedAmount {
            real_amount,
            tag: SequenceTag(tag),
        })
    }

    /// Write `tag` into `real_amount`; digits after the tag window are zeroed
    pub fn encode(&self, chain_id: u64, real_amount: U256, tag: SequenceTag) -> RelayerResult<U256> {
        let rule = self.rule(chain_id);
        let width = rule.tag_digits as usize;

        let tag_str = format!("{:0width$}", tag.value(), width = width);
        if tag_str.len() > width {
            return Err(RelayerError::Codec {
                chain_id,
                amount: real_amount.to_string(),
                message: format!("tag {} does not fit in {} digits", tag, width),
            });
        }

        let mut digits = real_amount.to_string();
        if digits.len() < width {
            digits = format!("{:0>width$}", digits, width = width);
        }
        let (start, end) = rule
            .tag_window(digits.len())
            .ok_or_else(|| RelayerError::Internal("tag window after padding".to_string()))?;

        let mut wire = String::with_capacity(digits.len());
        wire.push_str(&digits[..start]);
        wire.push_str(&tag_str);
        wire.extend(std::iter::repeat('0').take(digits.len() - end));

        U256::from_dec_str(&wire).map_err(|_| RelayerError::Codec {
            chain_id,
            amount: wire,
            message: "encoded amount out of range".to_string(),
        })
    }
}
