//! Pool rules: the per-direction markets a maker serves
//!
//! A configured pool links two chains; it expands into two directional rules,
//! one per source chain, each with its own price bounds and fees.

use crate::codec::SequenceTag;
use crate::config::{PoolConfig, PoolSideConfig};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Fees deducted from a transfer before it is paid out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub trading_fee: Decimal,
    /// Per mille of the amount left after the trading fee
    pub gas_fee: Decimal,
    /// Token decimals
    pub precision: u32,
}

impl FeeSchedule {
    fn scale(&self) -> RelayerResult<Decimal> {
        10u64
            .checked_pow(self.precision)
            .map(Decimal::from)
            .ok_or_else(|| RelayerError::Config(format!("precision {} too large", self.precision)))
    }

    /// Base-unit amount owed to the user for a received `real_amount`
    pub fn payout_amount(&self, real_amount: U256) -> RelayerResult<U256> {
        let received = to_decimal(real_amount, self.precision)?;
        let after_trading_fee = received - self.trading_fee;

        let gas_fee = after_trading_fee * self.gas_fee / Decimal::from(1000u32);
        let gas_fee_digits = if self.precision == 18 { 5 } else { 2 };
        let gas_fee = gas_fee.round_dp_with_strategy(gas_fee_digits, RoundingStrategy::AwayFromZero);

        let payout = after_trading_fee - gas_fee;
        if payout <= Decimal::ZERO {
            return Err(RelayerError::Internal(format!(
                "amount {} does not cover fees",
                real_amount
            )));
        }

        to_base_units(payout * self.scale()?)
    }
}

/// Validation and payout rule for transfers from one chain to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRule {
    pub maker_address: Address,
    pub token_name: String,
    pub source_chain_id: u64,
    pub dest_chain_id: u64,
    pub source_token: Address,
    pub dest_token: Address,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub fees: FeeSchedule,
}

impl PoolRule {
    /// Inclusive bounds on the real amount, in base units
    pub fn amount_bounds(&self) -> RelayerResult<(U256, U256)> {
        let scale = self.fees.scale()?;
        let min = (self.min_price + self.fees.trading_fee) * scale;
        let max = (self.max_price + self.fees.trading_fee) * scale;
        Ok((to_base_units(min)?, to_base_units(max)?))
    }

    pub fn accepts_amount(&self, real_amount: U256) -> RelayerResult<bool> {
        let (min, max) = self.amount_bounds()?;
        Ok(real_amount >= min && real_amount <= max)
    }

    /// Tag a source transfer must carry for this rule
    pub fn destination_tag(&self) -> SequenceTag {
        SequenceTag::destination_marker(self.dest_chain_id)
    }
}

/// Expand a two-way pool into its two directional rules
pub fn expand_pool(pool: &PoolConfig) -> RelayerResult<[PoolRule; 2]> {
    let maker_address = parse_address(&pool.maker_address)?;
    let c1_token = parse_address(&pool.c1.token_address)?;
    let c2_token = parse_address(&pool.c2.token_address)?;

    let rule = |from: &PoolSideConfig, to: &PoolSideConfig, source_token, dest_token| PoolRule {
        maker_address,
        token_name: pool.token_name.clone(),
        source_chain_id: from.chain_id,
        dest_chain_id: to.chain_id,
        source_token,
        dest_token,
        min_price: from.min_price,
        max_price: from.max_price,
        fees: FeeSchedule {
            trading_fee: from.trading_fee,
            gas_fee: from.gas_fee,
            precision: pool.precision,
        },
    };

    Ok([
        rule(&pool.c1, &pool.c2, c1_token, c2_token),
        rule(&pool.c2, &pool.c1, c2_token, c1_token),
    ])
}

/// All directional rules, searchable by what a transfer looks like
#[derive(Debug, Clone, Default)]
pub struct PoolBook {
    rules: Vec<PoolRule>,
}

impl PoolBook {
    pub fn new(rules: Vec<PoolRule>) -> Self {
        Self { rules }
    }

    pub fn from_configs(pools: &[PoolConfig]) -> RelayerResult<Self> {
        let mut rules = Vec::with_capacity(pools.len() * 2);
        for pool in pools {
            rules.extend(expand_pool(pool)?);
        }
        Ok(Self { rules })
    }

    /// Every rule a transfer of `token` to `maker` on `source_chain_id` could
    /// fall under, one per destination chain
    pub fn candidates(
        &self,
        source_chain_id: u64,
        maker: Address,
        token: Address,
    ) -> impl Iterator<Item = &PoolRule> {
        self.rules.iter().filter(move |r| {
            r.source_chain_id == source_chain_id && r.maker_address == maker && r.source_token == token
        })
    }

    /// Rule for a transfer of `token` to `maker` on `source_chain_id` bound
    /// for `dest_chain_id`
    pub fn find(
        &self,
        source_chain_id: u64,
        maker: Address,
        token: Address,
        dest_chain_id: u64,
    ) -> Option<&PoolRule> {
        self.candidates(source_chain_id, maker, token)
            .find(|r| r.dest_chain_id == dest_chain_id)
    }

    /// Rules that watch `source_chain_id`
    pub fn rules_for_chain(&self, source_chain_id: u64) -> impl Iterator<Item = &PoolRule> {
        self.rules
            .iter()
            .filter(move |r| r.source_chain_id == source_chain_id)
    }

    pub fn rules(&self) -> &[PoolRule] {
        &self.rules
    }
}

pub(crate) fn parse_address(value: &str) -> RelayerResult<Address> {
    Address::from_str(value)
        .map_err(|e| RelayerError::Config(format!("Invalid address {}: {}", value, e)))
}

fn to_decimal(amount: U256, precision: u32) -> RelayerResult<Decimal> {
    let overflow = || RelayerError::Internal(format!("amount {} exceeds decimal range", amount));
    if amount > U256::from(u128::MAX) {
        return Err(overflow());
    }
    let value = i128::try_from(amount.as_u128()).map_err(|_| overflow())?;
    Decimal::try_from_i128_with_scale(value, precision).map_err(|_| overflow())
}

fn to_base_units(value: Decimal) -> RelayerResult<U256> {
    value
        .trunc()
        .to_u128()
        .map(U256::from)
        .ok_or_else(|| RelayerError::Internal(format!("{} is not a base-unit amount", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn side(chain_id: u64, fee: &str, gas_fee: &str) -> PoolSideConfig {
        PoolSideConfig {
            chain_id,
            token_address: "0x0000000000000000000000000000000000000000".to_string(),
            min_price: dec("0.005"),
            max_price: dec("1"),
            trading_fee: dec(fee),
            gas_fee: dec(gas_fee),
        }
    }

    fn eth_pool() -> PoolConfig {
        PoolConfig {
            maker_address: "0x0043d60e87c5dd08c86c3123340705a1556c4719".to_string(),
            token_name: "ETH".to_string(),
            precision: 18,
            c1: side(1, "0.0006", "1"),
            c2: side(77, "0.0005", "1.5"),
        }
    }

    #[test]
    fn expands_into_both_directions() {
        let [forward, backward] = expand_pool(&eth_pool()).unwrap();
        assert_eq!((forward.source_chain_id, forward.dest_chain_id), (1, 77));
        assert_eq!((backward.source_chain_id, backward.dest_chain_id), (77, 1));
        assert_eq!(forward.fees.trading_fee, dec("0.0006"));
        assert_eq!(backward.fees.gas_fee, dec("1.5"));
        assert_eq!(forward.destination_tag().value(), 9077);
    }

    #[test]
    fn bounds_include_trading_fee() {
        let [rule, _] = expand_pool(&eth_pool()).unwrap();
        let (min, max) = rule.amount_bounds().unwrap();
        assert_eq!(min, U256::from(5_600_000_000_000_000u64));
        assert_eq!(max, U256::from(1_000_600_000_000_000_000u64));
        assert!(rule.accepts_amount(min).unwrap());
        assert!(rule.accepts_amount(max).unwrap());
        assert!(!rule.accepts_amount(min - U256::one()).unwrap());
        assert!(!rule.accepts_amount(max + U256::one()).unwrap());
    }

    #[test]
    fn payout_deducts_trading_and_gas_fee() {
        let [rule, _] = expand_pool(&eth_pool()).unwrap();
        // 0.1 - 0.0006 = 0.0994; gas 0.0000994 rounds up to 0.0001
        let payout = rule
            .fees
            .payout_amount(U256::from(100_000_000_000_000_000u64))
            .unwrap();
        assert_eq!(payout, U256::from(99_300_000_000_000_000u64));
    }

    #[test]
    fn payout_uses_two_digits_for_small_precision() {
        let fees = FeeSchedule {
            trading_fee: dec("1.5"),
            gas_fee: dec("1"),
            precision: 6,
        };
        // 100 - 1.5 = 98.5; gas 0.0985 rounds up to 0.10
        let payout = fees.payout_amount(U256::from(100_000_000u64)).unwrap();
        assert_eq!(payout, U256::from(98_400_000u64));
    }

    #[test]
    fn payout_below_fees_is_an_error() {
        let fees = FeeSchedule {
            trading_fee: dec("1.5"),
            gas_fee: dec("1"),
            precision: 6,
        };
        assert!(fees.payout_amount(U256::from(1_000_000u64)).is_err());
    }

    #[test]
    fn book_finds_rule_by_chain_maker_and_token() {
        let book = PoolBook::from_configs(&[eth_pool()]).unwrap();
        let maker = parse_address("0x0043d60e87c5dd08c86c3123340705a1556c4719").unwrap();
        let rule = book.find(77, maker, Address::zero(), 1).unwrap();
        assert_eq!(rule.source_chain_id, 77);
        assert!(book.find(77, maker, Address::zero(), 5).is_none());
        assert!(book.find(5, maker, Address::zero(), 1).is_none());
        assert_eq!(book.rules_for_chain(1).count(), 1);
    }

    #[test]
    fn shared_source_side_keeps_one_rule_per_destination() {
        let mut second = eth_pool();
        second.c2 = side(6, "0.0007", "1");
        let book = PoolBook::from_configs(&[eth_pool(), second]).unwrap();
        let maker = parse_address("0x0043d60e87c5dd08c86c3123340705a1556c4719").unwrap();

        assert_eq!(book.candidates(1, maker, Address::zero()).count(), 2);
        let to_six = book.find(1, maker, Address::zero(), 6).unwrap();
        assert_eq!(to_six.fees.trading_fee, dec("0.0006"));
        assert_eq!(book.find(1, maker, Address::zero(), 77).unwrap().dest_chain_id, 77);
    }
}
