//! Packed rollup amounts
//!
//! Rollup transfers store amounts as `mantissa * 10^exponent` with a 35-bit
//! mantissa and a 5-bit exponent. Anything else is rejected by the operator,
//! so payouts are rounded down to the closest representable value first.

use ethers::types::U256;

const MANTISSA_BITS: u32 = 35;
const EXPONENT_BITS: u32 = 5;

/// Largest representable amount not above `amount`
pub fn closest_packable_amount(amount: U256) -> U256 {
    let max_mantissa = U256::from((1u64 << MANTISSA_BITS) - 1);
    let max_exponent = (1usize << EXPONENT_BITS) - 1;

    let mut mantissa = amount;
    let mut exponent = 0usize;
    while mantissa > max_mantissa && exponent < max_exponent {
        mantissa = mantissa / U256::from(10u8);
        exponent += 1;
    }
    if mantissa > max_mantissa {
        mantissa = max_mantissa;
    }

    mantissa * U256::exp10(exponent)
}

pub fn is_packable(amount: U256) -> bool {
    closest_packable_amount(amount) == amount
}
