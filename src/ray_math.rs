//! 256-bit fixed-point arithmetic in units of RAY = 10^27.
//!
//! Every multiply that can overflow 256 bits is carried out with a 512-bit
//! intermediate (`U512`) and brought back down with an explicit rounding mode.
//! Nothing here panics on well-formed input; failures come back as `Result`.

use crate::error::{LendError, Result};
use crate::Rounding;
use lazy_static::lazy_static;
use uint::construct_uint;

construct_uint! {
    pub struct U256(4);
}

construct_uint! {
    pub struct U512(8);
}

pub const SECONDS_PER_YEAR: u64 = 31_536_000;

lazy_static! {
    pub static ref RAY: U256 = U256::from(10u64).pow(U256::from(27u64));
    pub static ref HALF_RAY: U256 = *RAY / U256::from(2u64);
}

fn to_u512(x: U256) -> U512 {
    let mut bytes = [0u8; 64];
    x.to_big_endian(&mut bytes[32..]);
    U512::from_big_endian(&bytes)
}

fn from_u512(x: U512) -> Result<U256> {
    if x > to_u512(U256::MAX) {
        return Err(LendError::Overflow);
    }
    let mut bytes = [0u8; 64];
    x.to_big_endian(&mut bytes);
    Ok(U256::from_big_endian(&bytes[32..]))
}

/// `(a * b + HALF_RAY) / RAY`, rounding half-up.
pub fn ray_mul(a: U256, b: U256) -> Result<U256> {
    let product = to_u512(a)
        .checked_mul(to_u512(b))
        .ok_or(LendError::Overflow)?;
    let rounded = product
        .checked_add(to_u512(*HALF_RAY))
        .ok_or(LendError::Overflow)?;
    from_u512(rounded / to_u512(*RAY))
}

/// `(a * RAY + b/2) / b`, rounding half-up. `b = 0` is a `DivisionByZero`.
pub fn ray_div(a: U256, b: U256) -> Result<U256> {
    if b.is_zero() {
        return Err(LendError::DivisionByZero);
    }
    let numerator = to_u512(a)
        .checked_mul(to_u512(*RAY))
        .ok_or(LendError::Overflow)?
        .checked_add(to_u512(b / U256::from(2u64)))
        .ok_or(LendError::Overflow)?;
    from_u512(numerator / to_u512(b))
}

/// `(a * b) / c` with an explicit rounding mode and a 512-bit intermediate.
pub fn mul_div(a: U256, b: U256, c: U256, rounding: Rounding) -> Result<U256> {
    if c.is_zero() {
        return Err(LendError::DivisionByZero);
    }
    let product = to_u512(a)
        .checked_mul(to_u512(b))
        .ok_or(LendError::Overflow)?;
    let c512 = to_u512(c);
    let quotient = product / c512;
    let result = match rounding {
        Rounding::Floor => quotient,
        Rounding::Ceil => {
            if product % c512 != U512::zero() {
                quotient + U512::one()
            } else {
                quotient
            }
        }
    };
    from_u512(result)
}

/// `index * (RAY + rate_per_second * dt) / RAY`, floor-rounded.
///
/// Linear accrual per the chosen discretization (spec §4.1/§9): strictly
/// non-decreasing for `rate_per_second >= 0`, identity at `dt = 0` or
/// `rate_per_second = 0`.
pub fn accrue_linear(index: U256, rate_per_second: U256, dt: u64) -> Result<U256> {
    if dt == 0 || rate_per_second.is_zero() {
        return Ok(index);
    }
    let elapsed_rate = rate_per_second
        .checked_mul(U256::from(dt))
        .ok_or(LendError::Overflow)?;
    let factor = RAY.checked_add(elapsed_rate).ok_or(LendError::Overflow)?;
    mul_div(index, factor, *RAY, Rounding::Floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ray_mul_identity() {
        let x = U256::from(123_456_789u64);
        assert_eq!(ray_mul(x, *RAY).unwrap(), x);
    }

    #[test]
    fn ray_div_identity() {
        let x = U256::from(123_456_789u64);
        assert_eq!(ray_div(x, *RAY).unwrap(), x);
    }

    #[test]
    fn ray_mul_commutes() {
        let a = U256::from(7_000_000_000_000u64);
        let b = U256::from(3_000_000_000_000u64);
        assert_eq!(ray_mul(a, b).unwrap(), ray_mul(b, a).unwrap());
    }

    #[test]
    fn ray_div_by_zero() {
        assert!(matches!(
            ray_div(U256::one(), U256::zero()),
            Err(LendError::DivisionByZero)
        ));
    }

    #[test]
    fn accrue_linear_noop_on_zero_dt_or_rate() {
        let index = *RAY;
        let rate = U256::from(1_000_000_000u64);
        assert_eq!(accrue_linear(index, rate, 0).unwrap(), index);
        assert_eq!(accrue_linear(index, U256::zero(), 86_400).unwrap(), index);
    }

    #[test]
    fn accrue_linear_five_percent_apy_one_day() {
        // 5% APY as a per-second RAY rate.
        let rate = ray_div(U256::from(5u64), U256::from(100u64)).unwrap() / U256::from(SECONDS_PER_YEAR);
        let accrued = accrue_linear(*RAY, rate, 86_400).unwrap();
        // Expect roughly RAY * (1 + 0.05/365)
        let lower = U256::from_dec_str("1000136986000000000000000000").unwrap();
        let upper = U256::from_dec_str("1000137000000000000000000000").unwrap();
        assert!(accrued >= lower && accrued <= upper, "accrued = {}", accrued);
    }

    #[test]
    fn mul_div_ceil_rounds_up_on_remainder() {
        let a = U256::from(10u64);
        let b = U256::from(1u64);
        let c = U256::from(3u64);
        assert_eq!(mul_div(a, b, c, Rounding::Floor).unwrap(), U256::from(3u64));
        assert_eq!(mul_div(a, b, c, Rounding::Ceil).unwrap(), U256::from(4u64));
    }

    #[test]
    fn mul_div_zero_divisor_errors() {
        assert!(matches!(
            mul_div(U256::one(), U256::one(), U256::zero(), Rounding::Floor),
            Err(LendError::DivisionByZero)
        ));
    }

    proptest! {
        #[test]
        fn ray_mul_identity_property(x in any::<u64>()) {
            let x = U256::from(x);
            prop_assert_eq!(ray_mul(x, *RAY).unwrap(), x);
        }

        #[test]
        fn ray_div_identity_property(x in any::<u64>()) {
            let x = U256::from(x);
            prop_assert_eq!(ray_div(x, *RAY).unwrap(), x);
        }

        #[test]
        fn accrue_linear_monotonic(index in any::<u64>(), rate in any::<u32>(), dt in any::<u32>()) {
            let index = U256::from(index.max(1)) * *RAY;
            let rate = U256::from(rate);
            let accrued = accrue_linear(index, rate, dt as u64).unwrap();
            prop_assert!(accrued >= index);
        }
    }
}
