//! InvariantGuard (C8): pre/post checks that every transition preserves global
//! solvency and monotonicity invariants (spec §4.8). Violations are fatal —
//! they abort the transaction and never get recovered locally.

use crate::error::{LendError, Result};
use crate::ray_math::{ray_div, U256};
use crate::reserve::Reserve;
use crate::{Rounding, Timestamp};

/// Amount of floor-rounding drift tolerated when reconciling live positions'
/// summed value against a reserve's recorded totals (spec §4.8).
const POSITION_CONSISTENCY_EPSILON: u64 = 16;

pub struct InvariantGuard;

impl InvariantGuard {
    /// Checks that `after` is a valid successor state of `before` for the same
    /// reserve: solvency, index monotonicity, timestamp monotonicity, and rate
    /// bounds. Called once per mutated reserve within the same transaction that
    /// produced the mutation.
    pub fn check_reserve_transition(before: &Reserve, after: &Reserve) -> Result<()> {
        after.check_solvent()?;

        if after.liquidity_index < before.liquidity_index {
            return Err(LendError::InvariantViolation(format!(
                "reserve {:?}: liquidity_index decreased from {} to {}",
                after.asset_id, before.liquidity_index, after.liquidity_index
            )));
        }
        if after.borrow_index < before.borrow_index {
            return Err(LendError::InvariantViolation(format!(
                "reserve {:?}: borrow_index decreased from {} to {}",
                after.asset_id, before.borrow_index, after.borrow_index
            )));
        }
        if after.last_update_timestamp < before.last_update_timestamp {
            return Err(LendError::InvariantViolation(format!(
                "reserve {:?}: last_update_timestamp went backwards",
                after.asset_id
            )));
        }

        Self::check_rate_bounds(after)?;

        Ok(())
    }

    fn check_rate_bounds(reserve: &Reserve) -> Result<()> {
        let max_rate = crate::max_rate_per_second();
        if reserve.liquidity_rate > max_rate || reserve.borrow_rate > max_rate {
            return Err(LendError::InvariantViolation(format!(
                "reserve {:?}: rate exceeds configured bound",
                reserve.asset_id
            )));
        }
        Ok(())
    }

    /// Reconciles the sum of live supply positions' current underlying value
    /// against `reserve.total_liquidity`, within `POSITION_CONSISTENCY_EPSILON`
    /// (spec §4.8: "ε accounts for floor-rounding drift").
    pub fn check_supply_consistency(reserve: &Reserve, live_atoken_amounts: &[(u64, U256)]) -> Result<()> {
        let mut total_value: u128 = 0;
        for (atoken_amount, index_at_supply) in live_atoken_amounts {
            let value = mul_div_floor_u64(*atoken_amount, reserve.liquidity_index, *index_at_supply)?;
            total_value += value as u128;
        }

        if total_value > reserve.total_liquidity as u128 + POSITION_CONSISTENCY_EPSILON as u128 {
            return Err(LendError::InvariantViolation(format!(
                "reserve {:?}: summed supply position value {} exceeds total_liquidity {} beyond epsilon",
                reserve.asset_id, total_value, reserve.total_liquidity
            )));
        }
        Ok(())
    }

    /// Reconciles the sum of live debt positions' current outstanding debt
    /// against `reserve.total_borrowed`, within the same epsilon.
    pub fn check_debt_consistency(reserve: &Reserve, live_principals: &[(u64, U256)]) -> Result<()> {
        let mut total_debt: u128 = 0;
        for (principal, index_at_open) in live_principals {
            let debt = mul_div_floor_u64(*principal, reserve.borrow_index, *index_at_open)?;
            total_debt += debt as u128;
        }

        if total_debt > reserve.total_borrowed as u128 + POSITION_CONSISTENCY_EPSILON as u128 {
            return Err(LendError::InvariantViolation(format!(
                "reserve {:?}: summed debt {} exceeds total_borrowed {} beyond epsilon",
                reserve.asset_id, total_debt, reserve.total_borrowed
            )));
        }
        Ok(())
    }

    /// Timestamp monotonicity at the coordinator level: a Clock read must never
    /// regress across consecutive intents touching the same reserve.
    pub fn check_clock_monotonic(last_seen: Timestamp, now: Timestamp) -> Result<()> {
        if now < last_seen {
            return Err(LendError::InvariantViolation(format!(
                "clock went backwards: last seen {}, now {}",
                last_seen, now
            )));
        }
        Ok(())
    }
}

fn mul_div_floor_u64(amount: u64, current_index: U256, index_at_snapshot: U256) -> Result<u64> {
    let value = crate::ray_math::mul_div(
        U256::from(amount),
        current_index,
        index_at_snapshot,
        Rounding::Floor,
    )?;
    if value > U256::from(u64::MAX) {
        return Err(LendError::Overflow);
    }
    Ok(value.low_u64())
}

/// Not itself an invariant check — exposed so callers that want the raw ratio
/// (e.g. diagnostics) don't need to reach into `ray_math` directly.
pub fn index_growth_ratio(current_index: U256, reference_index: U256) -> Result<U256> {
    ray_div(current_index, reference_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray_math::RAY;
    use crate::reserve::ReserveParams;

    fn params() -> ReserveParams {
        ReserveParams {
            reserve_factor: *RAY / U256::from(10u64),
            ltv: *RAY * U256::from(75u64) / U256::from(100u64),
            liquidation_threshold: *RAY * U256::from(80u64) / U256::from(100u64),
            liquidation_bonus: *RAY * U256::from(5u64) / U256::from(100u64),
            base_rate: U256::zero(),
            slope_1: *RAY / U256::from(20u64),
            slope_2: *RAY,
            optimal_utilization: *RAY * U256::from(80u64) / U256::from(100u64),
        }
    }

    #[test]
    fn rejects_insolvent_reserve() {
        let before = Reserve::genesis([1u8; 32], params(), 0);
        let mut after = before.clone();
        after.total_liquidity = 100;
        after.total_borrowed = 200;

        let result = InvariantGuard::check_reserve_transition(&before, &after);
        assert!(matches!(result, Err(LendError::InvariantViolation(_))));
    }

    #[test]
    fn rejects_decreasing_liquidity_index() {
        let before = Reserve::genesis([1u8; 32], params(), 0);
        let mut after = before.clone();
        after.liquidity_index = before.liquidity_index - U256::from(1u64);

        let result = InvariantGuard::check_reserve_transition(&before, &after);
        assert!(matches!(result, Err(LendError::InvariantViolation(_))));
    }

    #[test]
    fn accepts_valid_transition() {
        let before = Reserve::genesis([1u8; 32], params(), 0);
        let mut after = before.clone();
        after.liquidity_index = before.liquidity_index + U256::from(1_000u64);
        after.borrow_index = before.borrow_index + U256::from(1_000u64);
        after.last_update_timestamp = 100;

        assert!(InvariantGuard::check_reserve_transition(&before, &after).is_ok());
    }

    #[test]
    fn supply_consistency_within_epsilon_passes() {
        let mut reserve = Reserve::genesis([1u8; 32], params(), 0);
        reserve.total_liquidity = 1_000;

        let positions = vec![(1_000u64, *RAY)];
        assert!(InvariantGuard::check_supply_consistency(&reserve, &positions).is_ok());
    }

    #[test]
    fn supply_consistency_rejects_gross_overdraw() {
        let mut reserve = Reserve::genesis([1u8; 32], params(), 0);
        reserve.total_liquidity = 100;

        let positions = vec![(10_000u64, *RAY)];
        let result = InvariantGuard::check_supply_consistency(&reserve, &positions);
        assert!(matches!(result, Err(LendError::InvariantViolation(_))));
    }

    #[test]
    fn clock_monotonic_rejects_regression() {
        assert!(InvariantGuard::check_clock_monotonic(100, 50).is_err());
        assert!(InvariantGuard::check_clock_monotonic(100, 150).is_ok());
    }
}
