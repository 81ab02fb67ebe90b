//! Reserve entity and ReserveEngine (C5): supply/withdraw/borrow-draw/repay-credit
//! on a single asset's pool state.

use crate::error::{LendError, Result};
use crate::index_engine;
use crate::ray_math::{mul_div, ray_div, U256};
use crate::Rounding;
use crate::{AssetId, PositionId, Timestamp};
use serde::{Deserialize, Serialize};

/// Immutable-per-reserve parameters fixed at genesis (spec §1: "parameters are
/// static per reserve for this core" — no runtime governance updates).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReserveParams {
    pub reserve_factor: U256,
    pub ltv: U256,
    pub liquidation_threshold: U256,
    pub liquidation_bonus: U256,
    pub base_rate: U256,
    pub slope_1: U256,
    pub slope_2: U256,
    pub optimal_utilization: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reserve {
    pub asset_id: AssetId,
    pub total_liquidity: u64,
    pub total_borrowed: u64,
    pub liquidity_index: U256,
    pub borrow_index: U256,
    pub liquidity_rate: U256,
    pub borrow_rate: U256,
    pub last_update_timestamp: Timestamp,
    pub params: ReserveParams,
}

impl Reserve {
    /// Creates a reserve at genesis: both indices at `RAY`, zero totals, zero rates.
    pub fn genesis(asset_id: AssetId, params: ReserveParams, now: Timestamp) -> Self {
        Self {
            asset_id,
            total_liquidity: 0,
            total_borrowed: 0,
            liquidity_index: *crate::ray_math::RAY,
            borrow_index: *crate::ray_math::RAY,
            liquidity_rate: U256::zero(),
            borrow_rate: U256::zero(),
            last_update_timestamp: now,
            params,
        }
    }

    /// Free liquidity available to borrow or withdraw: `total_liquidity - total_borrowed`.
    pub fn available_liquidity(&self) -> u64 {
        self.total_liquidity.saturating_sub(self.total_borrowed)
    }

    pub fn check_solvent(&self) -> Result<()> {
        if self.total_borrowed > self.total_liquidity {
            return Err(LendError::InvariantViolation(format!(
                "reserve {:?}: total_borrowed {} > total_liquidity {}",
                self.asset_id, self.total_borrowed, self.total_liquidity
            )));
        }
        Ok(())
    }
}

/// A supplier's claim on a reserve. Value scales with the ratio of the current
/// to the recorded `liquidity_index` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupplyPosition {
    pub id: PositionId,
    pub user: crate::UserId,
    pub asset_id: AssetId,
    pub atoken_amount: u64,
    pub liquidity_index_at_supply: U256,
    pub created_at: Timestamp,
}

impl SupplyPosition {
    /// Current underlying value: `atoken_amount * current_index / snapshot_index`.
    pub fn current_value(&self, current_liquidity_index: U256) -> Result<u64> {
        let value = mul_div(
            U256::from(self.atoken_amount),
            current_liquidity_index,
            self.liquidity_index_at_supply,
            Rounding::Floor,
        )?;
        u256_to_u64(value)
    }
}

fn u256_to_u64(v: U256) -> Result<u64> {
    if v > U256::from(u64::MAX) {
        return Err(LendError::Overflow);
    }
    Ok(v.low_u64())
}

pub struct ReserveEngine;

pub struct SupplyOutcome {
    pub position: SupplyPosition,
}

pub struct WithdrawOutcome {
    pub amount_withdrawn: u64,
    /// `None` when the withdrawal fully closes the position.
    pub remaining_position: Option<SupplyPosition>,
}

impl ReserveEngine {
    /// Applies a supply of `amount` underlying units, accruing indices/rates first.
    pub fn supply(
        reserve: &mut Reserve,
        rate_params: &dyn Fn(&Reserve) -> Result<(U256, U256)>,
        user: crate::UserId,
        amount: u64,
        now: Timestamp,
    ) -> Result<SupplyOutcome> {
        if amount == 0 {
            return Err(LendError::Validation("supply amount must be > 0".to_string()));
        }
        index_engine::accrue(reserve, now)?;
        let (liquidity_rate, borrow_rate) = rate_params(reserve)?;
        reserve.liquidity_rate = liquidity_rate;
        reserve.borrow_rate = borrow_rate;

        let position = SupplyPosition {
            id: PositionId::new_v4(),
            user,
            asset_id: reserve.asset_id,
            atoken_amount: amount,
            liquidity_index_at_supply: reserve.liquidity_index,
            created_at: now,
        };

        reserve.total_liquidity = reserve
            .total_liquidity
            .checked_add(amount)
            .ok_or(LendError::Overflow)?;

        Ok(SupplyOutcome { position })
    }

    /// Withdraws `amount_request` underlying units from `position` (0 means "all").
    pub fn withdraw(
        reserve: &mut Reserve,
        rate_params: &dyn Fn(&Reserve) -> Result<(U256, U256)>,
        mut position: SupplyPosition,
        amount_request: u64,
        now: Timestamp,
    ) -> Result<WithdrawOutcome> {
        index_engine::accrue(reserve, now)?;
        let (liquidity_rate, borrow_rate) = rate_params(reserve)?;
        reserve.liquidity_rate = liquidity_rate;
        reserve.borrow_rate = borrow_rate;

        let underlying_value = position.current_value(reserve.liquidity_index)?;
        let requested = if amount_request == 0 {
            underlying_value
        } else {
            amount_request.min(underlying_value)
        };

        if reserve.available_liquidity() < requested {
            return Err(LendError::InsufficientLiquidity {
                requested,
                available: reserve.available_liquidity(),
            });
        }

        reserve.total_liquidity = reserve
            .total_liquidity
            .checked_sub(requested)
            .ok_or(LendError::Overflow)?;

        let remaining_position = if requested >= underlying_value {
            None
        } else {
            let remaining_value = underlying_value - requested;
            position.atoken_amount = remaining_value;
            position.liquidity_index_at_supply = reserve.liquidity_index;
            Some(position)
        };

        Ok(WithdrawOutcome {
            amount_withdrawn: requested,
            remaining_position,
        })
    }

    /// Records `amount` as newly drawn against the reserve's liquidity (DebtEngine
    /// calls this after its own LTV/liquidity checks; see spec §4.5/§4.6).
    pub fn draw(reserve: &mut Reserve, amount: u64) -> Result<()> {
        if amount > reserve.available_liquidity() {
            return Err(LendError::InsufficientLiquidity {
                requested: amount,
                available: reserve.available_liquidity(),
            });
        }
        reserve.total_borrowed = reserve
            .total_borrowed
            .checked_add(amount)
            .ok_or(LendError::Overflow)?;
        Ok(())
    }

    /// Credits `amount` back against the reserve's outstanding borrows.
    pub fn credit_repay(reserve: &mut Reserve, amount: u64) -> Result<()> {
        reserve.total_borrowed = reserve
            .total_borrowed
            .checked_sub(amount)
            .ok_or(LendError::Overflow)?;
        Ok(())
    }
}

/// Utilization in RAY: `total_borrowed / total_liquidity`, 0 when liquidity is 0.
pub fn utilization(reserve: &Reserve) -> Result<U256> {
    if reserve.total_liquidity == 0 {
        return Ok(U256::zero());
    }
    ray_div(U256::from(reserve.total_borrowed), U256::from(reserve.total_liquidity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray_math::RAY;

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

    fn no_rate_change(_: &Reserve) -> Result<(U256, U256)> {
        Ok((U256::zero(), U256::zero()))
    }

    #[test]
    fn supply_then_withdraw_all_round_trips() {
        let mut reserve = Reserve::genesis([2u8; 32], params(), 0);
        let outcome = ReserveEngine::supply(&mut reserve, &no_rate_change, "alice".into(), 100_000_000, 0).unwrap();
        assert_eq!(reserve.total_liquidity, 100_000_000);

        let withdraw = ReserveEngine::withdraw(&mut reserve, &no_rate_change, outcome.position, 0, 0).unwrap();
        assert_eq!(withdraw.amount_withdrawn, 100_000_000);
        assert!(withdraw.remaining_position.is_none());
        assert_eq!(reserve.total_liquidity, 0);
    }

    #[test]
    fn withdraw_respects_available_liquidity() {
        let mut reserve = Reserve::genesis([3u8; 32], params(), 0);
        let outcome = ReserveEngine::supply(&mut reserve, &no_rate_change, "alice".into(), 1_000, 0).unwrap();
        reserve.total_borrowed = 900; // simulate an outstanding borrow elsewhere

        let result = ReserveEngine::withdraw(&mut reserve, &no_rate_change, outcome.position, 0, 0);
        assert!(matches!(result, Err(LendError::InsufficientLiquidity { .. })));
    }

    #[test]
    fn draw_respects_available_liquidity() {
        let mut reserve = Reserve::genesis([4u8; 32], params(), 0);
        reserve.total_liquidity = 1_000;
        assert!(ReserveEngine::draw(&mut reserve, 1_000).is_ok());
        assert_eq!(reserve.total_borrowed, 1_000);
        assert!(matches!(
            ReserveEngine::draw(&mut reserve, 1),
            Err(LendError::InsufficientLiquidity { .. })
        ));
    }

    #[test]
    fn utilization_zero_liquidity_is_zero() {
        let reserve = Reserve::genesis([5u8; 32], params(), 0);
        assert_eq!(utilization(&reserve).unwrap(), U256::zero());
    }

    #[test]
    fn utilization_full_is_ray() {
        let mut reserve = Reserve::genesis([6u8; 32], params(), 0);
        reserve.total_liquidity = 1_000;
        reserve.total_borrowed = 1_000;
        assert_eq!(utilization(&reserve).unwrap(), *RAY);
    }
}
