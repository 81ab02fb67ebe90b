//! DebtPosition entity and DebtEngine (C6): open/repay/liquidate debt positions,
//! health factor.

use crate::error::{LendError, Result};
use crate::index_engine;
use crate::ray_math::{mul_div, ray_div, ray_mul, U256};
use crate::reserve::{Reserve, ReserveEngine};
use crate::Rounding;
use crate::{AssetId, PositionId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DebtPositionStatus {
    Open,
    Closed,
}

/// A single-collateral, single-debt-asset borrow (spec §3, multi-collateral
/// positions are out of scope for this core).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebtPosition {
    pub id: PositionId,
    pub user: UserId,
    pub borrowed_asset_id: AssetId,
    pub collateral_asset_id: AssetId,
    /// Underlying units at last reset; never pre-multiplied by an index
    /// (spec §9 resolved convention).
    pub principal: u64,
    pub borrow_index_at_open: U256,
    pub collateral_amount: u64,
    pub created_at: Timestamp,
    pub status: DebtPositionStatus,
}

impl DebtPosition {
    /// Current outstanding debt: `principal * current_borrow_index / borrow_index_at_open`.
    pub fn current_debt(&self, current_borrow_index: U256) -> Result<u64> {
        let value = mul_div(
            U256::from(self.principal),
            current_borrow_index,
            self.borrow_index_at_open,
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

/// `price_collateral`/`price_borrow` are RAY-scaled numeraire prices
/// (OracleGateway::price_of output); amounts are in underlying units.
fn value_in_numeraire(amount: u64, ray_price: U256) -> Result<U256> {
    ray_mul(U256::from(amount), ray_price)
}

pub struct DebtEngine;

pub struct OpenBorrowOutcome {
    pub position: DebtPosition,
    pub health_factor: U256,
}

pub struct RepayOutcome {
    pub effective_repay: u64,
    pub released_collateral: u64,
    /// `None` once the position is fully repaid.
    pub remaining_position: Option<DebtPosition>,
}

pub struct LiquidateOutcome {
    pub effective_repay: u64,
    pub seized_collateral: u64,
    pub remaining_position: Option<DebtPosition>,
}

impl DebtEngine {
    /// Opens a new borrow against freshly-locked collateral. Caller has already
    /// acquired both reserves' locks in ascending `asset_id` order (spec §4.6/§4.7).
    #[allow(clippy::too_many_arguments)]
    pub fn open_borrow(
        collateral_reserve: &mut Reserve,
        borrow_reserve: &mut Reserve,
        borrow_reserve_rate_params: &dyn Fn(&Reserve) -> Result<(U256, U256)>,
        user: UserId,
        collateral_amount: u64,
        borrow_amount: u64,
        price_collateral: U256,
        price_borrow: U256,
        ltv_collateral: U256,
        now: Timestamp,
    ) -> Result<OpenBorrowOutcome> {
        if collateral_amount == 0 || borrow_amount == 0 {
            return Err(LendError::Validation("amounts must be > 0".to_string()));
        }

        index_engine::accrue(collateral_reserve, now)?;
        index_engine::accrue(borrow_reserve, now)?;

        let collateral_value = value_in_numeraire(collateral_amount, price_collateral)?;
        let debt_value = value_in_numeraire(borrow_amount, price_borrow)?;
        let max_borrowable = ray_mul(collateral_value, ltv_collateral)?;

        if debt_value > max_borrowable {
            return Err(LendError::LtvExceeded {
                debt_value: debt_value.to_string(),
                max_borrowable: max_borrowable.to_string(),
            });
        }

        ReserveEngine::draw(borrow_reserve, borrow_amount)?;
        let (liquidity_rate, borrow_rate) = borrow_reserve_rate_params(borrow_reserve)?;
        borrow_reserve.liquidity_rate = liquidity_rate;
        borrow_reserve.borrow_rate = borrow_rate;

        let position = DebtPosition {
            id: PositionId::new_v4(),
            user,
            borrowed_asset_id: borrow_reserve.asset_id,
            collateral_asset_id: collateral_reserve.asset_id,
            principal: borrow_amount,
            borrow_index_at_open: borrow_reserve.borrow_index,
            collateral_amount,
            created_at: now,
            status: DebtPositionStatus::Open,
        };

        let threshold = collateral_reserve.params.liquidation_threshold;
        let health_factor = health_factor_with_threshold(collateral_value, debt_value, threshold)?;

        Ok(OpenBorrowOutcome {
            position,
            health_factor,
        })
    }

    /// Repays `repay_amount` (0 = full) against `position`, crediting `borrow_reserve`.
    pub fn repay(
        borrow_reserve: &mut Reserve,
        mut position: DebtPosition,
        repay_amount: u64,
        now: Timestamp,
    ) -> Result<RepayOutcome> {
        index_engine::accrue(borrow_reserve, now)?;

        let current_debt = position.current_debt(borrow_reserve.borrow_index)?;
        if current_debt == 0 {
            return Err(LendError::Validation("position has no outstanding debt".to_string()));
        }

        let effective_repay = if repay_amount == 0 {
            current_debt
        } else {
            repay_amount.min(current_debt)
        };

        ReserveEngine::credit_repay(borrow_reserve, effective_repay)?;

        if effective_repay == current_debt {
            position.status = DebtPositionStatus::Closed;
            return Ok(RepayOutcome {
                effective_repay,
                released_collateral: position.collateral_amount,
                remaining_position: None,
            });
        }

        let released = mul_div(
            U256::from(position.collateral_amount),
            U256::from(effective_repay),
            U256::from(current_debt),
            Rounding::Floor,
        )?;
        let released = u256_to_u64(released)?;

        position.principal = current_debt - effective_repay;
        position.borrow_index_at_open = borrow_reserve.borrow_index;
        position.collateral_amount = position.collateral_amount.saturating_sub(released);

        Ok(RepayOutcome {
            effective_repay,
            released_collateral: released,
            remaining_position: Some(position),
        })
    }

    /// Liquidates up to `repay_amount` (0 = full) of `position`'s debt. Caller
    /// has already verified `position`'s health factor via `health_factor_of`.
    pub fn liquidate(
        borrow_reserve: &mut Reserve,
        mut position: DebtPosition,
        repay_amount: u64,
        liquidation_bonus: U256,
        now: Timestamp,
    ) -> Result<LiquidateOutcome> {
        index_engine::accrue(borrow_reserve, now)?;

        let current_debt = position.current_debt(borrow_reserve.borrow_index)?;
        if current_debt == 0 {
            return Err(LendError::Validation("position has no outstanding debt".to_string()));
        }

        let effective_repay = if repay_amount == 0 {
            current_debt
        } else {
            repay_amount.min(current_debt)
        };

        let base = mul_div(
            U256::from(position.collateral_amount),
            U256::from(effective_repay),
            U256::from(current_debt),
            Rounding::Floor,
        )?;
        let bonus = ray_mul(base, liquidation_bonus)?;
        let seized = (base + bonus).min(U256::from(position.collateral_amount));
        let seized = u256_to_u64(seized)?;

        ReserveEngine::credit_repay(borrow_reserve, effective_repay)?;
        position.collateral_amount = position.collateral_amount.saturating_sub(seized);

        let remaining_debt = current_debt - effective_repay;
        let remaining_position = if remaining_debt == 0 {
            position.status = DebtPositionStatus::Closed;
            None
        } else {
            position.principal = remaining_debt;
            position.borrow_index_at_open = borrow_reserve.borrow_index;
            Some(position)
        };

        Ok(LiquidateOutcome {
            effective_repay,
            seized_collateral: seized,
            remaining_position,
        })
    }
}

/// `HF = ray_div(ray_mul(collateral_value, liquidation_threshold), debt_value)`.
/// `debt_value = 0` is represented as `U256::MAX` (spec §4.6).
pub fn health_factor_with_threshold(
    collateral_value: U256,
    debt_value: U256,
    liquidation_threshold: U256,
) -> Result<U256> {
    if debt_value.is_zero() {
        return Ok(U256::MAX);
    }
    let weighted_collateral = ray_mul(collateral_value, liquidation_threshold)?;
    ray_div(weighted_collateral, debt_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray_math::RAY;
    use crate::reserve::ReserveParams;

    fn params(ltv: u64, threshold: u64, bonus: u64) -> ReserveParams {
        ReserveParams {
            reserve_factor: *RAY / U256::from(10u64),
            ltv: *RAY * U256::from(ltv) / U256::from(100u64),
            liquidation_threshold: *RAY * U256::from(threshold) / U256::from(100u64),
            liquidation_bonus: *RAY * U256::from(bonus) / U256::from(100u64),
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
    fn open_borrow_rejects_ltv_exceeded() {
        let mut collateral = Reserve::genesis([1u8; 32], params(75, 80, 5), 0);
        let mut borrow = Reserve::genesis([2u8; 32], params(75, 80, 5), 0);
        borrow.total_liquidity = 1_000_000;

        let result = DebtEngine::open_borrow(
            &mut collateral,
            &mut borrow,
            &no_rate_change,
            "alice".into(),
            100, // 100 sat collateral
            1_000_000, // way more than 75% LTV allows at price parity
            U256::from(1u64),
            U256::from(1u64),
            params(75, 80, 5).ltv,
            0,
        );
        assert!(matches!(result, Err(LendError::LtvExceeded { .. })));
    }

    #[test]
    fn open_borrow_succeeds_within_ltv() {
        let mut collateral = Reserve::genesis([1u8; 32], params(75, 80, 5), 0);
        let mut borrow = Reserve::genesis([2u8; 32], params(75, 80, 5), 0);
        borrow.total_liquidity = 1_000_000;

        let outcome = DebtEngine::open_borrow(
            &mut collateral,
            &mut borrow,
            &no_rate_change,
            "alice".into(),
            200_000_000, // 2 BTC-equivalent sat
            90_000,      // 90,000 numeraire units borrowed
            U256::from(60_000u64) * *RAY / U256::from(200_000_000u64), // price per sat s.t. 2 BTC = 120,000
            *RAY,
            params(75, 80, 5).ltv,
            0,
        );
        assert!(outcome.is_ok());
        let outcome = outcome.unwrap();
        assert_eq!(outcome.position.principal, 90_000);
        assert_eq!(borrow.total_borrowed, 90_000);
    }

    #[test]
    fn full_repay_closes_position() {
        let mut borrow = Reserve::genesis([2u8; 32], params(75, 80, 5), 0);
        borrow.total_liquidity = 1_000_000;
        borrow.total_borrowed = 90_000;

        let position = DebtPosition {
            id: PositionId::new_v4(),
            user: "alice".into(),
            borrowed_asset_id: [2u8; 32],
            collateral_asset_id: [1u8; 32],
            principal: 90_000,
            borrow_index_at_open: borrow.borrow_index,
            collateral_amount: 200_000_000,
            created_at: 0,
            status: DebtPositionStatus::Open,
        };

        let outcome = DebtEngine::repay(&mut borrow, position, 0, 0).unwrap();
        assert_eq!(outcome.effective_repay, 90_000);
        assert_eq!(outcome.released_collateral, 200_000_000);
        assert!(outcome.remaining_position.is_none());
        assert_eq!(borrow.total_borrowed, 0);
    }

    #[test]
    fn partial_repay_releases_proportional_collateral() {
        let mut borrow = Reserve::genesis([2u8; 32], params(75, 80, 5), 0);
        borrow.total_liquidity = 1_000_000;
        borrow.total_borrowed = 90_000;

        let position = DebtPosition {
            id: PositionId::new_v4(),
            user: "alice".into(),
            borrowed_asset_id: [2u8; 32],
            collateral_asset_id: [1u8; 32],
            principal: 90_000,
            borrow_index_at_open: borrow.borrow_index,
            collateral_amount: 200_000_000,
            created_at: 0,
            status: DebtPositionStatus::Open,
        };

        let outcome = DebtEngine::repay(&mut borrow, position, 45_000, 0).unwrap();
        assert_eq!(outcome.effective_repay, 45_000);
        assert_eq!(outcome.released_collateral, 100_000_000);
        let remaining = outcome.remaining_position.unwrap();
        assert_eq!(remaining.principal, 45_000);
        assert_eq!(remaining.collateral_amount, 100_000_000);
    }

    #[test]
    fn liquidation_seizes_base_plus_bonus_capped_at_collateral() {
        let mut borrow = Reserve::genesis([2u8; 32], params(75, 80, 5), 0);
        borrow.total_liquidity = 1_000_000;
        borrow.total_borrowed = 90_000;

        let position = DebtPosition {
            id: PositionId::new_v4(),
            user: "alice".into(),
            borrowed_asset_id: [2u8; 32],
            collateral_asset_id: [1u8; 32],
            principal: 90_000,
            borrow_index_at_open: borrow.borrow_index,
            collateral_amount: 200_000_000,
            created_at: 0,
            status: DebtPositionStatus::Open,
        };

        let bonus = params(75, 80, 5).liquidation_bonus;
        let outcome = DebtEngine::liquidate(&mut borrow, position, 0, bonus, 0).unwrap();
        assert_eq!(outcome.effective_repay, 90_000);
        assert_eq!(outcome.seized_collateral, 200_000_000);
        assert!(outcome.remaining_position.is_none());
    }

    #[test]
    fn health_factor_is_max_when_debt_is_zero() {
        let hf = health_factor_with_threshold(U256::from(100u64), U256::zero(), *RAY).unwrap();
        assert_eq!(hf, U256::MAX);
    }

    #[test]
    fn health_factor_below_one_when_undercollateralized() {
        let collateral_value = U256::from(100_000u64) * *RAY;
        let debt_value = U256::from(90_000u64) * *RAY;
        let threshold = *RAY * U256::from(80u64) / U256::from(100u64);
        let hf = health_factor_with_threshold(collateral_value, debt_value, threshold).unwrap();
        assert!(hf < *RAY);
    }
}
