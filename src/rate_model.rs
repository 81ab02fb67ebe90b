//! Two-slope utilization-based interest rate model (C3).
//!
//! Mirrors the `*Config` + `Default` + calculation-function shape used
//! elsewhere in this crate for small, tunable subsystems (compare
//! `MempoolConfig` in the teacher this crate started from).

use crate::error::Result;
use crate::ray_math::{ray_div, ray_mul, SECONDS_PER_YEAR};
use crate::reserve::{utilization, Reserve};
use crate::ray_math::U256;

/// Computes `(liquidity_rate_per_second, borrow_rate_per_second)` for `reserve`
/// given its current totals. Does not mutate `reserve`; callers assign the
/// result after `IndexEngine::accrue` has run for the same operation.
pub fn recalc(reserve: &Reserve) -> Result<(U256, U256)> {
    let params = &reserve.params;
    let u = utilization(reserve)?;

    let borrow_rate_annual = if reserve.total_liquidity == 0 {
        params.base_rate
    } else if u <= params.optimal_utilization {
        let u_opt = params.optimal_utilization.max(U256::one());
        let slope = ray_mul(params.slope_1, ray_div(u, u_opt)?)?;
        params.base_rate + slope
    } else {
        let excess = u - params.optimal_utilization;
        let denom = (*crate::ray_math::RAY - params.optimal_utilization).max(U256::one());
        let slope = ray_mul(params.slope_2, ray_div(excess, denom)?)?;
        params.base_rate + params.slope_1 + slope
    };

    let liquidity_rate_annual = if reserve.total_liquidity == 0 {
        U256::zero()
    } else {
        let revenue_share = *crate::ray_math::RAY - params.reserve_factor;
        let gross = ray_mul(borrow_rate_annual, u)?;
        ray_mul(gross, revenue_share)?
    };

    let borrow_rate_per_second = borrow_rate_annual / U256::from(SECONDS_PER_YEAR);
    let liquidity_rate_per_second = liquidity_rate_annual / U256::from(SECONDS_PER_YEAR);

    Ok((liquidity_rate_per_second, borrow_rate_per_second))
}
