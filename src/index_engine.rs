//! Time-weighted accrual of a reserve's `liquidity_index` and `borrow_index`.
//!
//! Must run exactly once at the start of every operation that reads or writes
//! reserve totals (spec §4.2). Re-entrant within one transaction: `dt` collapses
//! to 0 after the first call, so a second call is a no-op.

use crate::error::Result;
use crate::ray_math::accrue_linear;
use crate::reserve::Reserve;
use crate::Timestamp;

/// Accrues both indices on `reserve` up to `now`, then bumps `last_update_timestamp`.
///
/// `now` must be `>= reserve.last_update_timestamp`; the coordinator's `Clock`
/// is assumed monotonic (spec §6), so this is an invariant, not something this
/// function second-guesses.
pub fn accrue(reserve: &mut Reserve, now: Timestamp) -> Result<()> {
    let dt = now.saturating_sub(reserve.last_update_timestamp);

    reserve.liquidity_index = accrue_linear(reserve.liquidity_index, reserve.liquidity_rate, dt)?;
    reserve.borrow_index = accrue_linear(reserve.borrow_index, reserve.borrow_rate, dt)?;
    reserve.last_update_timestamp = now;

    Ok(())
}
