//! Conversion between _underlying_ amounts and _scaled_ amounts of a rebasing
//! lending position.
//!
//! The lending venue tracks deposits in scaled units together with a liquidity
//! index expressed in ray (`1e27`) fixed point. A scaled amount `s` is worth
//! `s * index / RAY` underlying tokens; as interest accrues the index grows
//! while `s` stays put.
//!
//! Rounding always goes to the venue's advantage: the amount the venue owes a
//! depositor is rounded down, the amount of scaled units a depositor gives up on
//! withdrawal is rounded up. The bridge mirrors the venue's formulas exactly so
//! that its locally minted share supply never drifts from its scaled balance.

use alloy::primitives::U256;

use crate::error::BridgeError;

/// `1e27`
pub const RAY: U256 = U256::from_limbs([11515845246265065472, 54210108, 0, 0]);

fn overflow(op: &str) -> BridgeError {
    BridgeError::InvalidInput(format!("arithmetic overflow in {op}"))
}

fn require_index(index: U256) -> Result<(), BridgeError> {
    if index.is_zero() {
        return Err(BridgeError::InvariantViolation(
            "liquidity index is zero".into(),
        ));
    }
    Ok(())
}

/// Underlying → scaled. Round down.
pub fn ray_div_floor(amount: U256, index: U256) -> Result<U256, BridgeError> {
    require_index(index)?;
    Ok(amount.checked_mul(RAY).ok_or_else(|| overflow("ray_div"))? / index)
}

/// Underlying → scaled. Round up.
pub fn ray_div_ceil(amount: U256, index: U256) -> Result<U256, BridgeError> {
    require_index(index)?;
    let numerator = amount.checked_mul(RAY).ok_or_else(|| overflow("ray_div"))?;
    Ok(numerator.div_ceil(index))
}

/// Scaled → underlying. Round down.
pub fn ray_mul_floor(scaled: U256, index: U256) -> Result<U256, BridgeError> {
    Ok(scaled.checked_mul(index).ok_or_else(|| overflow("ray_mul"))? / RAY)
}
