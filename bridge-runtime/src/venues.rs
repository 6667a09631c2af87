//! Call interfaces of the external venues the bridges wrap.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::contracts::ISwapRouter::ExactOutputSingleParams;
use crate::error::BridgeError;

/// Rebasing lending pool (Aave-style). Deposits are tracked in scaled units
/// against a per-reserve liquidity index in ray.
#[async_trait]
pub trait LendingVenue: Send + Sync {
    fn address(&self) -> Address;

    /// Yield-bearing receipt token of an active reserve, `None` when the venue
    /// does not support `underlying`.
    async fn receipt_token(&self, underlying: Address) -> Result<Option<Address>, BridgeError>;

    /// Current liquidity index of the reserve, in ray.
    async fn normalized_income(&self, underlying: Address) -> Result<U256, BridgeError>;

    /// Pull `amount` of `underlying` from `depositor` (which must have approved
    /// the venue) and credit the receipt position of `on_behalf_of`.
    async fn deposit(
        &self,
        depositor: Address,
        underlying: Address,
        amount: U256,
        on_behalf_of: Address,
    ) -> Result<(), BridgeError>;

    /// Redeem `amount` of `owner`'s position and send the underlying to `to`.
    /// `U256::MAX` withdraws the whole position. Returns the amount sent.
    async fn withdraw(
        &self,
        owner: Address,
        underlying: Address,
        amount: U256,
        to: Address,
    ) -> Result<U256, BridgeError>;

    async fn scaled_balance_of(&self, receipt: Address, holder: Address)
    -> Result<U256, BridgeError>;

    /// Rebased balance: `scaled * index / RAY`, rounded down.
    async fn balance_of(&self, receipt: Address, holder: Address) -> Result<U256, BridgeError>;
}

/// Single-pool exact-output swap router (Uniswap V3 style).
#[async_trait]
pub trait SwapVenue: Send + Sync {
    fn address(&self) -> Address;

    /// Wrapped native token accepted by the router.
    fn wrapped_native(&self) -> Address;

    /// Convert `amount` of `holder`'s native balance into the wrapped token.
    async fn wrap_native(&self, holder: Address, amount: U256) -> Result<(), BridgeError>;

    /// Redeem `amount` of `holder`'s wrapped token for native currency.
    async fn unwrap_native(&self, holder: Address, amount: U256) -> Result<(), BridgeError>;

    /// Swap at most `params.amountInMaximum` of `params.tokenIn`, pulled from
    /// `payer`, for exactly `params.amountOut` of `params.tokenOut`. Returns the
    /// input actually spent.
    async fn exact_output_single(
        &self,
        payer: Address,
        params: ExactOutputSingleParams,
    ) -> Result<U256, BridgeError>;
}
