use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::contracts::ISwapRouter::ExactOutputSingleParams;
use crate::error::BridgeError;
use crate::sandbox::InMemoryLedger;
use crate::types::TokenMetadata;
use crate::venues::SwapVenue;

const VENUE: &str = "swap_router";

/// Price of a pool: `numerator` units of the input token buy `denominator`
/// units of the output token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPrice {
    pub numerator: U256,
    pub denominator: U256,
}

/// Exact-output router with fixed per-pair prices. Output liquidity is the
/// router's own ledger balance.
#[derive(Debug)]
pub struct SandboxSwapRouter {
    address: Address,
    wrapped_native: Address,
    ledger: Arc<InMemoryLedger>,
    prices: Mutex<BTreeMap<(Address, Address), PoolPrice>>,
}

impl SandboxSwapRouter {
    /// Registers `wrapped_native` on the ledger as WETH if it is not known yet.
    pub fn new(
        address: Address,
        wrapped_native: Address,
        ledger: Arc<InMemoryLedger>,
    ) -> Result<Self, BridgeError> {
        if !ledger.has_token(wrapped_native) {
            ledger.register_token(wrapped_native, TokenMetadata::new("Wrapped Ether", "WETH", 18))?;
        }
        Ok(Self {
            address,
            wrapped_native,
            ledger,
            prices: Mutex::new(BTreeMap::new()),
        })
    }

    fn guard(&self) -> MutexGuard<'_, BTreeMap<(Address, Address), PoolPrice>> {
        self.prices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_price(
        &self,
        token_in: Address,
        token_out: Address,
        numerator: U256,
        denominator: U256,
    ) -> Result<(), BridgeError> {
        if numerator.is_zero() || denominator.is_zero() {
            return Err(BridgeError::InvalidInput("pool price must be non-zero".into()));
        }
        self.guard().insert(
            (token_in, token_out),
            PoolPrice {
                numerator,
                denominator,
            },
        );
        Ok(())
    }

    /// Input required for `amount_out`, rounded up.
    pub fn quote_exact_output(
        &self,
        token_in: Address,
        token_out: Address,
        amount_out: U256,
    ) -> Result<U256, BridgeError> {
        let price = self
            .guard()
            .get(&(token_in, token_out))
            .copied()
            .ok_or_else(|| {
                BridgeError::venue(VENUE, format!("no pool for {token_in} -> {token_out}"))
            })?;
        let numerator = amount_out
            .checked_mul(price.numerator)
            .ok_or_else(|| BridgeError::venue(VENUE, "quote overflow"))?;
        Ok(numerator.div_ceil(price.denominator))
    }
}

#[async_trait]
impl SwapVenue for SandboxSwapRouter {
    fn address(&self) -> Address {
        self.address
    }

    fn wrapped_native(&self) -> Address {
        self.wrapped_native
    }

    async fn wrap_native(&self, holder: Address, amount: U256) -> Result<(), BridgeError> {
        self.ledger.burn_native(holder, amount)?;
        self.ledger.faucet(self.wrapped_native, holder, amount)
    }

    async fn unwrap_native(&self, holder: Address, amount: U256) -> Result<(), BridgeError> {
        self.ledger.retire(self.wrapped_native, holder, amount)?;
        self.ledger.faucet_native(holder, amount)
    }

    async fn exact_output_single(
        &self,
        payer: Address,
        params: ExactOutputSingleParams,
    ) -> Result<U256, BridgeError> {
        let now = U256::from(chrono::Utc::now().timestamp().max(0) as u64);
        if params.deadline < now {
            return Err(BridgeError::venue(VENUE, "Transaction too old"));
        }
        let amount_in = self.quote_exact_output(params.tokenIn, params.tokenOut, params.amountOut)?;
        if amount_in > params.amountInMaximum {
            return Err(BridgeError::SlippageExceeded {
                maximum: params.amountInMaximum,
                required: amount_in,
            });
        }
        let liquidity = self.ledger.balance(params.tokenOut, self.address)?;
        if liquidity < params.amountOut {
            return Err(BridgeError::venue(
                VENUE,
                format!("insufficient liquidity: {liquidity} < {}", params.amountOut),
            ));
        }

        self.ledger
            .spend_and_move(params.tokenIn, self.address, payer, self.address, amount_in)?;
        self.ledger
            .move_tokens(params.tokenOut, self.address, params.recipient, params.amountOut)?;
        tracing::debug!(
            token_in = %params.tokenIn,
            token_out = %params.tokenOut,
            %amount_in,
            amount_out = %params.amountOut,
            "exact output swap"
        );
        Ok(amount_in)
    }
}
