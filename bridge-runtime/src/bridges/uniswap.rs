use std::collections::BTreeSet;
use std::sync::Arc;

use alloy::primitives::{Address, U256, Uint};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{BridgeAdapter, ConvertOutcome, ConvertRequest, require_fungible};
use crate::contracts::ISwapRouter::ExactOutputSingleParams;
use crate::error::BridgeError;
use crate::ledger::TokenLedger;
use crate::types::{AssetDescriptor, AssetKind};
use crate::venues::SwapVenue;

/// Alloy type alias for uint24 (used for Uniswap fee tiers)
type Uint24 = Uint<24, 1>;
/// Alloy type alias for uint160 (used for sqrtPriceLimitX96)
type Uint160 = Uint<160, 3>;

const BRIDGE_NAME: &str = "uniswap";

/// 0.3% pool
pub const DEFAULT_FEE_TIER: u32 = 3000;

/// Fee tiers are uint24 on the router
pub const MAX_FEE_TIER: u32 = (1 << 24) - 1;

/// Ten hours
pub const DEFAULT_DEADLINE_SECS: i64 = 36_000;

/// Input spent and output received by one swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapReceipt {
    pub amount_in: U256,
    pub amount_out: U256,
}

pub struct UniswapBridge {
    address: Address,
    processor: Address,
    ledger: Arc<dyn TokenLedger>,
    router: Arc<dyn SwapVenue>,
    supported_outputs: BTreeSet<Address>,
    fee_tier: u32,
    deadline_secs: i64,
}

impl UniswapBridge {
    pub fn new(
        address: Address,
        processor: Address,
        ledger: Arc<dyn TokenLedger>,
        router: Arc<dyn SwapVenue>,
        supported_outputs: impl IntoIterator<Item = Address>,
    ) -> Self {
        Self {
            address,
            processor,
            ledger,
            router,
            supported_outputs: supported_outputs.into_iter().collect(),
            fee_tier: DEFAULT_FEE_TIER,
            deadline_secs: DEFAULT_DEADLINE_SECS,
        }
    }

    pub fn with_fee_tier(mut self, fee_tier: u32) -> Self {
        self.fee_tier = fee_tier;
        self
    }

    pub fn with_deadline_secs(mut self, deadline_secs: i64) -> Self {
        self.deadline_secs = deadline_secs;
        self
    }

    pub fn is_supported_output(&self, token: Address) -> bool {
        self.supported_outputs.contains(&token)
    }

    pub fn fee_tier(&self) -> u32 {
        self.fee_tier
    }

    fn deadline(&self) -> U256 {
        let deadline = chrono::Utc::now() + chrono::Duration::seconds(self.deadline_secs);
        U256::from(deadline.timestamp().max(0) as u64)
    }

    /// Buy exactly `amount_out` of `output` with at most `amount_in_maximum` of
    /// `input`, paid by `payer` and delivered to `recipient`.
    ///
    /// A native input is wrapped first. When the output is the wrapped native
    /// token itself no swap happens and the wrapped amount is the output.
    /// Unspent input and router allowance stay with `payer`.
    pub async fn swap(
        &self,
        payer: Address,
        recipient: Address,
        input: &AssetDescriptor,
        output: &AssetDescriptor,
        amount_out: U256,
        amount_in_maximum: U256,
    ) -> Result<SwapReceipt, BridgeError> {
        input.validate()?;
        let token_out = require_fungible(output, BRIDGE_NAME)?;
        if !self.is_supported_output(token_out) {
            return Err(BridgeError::UnsupportedAsset(format!(
                "{BRIDGE_NAME} does not swap into {token_out}"
            )));
        }

        let wrapped = match input.kind {
            AssetKind::NotUsed => {
                return Err(BridgeError::InvalidInput("swap input is not used".into()));
            }
            AssetKind::Native => {
                let weth = self.router.wrapped_native();
                self.router.wrap_native(payer, amount_in_maximum).await?;
                if token_out == weth {
                    if recipient != payer {
                        self.ledger
                            .transfer(weth, payer, recipient, amount_in_maximum)
                            .await?;
                    }
                    debug!(amount = %amount_in_maximum, "Wrapped native input, no swap needed");
                    return Ok(SwapReceipt {
                        amount_in: amount_in_maximum,
                        amount_out: amount_in_maximum,
                    });
                }
                true
            }
            AssetKind::Fungible => false,
        };
        let token_in = match input.contract {
            Some(token) => token,
            None => self.router.wrapped_native(),
        };
        if token_in == token_out {
            return Err(BridgeError::InvalidInput(format!(
                "cannot swap {token_in} into itself"
            )));
        }

        let result = self
            .exact_output(payer, recipient, token_in, token_out, amount_out, amount_in_maximum)
            .await;
        match result {
            Ok(amount_in) => Ok(SwapReceipt {
                amount_in,
                amount_out,
            }),
            Err(e) => {
                if wrapped {
                    if let Err(unwrap) = self.router.unwrap_native(payer, amount_in_maximum).await {
                        error!(%payer, amount = %amount_in_maximum, error = %unwrap, "Failed to unwrap native input");
                    }
                }
                Err(e)
            }
        }
    }

    async fn exact_output(
        &self,
        payer: Address,
        recipient: Address,
        token_in: Address,
        token_out: Address,
        amount_out: U256,
        amount_in_maximum: U256,
    ) -> Result<U256, BridgeError> {
        if self.fee_tier > MAX_FEE_TIER {
            return Err(BridgeError::InvalidInput(format!(
                "fee tier {} does not fit in uint24",
                self.fee_tier
            )));
        }
        self.ledger
            .approve(token_in, payer, self.router.address(), amount_in_maximum)
            .await?;
        let params = ExactOutputSingleParams {
            tokenIn: token_in,
            tokenOut: token_out,
            fee: Uint24::from(self.fee_tier),
            recipient,
            deadline: self.deadline(),
            amountOut: amount_out,
            amountInMaximum: amount_in_maximum,
            sqrtPriceLimitX96: Uint160::ZERO,
        };
        let amount_in = self.router.exact_output_single(payer, params).await?;
        debug!(%token_in, %token_out, %amount_in, %amount_out, fee = self.fee_tier, "Swapped");
        Ok(amount_in)
    }
}

#[async_trait]
impl BridgeAdapter for UniswapBridge {
    fn name(&self) -> &str {
        BRIDGE_NAME
    }

    fn address(&self) -> Address {
        self.address
    }

    /// `aux_data` is the exact output amount, `input_amount` the most the
    /// bridge may spend. Setting `output_asset_b` to the input asset returns
    /// the unspent input as output B.
    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutcome, BridgeError> {
        if request.input_asset_b.is_used() {
            return Err(BridgeError::InvalidInput(format!(
                "{BRIDGE_NAME} takes a single input"
            )));
        }
        let amount_out = request.aux_data;
        if amount_out.is_zero() {
            return Err(BridgeError::InvalidInput(
                "aux_data must carry the output amount".into(),
            ));
        }
        let refund = request.output_asset_b.is_used();
        if refund
            && (request.output_asset_b != request.input_asset_a
                || request.input_asset_a.kind != AssetKind::Fungible)
        {
            return Err(BridgeError::InvalidInput(
                "output B may only return the unspent fungible input".into(),
            ));
        }

        let receipt = self
            .swap(
                self.address,
                self.address,
                &request.input_asset_a,
                &request.output_asset_a,
                amount_out,
                request.input_amount,
            )
            .await?;

        let token_out = require_fungible(&request.output_asset_a, BRIDGE_NAME)?;
        self.ledger
            .approve(token_out, self.address, self.processor, receipt.amount_out)
            .await?;

        let unspent = request.input_amount.saturating_sub(receipt.amount_in);
        let output_value_b = match (refund, request.input_asset_a.contract) {
            (true, Some(token_in)) => {
                self.ledger
                    .approve(token_in, self.address, self.processor, unspent)
                    .await?;
                unspent
            }
            _ => {
                if !unspent.is_zero() {
                    warn!(nonce = request.interaction_nonce, %unspent, "Unspent swap input stays with the bridge");
                }
                U256::ZERO
            }
        };

        info!(
            nonce = request.interaction_nonce,
            %token_out,
            amount_in = %receipt.amount_in,
            amount_out = %receipt.amount_out,
            "Swap conversion complete"
        );
        Ok(ConvertOutcome::sync(receipt.amount_out, output_value_b))
    }
}
