pub mod aave_lending;
pub mod uniswap;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::error::BridgeError;
use crate::types::AssetDescriptor;

/// Common trait for bridge adapters the processor can delegate to.
///
/// Before `convert` is called the processor has already transferred
/// `input_amount` of every used input asset to [`BridgeAdapter::address`].
/// Fungible outputs must be approved for the processor to pull; native outputs
/// must be sent to the processor before returning.
///
/// A bridge that fails must leave the escrowed input at its address so the
/// processor can unwind the interaction.
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    /// Bridge identifier for logs
    fn name(&self) -> &str;

    /// Account that receives the escrowed input
    fn address(&self) -> Address;

    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutcome, BridgeError>;

    /// Poll an asynchronous interaction. `Ok(None)` means not ready yet.
    async fn finalise(
        &self,
        _request: FinaliseRequest,
    ) -> Result<Option<BridgeOutputs>, BridgeError> {
        Err(BridgeError::AsyncUnsupported)
    }
}

/// Parameters handed to a bridge for one interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRequest {
    pub input_asset_a: AssetDescriptor,
    pub input_asset_b: AssetDescriptor,
    pub output_asset_a: AssetDescriptor,
    pub output_asset_b: AssetDescriptor,
    pub input_amount: U256,
    pub interaction_nonce: u64,
    pub aux_data: U256,
}

/// Bridge answer to `convert`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConvertOutcome {
    pub output_value_a: U256,
    pub output_value_b: U256,
    pub is_async: bool,
}

impl ConvertOutcome {
    pub fn sync(output_value_a: U256, output_value_b: U256) -> Self {
        Self {
            output_value_a,
            output_value_b,
            is_async: false,
        }
    }

    pub fn pending() -> Self {
        Self {
            is_async: true,
            ..Self::default()
        }
    }
}

/// Parameters handed to a bridge when the processor polls a pending interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinaliseRequest {
    pub input_asset_a: AssetDescriptor,
    pub input_asset_b: AssetDescriptor,
    pub output_asset_a: AssetDescriptor,
    pub output_asset_b: AssetDescriptor,
    pub interaction_nonce: u64,
    pub aux_data: U256,
}

/// Output amounts of a completed interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeOutputs {
    pub output_value_a: U256,
    pub output_value_b: U256,
}

/// Token contract of a fungible slot, or `UnsupportedAsset`.
pub fn require_fungible(asset: &AssetDescriptor, bridge: &str) -> Result<Address, BridgeError> {
    match asset.contract {
        Some(token) if asset.kind == crate::types::AssetKind::Fungible => Ok(token),
        _ => Err(BridgeError::UnsupportedAsset(format!(
            "{bridge} only accepts fungible assets, got {:?} asset {}",
            asset.kind, asset.id
        ))),
    }
}
