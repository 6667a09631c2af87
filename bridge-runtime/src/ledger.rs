//! Token custody primitives the processor and bridges rely on.
//!
//! Every call names the acting account explicitly; authentication of that
//! account is the ledger's concern, not the runtime's.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::error::BridgeError;
use crate::types::TokenMetadata;

#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Create a new token whose supply only `minter` can change.
    async fn deploy_token(
        &self,
        minter: Address,
        metadata: TokenMetadata,
    ) -> Result<Address, BridgeError>;

    async fn metadata(&self, token: Address) -> Result<TokenMetadata, BridgeError>;

    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, BridgeError>;

    async fn total_supply(&self, token: Address) -> Result<U256, BridgeError>;

    async fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError>;

    /// Set (not add to) the allowance of `spender` over `owner`'s tokens.
    async fn approve(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), BridgeError>;

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, BridgeError>;

    async fn transfer_from(
        &self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError>;

    async fn mint(
        &self,
        token: Address,
        minter: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError>;

    async fn burn(
        &self,
        token: Address,
        minter: Address,
        from: Address,
        amount: U256,
    ) -> Result<(), BridgeError>;

    async fn native_balance(&self, holder: Address) -> Result<U256, BridgeError>;

    async fn transfer_native(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError>;
}
