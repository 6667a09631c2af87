use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use alloy::primitives::{Address, U256, keccak256};
use async_trait::async_trait;

use crate::error::BridgeError;
use crate::ledger::TokenLedger;
use crate::types::TokenMetadata;

const VENUE: &str = "ledger";

#[derive(Debug)]
struct TokenState {
    metadata: TokenMetadata,
    /// `None` for pre-existing tokens, which only the faucet can mint
    minter: Option<Address>,
    total_supply: U256,
    balances: BTreeMap<Address, U256>,
    allowances: BTreeMap<(Address, Address), U256>,
}

impl TokenState {
    fn new(metadata: TokenMetadata, minter: Option<Address>) -> Self {
        Self {
            metadata,
            minter,
            total_supply: U256::ZERO,
            balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
        }
    }

    fn balance(&self, holder: &Address) -> U256 {
        self.balances.get(holder).copied().unwrap_or_default()
    }

    fn debit(&mut self, holder: Address, amount: U256) -> Result<(), BridgeError> {
        let have = self.balance(&holder);
        let remaining = have
            .checked_sub(amount)
            .ok_or(BridgeError::InsufficientBalance { have, need: amount })?;
        self.balances.insert(holder, remaining);
        Ok(())
    }

    fn credit(&mut self, holder: Address, amount: U256) -> Result<(), BridgeError> {
        let balance = self
            .balance(&holder)
            .checked_add(amount)
            .ok_or_else(|| BridgeError::venue(VENUE, "balance overflow"))?;
        self.balances.insert(holder, balance);
        Ok(())
    }

    fn mint(&mut self, to: Address, amount: U256) -> Result<(), BridgeError> {
        self.total_supply = self
            .total_supply
            .checked_add(amount)
            .ok_or_else(|| BridgeError::venue(VENUE, "supply overflow"))?;
        self.credit(to, amount)
    }

    fn burn(&mut self, from: Address, amount: U256) -> Result<(), BridgeError> {
        self.debit(from, amount)?;
        self.total_supply -= amount;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    tokens: BTreeMap<Address, TokenState>,
    native: BTreeMap<Address, U256>,
    deployed: u64,
}

impl LedgerState {
    fn token(&self, token: Address) -> Result<&TokenState, BridgeError> {
        self.tokens
            .get(&token)
            .ok_or_else(|| BridgeError::venue(VENUE, format!("unknown token {token}")))
    }

    fn token_mut(&mut self, token: Address) -> Result<&mut TokenState, BridgeError> {
        self.tokens
            .get_mut(&token)
            .ok_or_else(|| BridgeError::venue(VENUE, format!("unknown token {token}")))
    }
}

/// In-memory token and native-currency ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a token that exists at a known address (DAI, WETH, ...).
    pub fn register_token(
        &self,
        token: Address,
        metadata: TokenMetadata,
    ) -> Result<(), BridgeError> {
        let mut state = self.guard();
        if state.tokens.contains_key(&token) {
            return Err(BridgeError::venue(VENUE, format!("token {token} already exists")));
        }
        state.tokens.insert(token, TokenState::new(metadata, None));
        Ok(())
    }

    pub fn has_token(&self, token: Address) -> bool {
        self.guard().tokens.contains_key(&token)
    }

    /// Mint `amount` of `token` to `to` regardless of the token's minter.
    pub fn faucet(&self, token: Address, to: Address, amount: U256) -> Result<(), BridgeError> {
        self.guard().token_mut(token)?.mint(to, amount)
    }

    /// Destroy `amount` of `from`'s tokens regardless of the token's minter.
    pub(crate) fn retire(&self, token: Address, from: Address, amount: U256) -> Result<(), BridgeError> {
        self.guard().token_mut(token)?.burn(from, amount)
    }

    pub fn faucet_native(&self, to: Address, amount: U256) -> Result<(), BridgeError> {
        let mut state = self.guard();
        let balance = state.native.entry(to).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| BridgeError::venue(VENUE, "native balance overflow"))?;
        Ok(())
    }

    /// Remove `amount` of native currency from circulation (held by a wrapper).
    pub(crate) fn burn_native(&self, from: Address, amount: U256) -> Result<(), BridgeError> {
        let mut state = self.guard();
        let have = state.native.get(&from).copied().unwrap_or_default();
        let remaining = have
            .checked_sub(amount)
            .ok_or(BridgeError::InsufficientBalance { have, need: amount })?;
        state.native.insert(from, remaining);
        Ok(())
    }

    pub fn balance(&self, token: Address, holder: Address) -> Result<U256, BridgeError> {
        Ok(self.guard().token(token)?.balance(&holder))
    }

    pub fn supply(&self, token: Address) -> Result<U256, BridgeError> {
        Ok(self.guard().token(token)?.total_supply)
    }

    pub fn native_of(&self, holder: Address) -> U256 {
        self.guard().native.get(&holder).copied().unwrap_or_default()
    }

    pub fn move_tokens(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        let mut state = self.guard();
        let token = state.token_mut(token)?;
        token.debit(from, amount)?;
        token.credit(to, amount)
    }

    /// Spend `spender`'s allowance over `from` and move the tokens, all or nothing.
    pub fn spend_and_move(
        &self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        let mut state = self.guard();
        let token_state = state.token_mut(token)?;
        let allowed = token_state
            .allowances
            .get(&(from, spender))
            .copied()
            .unwrap_or_default();
        if allowed < amount {
            return Err(BridgeError::venue(
                VENUE,
                format!("allowance of {spender} over {from} is {allowed}, need {amount}"),
            ));
        }
        token_state.debit(from, amount)?;
        token_state.credit(to, amount)?;
        token_state.allowances.insert((from, spender), allowed - amount);
        Ok(())
    }

    pub fn set_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        self.guard()
            .token_mut(token)?
            .allowances
            .insert((owner, spender), amount);
        Ok(())
    }

    pub fn move_native(&self, from: Address, to: Address, amount: U256) -> Result<(), BridgeError> {
        let mut state = self.guard();
        let have = state.native.get(&from).copied().unwrap_or_default();
        let remaining = have
            .checked_sub(amount)
            .ok_or(BridgeError::InsufficientBalance { have, need: amount })?;
        state.native.insert(from, remaining);
        let balance = state.native.entry(to).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| BridgeError::venue(VENUE, "native balance overflow"))?;
        Ok(())
    }

    fn check_minter(token: &TokenState, address: Address, minter: Address) -> Result<(), BridgeError> {
        if token.minter != Some(minter) {
            return Err(BridgeError::venue(
                VENUE,
                format!("{minter} is not the minter of {address}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenLedger for InMemoryLedger {
    async fn deploy_token(
        &self,
        minter: Address,
        metadata: TokenMetadata,
    ) -> Result<Address, BridgeError> {
        let mut state = self.guard();
        state.deployed += 1;
        let mut seed = minter.to_vec();
        seed.extend_from_slice(&state.deployed.to_be_bytes());
        let token = Address::from_slice(&keccak256(&seed)[12..]);
        if state.tokens.contains_key(&token) {
            return Err(BridgeError::venue(VENUE, format!("token {token} already exists")));
        }
        tracing::debug!(%token, %minter, symbol = %metadata.symbol, "deployed token");
        state
            .tokens
            .insert(token, TokenState::new(metadata, Some(minter)));
        Ok(token)
    }

    async fn metadata(&self, token: Address) -> Result<TokenMetadata, BridgeError> {
        Ok(self.guard().token(token)?.metadata.clone())
    }

    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, BridgeError> {
        self.balance(token, holder)
    }

    async fn total_supply(&self, token: Address) -> Result<U256, BridgeError> {
        self.supply(token)
    }

    async fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        self.move_tokens(token, from, to, amount)
    }

    async fn approve(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        self.set_allowance(token, owner, spender, amount)
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, BridgeError> {
        Ok(self
            .guard()
            .token(token)?
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn transfer_from(
        &self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        self.spend_and_move(token, spender, from, to, amount)
    }

    async fn mint(
        &self,
        token: Address,
        minter: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        let mut state = self.guard();
        let token_state = state.token_mut(token)?;
        Self::check_minter(token_state, token, minter)?;
        token_state.mint(to, amount)
    }

    async fn burn(
        &self,
        token: Address,
        minter: Address,
        from: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        let mut state = self.guard();
        let token_state = state.token_mut(token)?;
        Self::check_minter(token_state, token, minter)?;
        token_state.burn(from, amount)
    }

    async fn native_balance(&self, holder: Address) -> Result<U256, BridgeError> {
        Ok(self.native_of(holder))
    }

    async fn transfer_native(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        self.move_native(from, to, amount)
    }
}
