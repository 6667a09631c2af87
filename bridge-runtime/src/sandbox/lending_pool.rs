use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::error::BridgeError;
use crate::math::{RAY, ray_div_ceil, ray_div_floor, ray_mul_floor};
use crate::sandbox::InMemoryLedger;
use crate::types::TokenMetadata;
use crate::venues::LendingVenue;

const VENUE: &str = "lending_pool";

#[derive(Debug)]
struct Reserve {
    receipt: Address,
    liquidity_index: U256,
    scaled_balances: BTreeMap<Address, U256>,
    scaled_total: U256,
}

impl Reserve {
    fn scaled_of(&self, holder: &Address) -> U256 {
        self.scaled_balances.get(holder).copied().unwrap_or_default()
    }
}

/// Rebasing lending pool over an [`InMemoryLedger`].
///
/// Deposits mint `amount * RAY / index` scaled units (rounded down), withdrawals
/// burn `amount * RAY / index` scaled units (rounded up). Withdrawing
/// `U256::MAX` redeems the caller's whole position.
#[derive(Debug)]
pub struct SandboxLendingPool {
    address: Address,
    ledger: Arc<InMemoryLedger>,
    reserves: Mutex<BTreeMap<Address, Reserve>>,
}

impl SandboxLendingPool {
    pub fn new(address: Address, ledger: Arc<InMemoryLedger>) -> Self {
        Self {
            address,
            ledger,
            reserves: Mutex::new(BTreeMap::new()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, BTreeMap<Address, Reserve>> {
        self.reserves
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// List `underlying` with its receipt token at `receipt`. The receipt token
    /// is registered on the ledger for its metadata only; positions live here.
    pub fn add_reserve(
        &self,
        underlying: Address,
        receipt: Address,
        receipt_metadata: TokenMetadata,
        liquidity_index: U256,
    ) -> Result<(), BridgeError> {
        if liquidity_index < RAY {
            return Err(BridgeError::InvalidInput(format!(
                "liquidity index {liquidity_index} is below one ray"
            )));
        }
        let mut reserves = self.guard();
        if reserves.contains_key(&underlying) {
            return Err(BridgeError::venue(
                VENUE,
                format!("reserve for {underlying} already exists"),
            ));
        }
        if !self.ledger.has_token(receipt) {
            self.ledger.register_token(receipt, receipt_metadata)?;
        }
        reserves.insert(
            underlying,
            Reserve {
                receipt,
                liquidity_index,
                scaled_balances: BTreeMap::new(),
                scaled_total: U256::ZERO,
            },
        );
        tracing::debug!(%underlying, %receipt, "reserve listed");
        Ok(())
    }

    /// Accrue interest by moving the liquidity index to `liquidity_index`.
    /// The interest owed to depositors is minted into the pool's own
    /// underlying balance, standing in for borrower repayments.
    pub fn accrue(&self, underlying: Address, liquidity_index: U256) -> Result<(), BridgeError> {
        let mut reserves = self.guard();
        let reserve = reserves
            .get_mut(&underlying)
            .ok_or_else(|| BridgeError::venue(VENUE, format!("no reserve for {underlying}")))?;
        if liquidity_index < reserve.liquidity_index {
            return Err(BridgeError::InvalidInput(format!(
                "liquidity index cannot decrease from {} to {liquidity_index}",
                reserve.liquidity_index
            )));
        }
        let owed = ray_mul_floor(reserve.scaled_total, liquidity_index)?;
        let held = self.ledger.balance(underlying, self.address)?;
        if owed > held {
            self.ledger.faucet(underlying, self.address, owed - held)?;
        }
        reserve.liquidity_index = liquidity_index;
        tracing::debug!(%underlying, %liquidity_index, "interest accrued");
        Ok(())
    }

    pub fn liquidity_index(&self, underlying: Address) -> Option<U256> {
        self.guard().get(&underlying).map(|r| r.liquidity_index)
    }

    fn reserve_by_receipt<'a>(
        reserves: &'a BTreeMap<Address, Reserve>,
        receipt: Address,
    ) -> Result<&'a Reserve, BridgeError> {
        reserves
            .values()
            .find(|r| r.receipt == receipt)
            .ok_or_else(|| BridgeError::venue(VENUE, format!("{receipt} is not a receipt token")))
    }
}

#[async_trait]
impl LendingVenue for SandboxLendingPool {
    fn address(&self) -> Address {
        self.address
    }

    async fn receipt_token(&self, underlying: Address) -> Result<Option<Address>, BridgeError> {
        Ok(self.guard().get(&underlying).map(|r| r.receipt))
    }

    async fn normalized_income(&self, underlying: Address) -> Result<U256, BridgeError> {
        self.liquidity_index(underlying)
            .ok_or_else(|| BridgeError::venue(VENUE, format!("no reserve for {underlying}")))
    }

    async fn deposit(
        &self,
        depositor: Address,
        underlying: Address,
        amount: U256,
        on_behalf_of: Address,
    ) -> Result<(), BridgeError> {
        let mut reserves = self.guard();
        let reserve = reserves
            .get_mut(&underlying)
            .ok_or_else(|| BridgeError::venue(VENUE, format!("no reserve for {underlying}")))?;
        let scaled = ray_div_floor(amount, reserve.liquidity_index)?;
        if scaled.is_zero() {
            return Err(BridgeError::venue(VENUE, "INVALID_MINT_AMOUNT"));
        }
        self.ledger
            .spend_and_move(underlying, self.address, depositor, self.address, amount)?;
        let balance = reserve.scaled_of(&on_behalf_of) + scaled;
        reserve.scaled_balances.insert(on_behalf_of, balance);
        reserve.scaled_total += scaled;
        tracing::debug!(%underlying, %on_behalf_of, %amount, %scaled, "deposit");
        Ok(())
    }

    async fn withdraw(
        &self,
        owner: Address,
        underlying: Address,
        amount: U256,
        to: Address,
    ) -> Result<U256, BridgeError> {
        let mut reserves = self.guard();
        let reserve = reserves
            .get_mut(&underlying)
            .ok_or_else(|| BridgeError::venue(VENUE, format!("no reserve for {underlying}")))?;
        let scaled = reserve.scaled_of(&owner);
        let balance = ray_mul_floor(scaled, reserve.liquidity_index)?;

        let (withdrawn, burned) = if amount == U256::MAX {
            (balance, scaled)
        } else {
            if amount > balance {
                return Err(BridgeError::venue(VENUE, "NOT_ENOUGH_AVAILABLE_USER_BALANCE"));
            }
            (amount, ray_div_ceil(amount, reserve.liquidity_index)?.min(scaled))
        };
        if withdrawn.is_zero() {
            return Err(BridgeError::venue(VENUE, "INVALID_AMOUNT"));
        }

        let liquidity = self.ledger.balance(underlying, self.address)?;
        if liquidity < withdrawn {
            return Err(BridgeError::venue(
                VENUE,
                format!("insufficient liquidity: {liquidity} < {withdrawn}"),
            ));
        }
        self.ledger.move_tokens(underlying, self.address, to, withdrawn)?;
        reserve.scaled_balances.insert(owner, scaled - burned);
        reserve.scaled_total -= burned;
        tracing::debug!(%underlying, %owner, %withdrawn, %burned, "withdraw");
        Ok(withdrawn)
    }

    async fn scaled_balance_of(
        &self,
        receipt: Address,
        holder: Address,
    ) -> Result<U256, BridgeError> {
        let reserves = self.guard();
        Ok(Self::reserve_by_receipt(&reserves, receipt)?.scaled_of(&holder))
    }

    async fn balance_of(&self, receipt: Address, holder: Address) -> Result<U256, BridgeError> {
        let reserves = self.guard();
        let reserve = Self::reserve_by_receipt(&reserves, receipt)?;
        ray_mul_floor(reserve.scaled_of(&holder), reserve.liquidity_index)
    }
}
