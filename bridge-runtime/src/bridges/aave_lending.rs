//! Lending bridge: deposits an underlying into a rebasing lending pool and
//! hands the processor a non-rebasing share token in return.
//!
//! One share equals one scaled unit of the bridge's position on the pool, so
//! the share total supply never exceeds the bridge's scaled balance. The two
//! only differ when someone deposits on the bridge's behalf; the last exit
//! sweeps such surplus to the processor. Shares are
//! redeemed for `shares * index / RAY` underlying, which grows as interest
//! accrues.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{BridgeAdapter, ConvertOutcome, ConvertRequest, require_fungible};
use crate::contracts::UnderlyingRegistered;
use crate::error::BridgeError;
use crate::events::EventLog;
use crate::ledger::TokenLedger;
use crate::math::{ray_div_floor, ray_mul_floor};
use crate::types::TokenMetadata;
use crate::venues::LendingVenue;

const BRIDGE_NAME: &str = "aave_lending";

/// Tokens bound to one registered underlying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareBinding {
    pub share_token: Address,
    pub receipt_token: Address,
}

enum Direction {
    Enter,
    Exit,
}

pub struct AaveLendingBridge {
    address: Address,
    processor: Address,
    ledger: Arc<dyn TokenLedger>,
    pool: Arc<dyn LendingVenue>,
    events: Arc<EventLog>,
    bindings: Mutex<BTreeMap<Address, ShareBinding>>,
}

impl AaveLendingBridge {
    pub fn new(
        address: Address,
        processor: Address,
        ledger: Arc<dyn TokenLedger>,
        pool: Arc<dyn LendingVenue>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            address,
            processor,
            ledger,
            pool,
            events,
            bindings: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bind `underlying` to a freshly deployed share token. One-time and
    /// irreversible.
    pub async fn register_underlying(&self, underlying: Address) -> Result<Address, BridgeError> {
        let mut bindings = self.bindings.lock().await;
        if bindings.contains_key(&underlying) {
            return Err(BridgeError::AlreadyRegistered { underlying });
        }
        let receipt_token = self.pool.receipt_token(underlying).await?.ok_or_else(|| {
            BridgeError::UnsupportedAsset(format!("lending pool has no reserve for {underlying}"))
        })?;

        let receipt = self.ledger.metadata(receipt_token).await?;
        let decimals = self.ledger.metadata(underlying).await?.decimals;
        let metadata = TokenMetadata::new(
            format!("Wrapped {}", receipt.name),
            format!("w{}", receipt.symbol),
            decimals,
        );
        let share_token = self.ledger.deploy_token(self.address, metadata).await?;

        bindings.insert(
            underlying,
            ShareBinding {
                share_token,
                receipt_token,
            },
        );
        self.events.emit(
            self.address,
            &UnderlyingRegistered {
                underlying,
                wrappedShare: share_token,
            },
        );
        info!(%underlying, %share_token, %receipt_token, "Registered underlying");
        Ok(share_token)
    }

    pub async fn share_token(&self, underlying: Address) -> Option<Address> {
        self.bindings
            .lock()
            .await
            .get(&underlying)
            .map(|b| b.share_token)
    }

    pub async fn binding(&self, underlying: Address) -> Option<ShareBinding> {
        self.bindings.lock().await.get(&underlying).copied()
    }

    pub async fn underlyings(&self) -> Vec<Address> {
        self.bindings.lock().await.keys().copied().collect()
    }

    fn route(
        bindings: &BTreeMap<Address, ShareBinding>,
        input: Address,
        output: Address,
    ) -> Result<(Direction, Address, ShareBinding), BridgeError> {
        if let Some(binding) = bindings.get(&input) {
            if binding.share_token != output {
                return Err(BridgeError::InvalidInput(format!(
                    "output of a deposit of {input} must be its share token {}",
                    binding.share_token
                )));
            }
            return Ok((Direction::Enter, input, *binding));
        }
        if let Some(binding) = bindings.get(&output) {
            if binding.share_token != input {
                return Err(BridgeError::InvalidInput(format!(
                    "only share token {} redeems for {output}",
                    binding.share_token
                )));
            }
            return Ok((Direction::Exit, output, *binding));
        }
        Err(BridgeError::NotRegistered { underlying: input })
    }

    async fn position(&self, binding: ShareBinding) -> Result<U256, BridgeError> {
        self.pool
            .scaled_balance_of(binding.receipt_token, self.address)
            .await
    }

    /// Every share must be backed by a scaled unit of the pool position. The
    /// position may hold more than the supply when someone deposits on the
    /// bridge's behalf.
    fn check_backed(underlying: Address, supply: U256, scaled: U256) -> Result<(), BridgeError> {
        if supply > scaled {
            error!(%underlying, %supply, %scaled, "Share supply exceeds pool position");
            return Err(BridgeError::InvariantViolation(format!(
                "share supply {supply} exceeds scaled balance {scaled} for {underlying}"
            )));
        }
        Ok(())
    }

    async fn enter(
        &self,
        underlying: Address,
        binding: ShareBinding,
        amount: U256,
    ) -> Result<U256, BridgeError> {
        let index = self.pool.normalized_income(underlying).await?;
        let shares = ray_div_floor(amount, index)?;
        if shares.is_zero() {
            return Err(BridgeError::InvalidInput(format!(
                "deposit of {amount} mints no shares at index {index}"
            )));
        }
        let supply = self.ledger.total_supply(binding.share_token).await?;
        let scaled_before = self.position(binding).await?;
        Self::check_backed(underlying, supply, scaled_before)?;

        let pool = self.pool.address();
        self.ledger.approve(underlying, self.address, pool, amount).await?;
        if let Err(e) = self
            .pool
            .deposit(self.address, underlying, amount, self.address)
            .await
        {
            if let Err(reset) = self
                .ledger
                .approve(underlying, self.address, pool, U256::ZERO)
                .await
            {
                warn!(%underlying, error = %reset, "Failed to reset pool allowance");
            }
            return Err(e);
        }

        let scaled_after = self.position(binding).await?;
        let credited = scaled_after.checked_sub(scaled_before);
        if credited != Some(shares) {
            error!(%underlying, %shares, %scaled_before, %scaled_after, "Pool credited an unexpected scaled amount");
            return Err(BridgeError::InvariantViolation(format!(
                "deposit of {amount} {underlying} moved the scaled balance from \
                 {scaled_before} to {scaled_after}, expected {shares} more"
            )));
        }

        self.ledger
            .mint(binding.share_token, self.address, self.address, shares)
            .await?;
        self.ledger
            .approve(binding.share_token, self.address, self.processor, shares)
            .await?;
        debug!(%underlying, %amount, %shares, %index, "Deposited into lending pool");
        Ok(shares)
    }

    async fn exit(
        &self,
        underlying: Address,
        binding: ShareBinding,
        amount: U256,
    ) -> Result<U256, BridgeError> {
        let supply = self.ledger.total_supply(binding.share_token).await?;
        if amount > supply {
            return Err(BridgeError::InsufficientBalance {
                have: supply,
                need: amount,
            });
        }
        let scaled_before = self.position(binding).await?;
        Self::check_backed(underlying, supply, scaled_before)?;

        // the last shares out also sweep anything deposited on the bridge's behalf
        let full_exit = amount == supply;
        let requested = if full_exit {
            U256::MAX
        } else {
            let index = self.pool.normalized_income(underlying).await?;
            let requested = ray_mul_floor(amount, index)?;
            if requested.is_zero() {
                return Err(BridgeError::InvalidInput(format!(
                    "{amount} shares redeem for nothing at index {index}"
                )));
            }
            requested
        };

        self.ledger
            .burn(binding.share_token, self.address, self.address, amount)
            .await?;
        let withdrawn = match self
            .pool
            .withdraw(self.address, underlying, requested, self.address)
            .await
        {
            Ok(withdrawn) => withdrawn,
            Err(e) => {
                if let Err(remint) = self
                    .ledger
                    .mint(binding.share_token, self.address, self.address, amount)
                    .await
                {
                    error!(%underlying, %amount, error = %remint, "Failed to restore burned shares");
                    return Err(BridgeError::InvariantViolation(format!(
                        "burned {amount} shares of {} but could not restore them: {remint}",
                        binding.share_token
                    )));
                }
                return Err(e);
            }
        };

        self.check_exit(underlying, binding, amount, scaled_before, full_exit)
            .await?;
        self.ledger
            .approve(underlying, self.address, self.processor, withdrawn)
            .await?;
        debug!(%underlying, %amount, %withdrawn, full_exit, "Withdrew from lending pool");
        Ok(withdrawn)
    }

    async fn check_exit(
        &self,
        underlying: Address,
        binding: ShareBinding,
        burned: U256,
        scaled_before: U256,
        full_exit: bool,
    ) -> Result<(), BridgeError> {
        let supply = self.ledger.total_supply(binding.share_token).await?;
        let scaled_after = self.position(binding).await?;
        if full_exit {
            let rebased = self
                .pool
                .balance_of(binding.receipt_token, self.address)
                .await?;
            if !supply.is_zero() || !scaled_after.is_zero() || !rebased.is_zero() {
                error!(%underlying, %supply, %scaled_after, %rebased, "Full exit left a position behind");
                return Err(BridgeError::InvariantViolation(format!(
                    "full exit of {underlying} left supply {supply}, scaled balance \
                     {scaled_after}, receipt balance {rebased}"
                )));
            }
            return Ok(());
        }
        if scaled_before.checked_sub(scaled_after) != Some(burned) {
            error!(%underlying, %burned, %scaled_before, %scaled_after, "Pool burned an unexpected scaled amount");
            return Err(BridgeError::InvariantViolation(format!(
                "burning {burned} shares moved the scaled balance of {underlying} from \
                 {scaled_before} to {scaled_after}"
            )));
        }
        Self::check_backed(underlying, supply, scaled_after)
    }
}

#[async_trait]
impl BridgeAdapter for AaveLendingBridge {
    fn name(&self) -> &str {
        BRIDGE_NAME
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutcome, BridgeError> {
        if request.input_asset_b.is_used() || request.output_asset_b.is_used() {
            return Err(BridgeError::InvalidInput(format!(
                "{BRIDGE_NAME} takes exactly one input and one output"
            )));
        }
        let input = require_fungible(&request.input_asset_a, BRIDGE_NAME)?;
        let output = require_fungible(&request.output_asset_a, BRIDGE_NAME)?;

        // held across the venue calls so registrations and conversions serialize
        let bindings = self.bindings.lock().await;
        let (direction, underlying, binding) = Self::route(&bindings, input, output)?;
        let output_value = match direction {
            Direction::Enter => self.enter(underlying, binding, request.input_amount).await?,
            Direction::Exit => self.exit(underlying, binding, request.input_amount).await?,
        };
        drop(bindings);

        info!(
            nonce = request.interaction_nonce,
            %input,
            %output,
            input_amount = %request.input_amount,
            %output_value,
            "Lending conversion complete"
        );
        Ok(ConvertOutcome::sync(output_value, U256::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::RAY;
    use crate::sandbox::{InMemoryLedger, SandboxLendingPool};
    use crate::types::AssetDescriptor;

    const BRIDGE: Address = Address::repeat_byte(0xb1);
    const PROCESSOR: Address = Address::repeat_byte(0xa1);
    const POOL: Address = Address::repeat_byte(0x90);
    const DAI: Address = Address::repeat_byte(0xda);
    const ADAI: Address = Address::repeat_byte(0xad);

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        pool: Arc<SandboxLendingPool>,
        events: Arc<EventLog>,
        bridge: AaveLendingBridge,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .register_token(DAI, TokenMetadata::new("Dai Stablecoin", "DAI", 18))
            .unwrap();
        let pool = Arc::new(SandboxLendingPool::new(POOL, ledger.clone()));
        pool.add_reserve(
            DAI,
            ADAI,
            TokenMetadata::new("Aave interest bearing DAI", "aDAI", 18),
            RAY,
        )
        .unwrap();
        let events = Arc::new(EventLog::new());
        let bridge = AaveLendingBridge::new(
            BRIDGE,
            PROCESSOR,
            ledger.clone(),
            pool.clone(),
            events.clone(),
        );
        Harness {
            ledger,
            pool,
            events,
            bridge,
        }
    }

    fn request(input: Address, output: Address, amount: u64) -> ConvertRequest {
        ConvertRequest {
            input_asset_a: AssetDescriptor::fungible(1, input),
            input_asset_b: AssetDescriptor::none(),
            output_asset_a: AssetDescriptor::fungible(2, output),
            output_asset_b: AssetDescriptor::none(),
            input_amount: U256::from(amount),
            interaction_nonce: 0,
            aux_data: U256::ZERO,
        }
    }

    /// Escrow `amount` of `token` at the bridge the way the processor would.
    fn escrow(h: &Harness, token: Address, amount: u64) {
        h.ledger.faucet(token, BRIDGE, U256::from(amount)).unwrap();
    }

    #[tokio::test]
    async fn test_register_underlying_deploys_share_token() {
        let h = harness();
        let share = h.bridge.register_underlying(DAI).await.unwrap();

        assert_eq!(h.bridge.share_token(DAI).await, Some(share));
        let meta = h.ledger.metadata(share).await.unwrap();
        assert_eq!(meta.name, "Wrapped Aave interest bearing DAI");
        assert_eq!(meta.symbol, "waDAI");
        assert_eq!(meta.decimals, 18);

        let registered = h.events.decoded::<UnderlyingRegistered>();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].wrappedShare, share);
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let h = harness();
        h.bridge.register_underlying(DAI).await.unwrap();
        let err = h.bridge.register_underlying(DAI).await.unwrap_err();
        assert_eq!(err, BridgeError::AlreadyRegistered { underlying: DAI });
        assert_eq!(h.events.len(), 1);
    }

    #[tokio::test]
    async fn test_register_receipt_token_is_unsupported() {
        let h = harness();
        let err = h.bridge.register_underlying(ADAI).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedAsset(_)));
        assert!(h.bridge.underlyings().await.is_empty());
    }

    #[tokio::test]
    async fn test_enter_unregistered_underlying() {
        let h = harness();
        escrow(&h, DAI, 100);
        let err = h
            .bridge
            .convert(request(DAI, Address::repeat_byte(0x55), 100))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::NotRegistered { underlying: DAI });
    }

    #[tokio::test]
    async fn test_enter_mints_scaled_shares() {
        let h = harness();
        let share = h.bridge.register_underlying(DAI).await.unwrap();
        // index 1.25
        h.pool.accrue(DAI, RAY + RAY / U256::from(4u64)).unwrap();
        escrow(&h, DAI, 1_000);

        let outcome = h.bridge.convert(request(DAI, share, 1_000)).await.unwrap();
        assert_eq!(outcome, ConvertOutcome::sync(U256::from(800u64), U256::ZERO));
        assert_eq!(h.ledger.supply(share).unwrap(), U256::from(800u64));
        assert_eq!(
            h.pool.scaled_balance_of(ADAI, BRIDGE).await.unwrap(),
            U256::from(800u64)
        );
        assert_eq!(
            h.ledger.allowance(share, BRIDGE, PROCESSOR).await.unwrap(),
            U256::from(800u64)
        );
    }

    #[tokio::test]
    async fn test_enter_rejects_wrong_output() {
        let h = harness();
        h.bridge.register_underlying(DAI).await.unwrap();
        escrow(&h, DAI, 10);
        let err = h.bridge.convert(request(DAI, ADAI, 10)).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInput(_)));
        assert_eq!(h.ledger.balance(DAI, BRIDGE).unwrap(), U256::from(10u64));
    }

    #[tokio::test]
    async fn test_enter_dust_mints_nothing() {
        let h = harness();
        let share = h.bridge.register_underlying(DAI).await.unwrap();
        h.pool.accrue(DAI, RAY * U256::from(3u64)).unwrap();
        escrow(&h, DAI, 2);
        let err = h.bridge.convert(request(DAI, share, 2)).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInput(_)));
        assert_eq!(h.ledger.balance(DAI, BRIDGE).unwrap(), U256::from(2u64));
    }

    #[tokio::test]
    async fn test_partial_then_full_exit() {
        let h = harness();
        let share = h.bridge.register_underlying(DAI).await.unwrap();
        escrow(&h, DAI, 1_000);
        h.bridge.convert(request(DAI, share, 1_000)).await.unwrap();
        // index 1.1
        h.pool.accrue(DAI, RAY + RAY / U256::from(10u64)).unwrap();

        let outcome = h.bridge.convert(request(share, DAI, 400)).await.unwrap();
        assert_eq!(outcome.output_value_a, U256::from(440u64));
        assert_eq!(h.ledger.supply(share).unwrap(), U256::from(600u64));
        assert_eq!(
            h.pool.scaled_balance_of(ADAI, BRIDGE).await.unwrap(),
            U256::from(600u64)
        );

        let outcome = h.bridge.convert(request(share, DAI, 600)).await.unwrap();
        assert_eq!(outcome.output_value_a, U256::from(660u64));
        assert!(h.ledger.supply(share).unwrap().is_zero());
        assert!(h.pool.scaled_balance_of(ADAI, BRIDGE).await.unwrap().is_zero());
        assert!(h.pool.balance_of(ADAI, BRIDGE).await.unwrap().is_zero());
        assert_eq!(
            h.ledger.allowance(DAI, BRIDGE, PROCESSOR).await.unwrap(),
            U256::from(660u64)
        );
    }

    #[tokio::test]
    async fn test_exit_more_than_supply() {
        let h = harness();
        let share = h.bridge.register_underlying(DAI).await.unwrap();
        escrow(&h, DAI, 100);
        h.bridge.convert(request(DAI, share, 100)).await.unwrap();

        let err = h.bridge.convert(request(share, DAI, 101)).await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::InsufficientBalance {
                have: U256::from(100u64),
                need: U256::from(101u64),
            }
        );
        assert_eq!(h.ledger.supply(share).unwrap(), U256::from(100u64));
    }

    #[tokio::test]
    async fn test_exit_restores_shares_when_pool_fails() {
        let h = harness();
        let share = h.bridge.register_underlying(DAI).await.unwrap();
        escrow(&h, DAI, 100);
        h.bridge.convert(request(DAI, share, 100)).await.unwrap();
        // drain the pool's liquidity so the withdrawal cannot be paid out
        h.ledger
            .move_tokens(DAI, POOL, Address::repeat_byte(0x01), U256::from(100u64))
            .unwrap();

        let err = h.bridge.convert(request(share, DAI, 50)).await.unwrap_err();
        assert!(matches!(err, BridgeError::ExternalVenueFailure { .. }));
        assert_eq!(h.ledger.supply(share).unwrap(), U256::from(100u64));
        assert_eq!(
            h.pool.scaled_balance_of(ADAI, BRIDGE).await.unwrap(),
            U256::from(100u64)
        );
    }

    /// Deposit `amount` into the pool with the bridge as beneficiary.
    async fn deposit_for_bridge(h: &Harness, amount: u64) {
        let donor = Address::repeat_byte(0x66);
        let amount = U256::from(amount);
        h.ledger.faucet(DAI, donor, amount).unwrap();
        h.ledger.approve(DAI, donor, POOL, amount).await.unwrap();
        h.pool.deposit(donor, DAI, amount, BRIDGE).await.unwrap();
    }

    #[tokio::test]
    async fn test_deposit_on_behalf_of_bridge_does_not_block_conversions() {
        let h = harness();
        let share = h.bridge.register_underlying(DAI).await.unwrap();
        deposit_for_bridge(&h, 1).await;

        escrow(&h, DAI, 500);
        let outcome = h.bridge.convert(request(DAI, share, 500)).await.unwrap();
        assert_eq!(outcome.output_value_a, U256::from(500u64));
        assert_eq!(h.ledger.supply(share).unwrap(), U256::from(500u64));
        assert_eq!(
            h.pool.scaled_balance_of(ADAI, BRIDGE).await.unwrap(),
            U256::from(501u64)
        );

        let outcome = h.bridge.convert(request(share, DAI, 200)).await.unwrap();
        assert_eq!(outcome.output_value_a, U256::from(200u64));
        assert_eq!(
            h.pool.scaled_balance_of(ADAI, BRIDGE).await.unwrap(),
            U256::from(301u64)
        );

        // the last exit takes the surplus along
        let outcome = h.bridge.convert(request(share, DAI, 300)).await.unwrap();
        assert_eq!(outcome.output_value_a, U256::from(301u64));
        assert!(h.ledger.supply(share).unwrap().is_zero());
        assert!(h.pool.scaled_balance_of(ADAI, BRIDGE).await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_unbacked_supply_is_rejected_before_any_transfer() {
        let h = harness();
        let share = h.bridge.register_underlying(DAI).await.unwrap();
        escrow(&h, DAI, 100);
        h.bridge.convert(request(DAI, share, 100)).await.unwrap();
        // the position shrinks behind the bridge's back
        h.pool
            .withdraw(BRIDGE, DAI, U256::from(40u64), Address::repeat_byte(0x01))
            .await
            .unwrap();

        escrow(&h, DAI, 50);
        let err = h.bridge.convert(request(DAI, share, 50)).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvariantViolation(_)));
        assert_eq!(h.ledger.balance(DAI, BRIDGE).unwrap(), U256::from(50u64));
        assert!(h.ledger.allowance(DAI, BRIDGE, POOL).await.unwrap().is_zero());

        let err = h.bridge.convert(request(share, DAI, 10)).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvariantViolation(_)));
        assert_eq!(h.ledger.supply(share).unwrap(), U256::from(100u64));
        assert_eq!(
            h.pool.scaled_balance_of(ADAI, BRIDGE).await.unwrap(),
            U256::from(60u64)
        );
    }
}
