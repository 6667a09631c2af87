//! Settlement layer: custodies pooled funds and delegates conversions to
//! registered bridges.
//!
//! Every state-changing operation runs under one async mutex, so balances and
//! the interaction table are never observed half-updated. Local state is
//! committed before a bridge is called and only the values a bridge returns are
//! credited.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bridges::{BridgeAdapter, BridgeOutputs, ConvertRequest, FinaliseRequest};
use crate::contracts::{AsyncInteractionStarted, InteractionProcessed};
use crate::error::BridgeError;
use crate::events::EventLog;
use crate::ledger::TokenLedger;
use crate::types::{
    AssetDescriptor, AssetKey, AssetKind, Interaction, InteractionResult, InteractionStatus,
};

/// Arguments of [`Processor::convert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertArgs {
    pub bridge_id: u32,
    pub input_asset_a: AssetDescriptor,
    pub input_asset_b: AssetDescriptor,
    pub output_asset_a: AssetDescriptor,
    pub output_asset_b: AssetDescriptor,
    pub input_amount: U256,
    pub interaction_nonce: u64,
    pub aux_data: U256,
}

impl ConvertArgs {
    pub fn new(
        bridge_id: u32,
        input: AssetDescriptor,
        output: AssetDescriptor,
        input_amount: U256,
        interaction_nonce: u64,
    ) -> Self {
        Self {
            bridge_id,
            input_asset_a: input,
            input_asset_b: AssetDescriptor::none(),
            output_asset_a: output,
            output_asset_b: AssetDescriptor::none(),
            input_amount,
            interaction_nonce,
            aux_data: U256::ZERO,
        }
    }

    pub fn with_input_b(mut self, asset: AssetDescriptor) -> Self {
        self.input_asset_b = asset;
        self
    }

    pub fn with_output_b(mut self, asset: AssetDescriptor) -> Self {
        self.output_asset_b = asset;
        self
    }

    pub fn with_aux_data(mut self, aux_data: U256) -> Self {
        self.aux_data = aux_data;
        self
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.input_amount.is_zero() {
            return Err(BridgeError::InvalidInput("input amount must be positive".into()));
        }
        for asset in [
            &self.input_asset_a,
            &self.input_asset_b,
            &self.output_asset_a,
            &self.output_asset_b,
        ] {
            asset.validate()?;
        }
        if !self.input_asset_a.is_used() {
            return Err(BridgeError::InvalidInput("input asset A is not used".into()));
        }
        if !self.output_asset_a.is_used() {
            return Err(BridgeError::InvalidInput("output asset A is not used".into()));
        }
        if self.input_asset_b.is_used() {
            if self.input_asset_a.key() == self.input_asset_b.key() {
                return Err(BridgeError::InvalidInput("input assets A and B are identical".into()));
            }
            if self.input_amount.checked_mul(U256::from(2u64)).is_none() {
                return Err(BridgeError::InvalidInput(format!(
                    "total input value of two inputs of {} overflows",
                    self.input_amount
                )));
            }
        }
        Ok(())
    }

    fn into_interaction(self) -> Interaction {
        Interaction {
            nonce: self.interaction_nonce,
            bridge_id: self.bridge_id,
            input_asset_a: self.input_asset_a,
            input_asset_b: self.input_asset_b,
            output_asset_a: self.output_asset_a,
            output_asset_b: self.output_asset_b,
            input_amount: self.input_amount,
            aux_data: self.aux_data,
            status: InteractionStatus::Pending,
        }
    }
}

#[derive(Default)]
struct ProcessorState {
    bridges: BTreeMap<u32, Arc<dyn BridgeAdapter>>,
    pooled: BTreeMap<AssetKey, U256>,
    interactions: BTreeMap<u64, Interaction>,
}

impl ProcessorState {
    fn balance(&self, key: &AssetKey) -> U256 {
        self.pooled.get(key).copied().unwrap_or_default()
    }

    fn credit(&mut self, key: AssetKey, amount: U256) -> Result<(), BridgeError> {
        let balance = self
            .balance(&key)
            .checked_add(amount)
            .ok_or_else(|| BridgeError::InvariantViolation(format!("pooled {key} overflows")))?;
        self.pooled.insert(key, balance);
        Ok(())
    }

    fn debit(&mut self, key: AssetKey, amount: U256) -> Result<(), BridgeError> {
        let have = self.balance(&key);
        let remaining = have
            .checked_sub(amount)
            .ok_or(BridgeError::InsufficientBalance { have, need: amount })?;
        self.pooled.insert(key, remaining);
        Ok(())
    }
}

fn input_keys(interaction: &Interaction) -> Vec<AssetKey> {
    interaction.used_inputs().filter_map(|a| a.key()).collect()
}

fn total_input_value(interaction: &Interaction) -> U256 {
    interaction
        .input_amount
        .saturating_mul(U256::from(interaction.used_inputs().count()))
}

fn asset_address(asset: &AssetDescriptor) -> Address {
    asset.contract.unwrap_or(Address::ZERO)
}

pub struct Processor {
    address: Address,
    ledger: Arc<dyn TokenLedger>,
    events: Arc<EventLog>,
    state: Mutex<ProcessorState>,
}

impl Processor {
    pub fn new(address: Address, ledger: Arc<dyn TokenLedger>, events: Arc<EventLog>) -> Self {
        Self {
            address,
            ledger,
            events,
            state: Mutex::new(ProcessorState::default()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub async fn register_bridge(
        &self,
        bridge_id: u32,
        bridge: Arc<dyn BridgeAdapter>,
    ) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        if state.bridges.contains_key(&bridge_id) {
            return Err(BridgeError::BridgeIdTaken(bridge_id));
        }
        info!(bridge_id, name = bridge.name(), address = %bridge.address(), "Registered bridge");
        state.bridges.insert(bridge_id, bridge);
        Ok(())
    }

    pub async fn bridge(&self, bridge_id: u32) -> Option<Arc<dyn BridgeAdapter>> {
        self.state.lock().await.bridges.get(&bridge_id).cloned()
    }

    /// Move `amount` of `asset` from `from` into custody and credit the pool.
    /// Returns the new pooled balance.
    pub async fn fund(
        &self,
        asset: &AssetDescriptor,
        from: Address,
        amount: U256,
    ) -> Result<U256, BridgeError> {
        asset.validate()?;
        let key = asset
            .key()
            .ok_or_else(|| BridgeError::InvalidInput("cannot fund an unused asset".into()))?;
        let mut state = self.state.lock().await;
        match key {
            AssetKey::Native => {
                self.ledger
                    .transfer_native(from, self.address, amount)
                    .await?
            }
            AssetKey::Token(token) => {
                self.ledger
                    .transfer(token, from, self.address, amount)
                    .await?
            }
        }
        state.credit(key, amount)?;
        Ok(state.balance(&key))
    }

    pub async fn pooled_balance(&self, asset: &AssetDescriptor) -> U256 {
        match asset.key() {
            Some(key) => self.state.lock().await.balance(&key),
            None => U256::ZERO,
        }
    }

    pub async fn pooled_balances(&self) -> BTreeMap<AssetKey, U256> {
        self.state.lock().await.pooled.clone()
    }

    pub async fn interaction(&self, nonce: u64) -> Option<Interaction> {
        self.state.lock().await.interactions.get(&nonce).cloned()
    }

    pub async fn interactions(&self) -> Vec<Interaction> {
        self.state
            .lock()
            .await
            .interactions
            .values()
            .cloned()
            .collect()
    }

    pub async fn pending_nonces(&self) -> Vec<u64> {
        self.state
            .lock()
            .await
            .interactions
            .values()
            .filter(|i| i.status == InteractionStatus::Pending)
            .map(|i| i.nonce)
            .collect()
    }

    /// Escrow the input to a bridge and settle whatever it returns.
    pub async fn convert(&self, args: ConvertArgs) -> Result<InteractionResult, BridgeError> {
        args.validate()?;
        let mut state = self.state.lock().await;
        let nonce = args.interaction_nonce;
        if state.interactions.contains_key(&nonce) {
            return Err(BridgeError::DuplicateNonce(nonce));
        }
        let bridge = state
            .bridges
            .get(&args.bridge_id)
            .cloned()
            .ok_or(BridgeError::UnknownBridge(args.bridge_id))?;

        let interaction = args.into_interaction();
        let keys = input_keys(&interaction);
        for key in &keys {
            let have = state.balance(key);
            if have < interaction.input_amount {
                return Err(BridgeError::InsufficientBalance {
                    have,
                    need: interaction.input_amount,
                });
            }
        }

        // commit before any external call
        for key in &keys {
            state.debit(*key, interaction.input_amount)?;
        }
        state.interactions.insert(nonce, interaction.clone());

        if let Err(e) = self
            .move_inputs(&interaction, self.address, bridge.address())
            .await
        {
            for key in &keys {
                state.credit(*key, interaction.input_amount)?;
            }
            state.interactions.remove(&nonce);
            return Err(e);
        }

        let native_before = match self.ledger.native_balance(self.address).await {
            Ok(balance) => balance,
            Err(e) => return Err(self.abandon(&mut state, &bridge, &interaction, e).await),
        };
        let request = ConvertRequest {
            input_asset_a: interaction.input_asset_a,
            input_asset_b: interaction.input_asset_b,
            output_asset_a: interaction.output_asset_a,
            output_asset_b: interaction.output_asset_b,
            input_amount: interaction.input_amount,
            interaction_nonce: nonce,
            aux_data: interaction.aux_data,
        };
        let outcome = match bridge.convert(request).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.abandon(&mut state, &bridge, &interaction, e).await),
        };

        if outcome.is_async {
            if !outcome.output_value_a.is_zero() || !outcome.output_value_b.is_zero() {
                let e = BridgeError::InvalidInput(format!(
                    "{} reported outputs for an asynchronous interaction",
                    bridge.name()
                ));
                return Err(self.abandon(&mut state, &bridge, &interaction, e).await);
            }
            self.events.emit(
                self.address,
                &AsyncInteractionStarted {
                    bridgeId: interaction.bridge_id,
                    nonce: U256::from(nonce),
                    totalInputValue: total_input_value(&interaction),
                },
            );
            info!(nonce, bridge = bridge.name(), "Interaction pending");
            return Ok(InteractionResult {
                nonce,
                output_value_a: U256::ZERO,
                output_value_b: U256::ZERO,
                is_async: true,
            });
        }

        let outputs = BridgeOutputs {
            output_value_a: outcome.output_value_a,
            output_value_b: outcome.output_value_b,
        };
        if let Err(e) = self
            .collect_outputs(bridge.address(), &interaction, outputs, native_before)
            .await
        {
            return Err(self.abandon(&mut state, &bridge, &interaction, e).await);
        }
        self.complete(&mut state, &interaction, outputs)
    }

    /// Poll the bridge of a pending asynchronous interaction and settle it
    /// once the bridge reports outputs.
    pub async fn finalise(&self, nonce: u64) -> Result<InteractionResult, BridgeError> {
        let mut state = self.state.lock().await;
        let interaction = state
            .interactions
            .get(&nonce)
            .cloned()
            .ok_or(BridgeError::UnknownNonce(nonce))?;
        if interaction.status.is_terminal() {
            return Err(BridgeError::AlreadyFinalised(nonce));
        }
        let bridge = state
            .bridges
            .get(&interaction.bridge_id)
            .cloned()
            .ok_or(BridgeError::UnknownBridge(interaction.bridge_id))?;

        let native_before = self.ledger.native_balance(self.address).await?;
        let request = FinaliseRequest {
            input_asset_a: interaction.input_asset_a,
            input_asset_b: interaction.input_asset_b,
            output_asset_a: interaction.output_asset_a,
            output_asset_b: interaction.output_asset_b,
            interaction_nonce: nonce,
            aux_data: interaction.aux_data,
        };
        let outputs = bridge
            .finalise(request)
            .await?
            .ok_or(BridgeError::AsyncNotReady(nonce))?;
        self.collect_outputs(bridge.address(), &interaction, outputs, native_before)
            .await?;
        self.complete(&mut state, &interaction, outputs)
    }

    /// Give up on a pending asynchronous interaction: pull the escrowed input
    /// back from the bridge, refund the pool and mark the interaction failed.
    pub async fn fail_interaction(&self, nonce: u64) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        let interaction = state
            .interactions
            .get(&nonce)
            .cloned()
            .ok_or(BridgeError::UnknownNonce(nonce))?;
        if interaction.status.is_terminal() {
            return Err(BridgeError::AlreadyFinalised(nonce));
        }
        let bridge = state
            .bridges
            .get(&interaction.bridge_id)
            .cloned()
            .ok_or(BridgeError::UnknownBridge(interaction.bridge_id))?;

        self.move_inputs(&interaction, bridge.address(), self.address)
            .await?;
        for key in input_keys(&interaction) {
            state.credit(key, interaction.input_amount)?;
        }
        if let Some(record) = state.interactions.get_mut(&nonce) {
            record.status = InteractionStatus::Failed;
        }
        self.emit_processed(&interaction, U256::ZERO, U256::ZERO, false);
        warn!(nonce, bridge = bridge.name(), "Interaction failed, input refunded");
        Ok(())
    }

    /// Transfer `input_amount` of every used input from `from` to `to`, all or
    /// nothing.
    async fn move_inputs(
        &self,
        interaction: &Interaction,
        from: Address,
        to: Address,
    ) -> Result<(), BridgeError> {
        let amount = interaction.input_amount;
        let mut moved: Vec<&AssetDescriptor> = Vec::new();
        for asset in interaction.used_inputs() {
            if let Err(e) = self.transfer(asset, from, to, amount).await {
                for done in moved {
                    if let Err(undo) = self.transfer(done, to, from, amount).await {
                        error!(nonce = interaction.nonce, error = %undo, "Failed to revert partial transfer");
                    }
                }
                return Err(e);
            }
            moved.push(asset);
        }
        Ok(())
    }

    async fn transfer(
        &self,
        asset: &AssetDescriptor,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), BridgeError> {
        match (asset.kind, asset.contract) {
            (AssetKind::Native, _) => self.ledger.transfer_native(from, to, amount).await,
            (AssetKind::Fungible, Some(token)) => {
                self.ledger.transfer(token, from, to, amount).await
            }
            _ => Err(BridgeError::InvalidInput(format!(
                "asset {} cannot be transferred",
                asset.id
            ))),
        }
    }

    /// Check the reported outputs against the slots and pull them into
    /// custody. On error nothing has been pulled.
    async fn collect_outputs(
        &self,
        bridge: Address,
        interaction: &Interaction,
        outputs: BridgeOutputs,
        native_before: U256,
    ) -> Result<(), BridgeError> {
        let slots = [
            (&interaction.output_asset_a, outputs.output_value_a),
            (&interaction.output_asset_b, outputs.output_value_b),
        ];
        let mut native_expected = U256::ZERO;
        for (asset, value) in slots {
            match asset.kind {
                AssetKind::NotUsed if !value.is_zero() => {
                    return Err(BridgeError::InvalidInput(format!(
                        "bridge reported {value} for an unused output slot"
                    )));
                }
                AssetKind::Native => {
                    native_expected = native_expected.checked_add(value).ok_or_else(|| {
                        BridgeError::InvalidInput(format!(
                            "bridge reported native outputs that overflow: {native_expected} + {value}"
                        ))
                    })?;
                }
                _ => {}
            }
        }
        if !native_expected.is_zero() {
            let native_after = self.ledger.native_balance(self.address).await?;
            let arrived = native_after.saturating_sub(native_before);
            if arrived < native_expected {
                return Err(BridgeError::InvariantViolation(format!(
                    "bridge reported {native_expected} native output but {arrived} arrived"
                )));
            }
        }

        let mut pulled: Vec<(Address, U256)> = Vec::new();
        for (asset, value) in slots {
            let Some(token) = asset.contract else { continue };
            if asset.kind != AssetKind::Fungible || value.is_zero() {
                continue;
            }
            if let Err(e) = self
                .ledger
                .transfer_from(token, self.address, bridge, self.address, value)
                .await
            {
                for (token, value) in pulled {
                    if let Err(undo) = self.ledger.transfer(token, self.address, bridge, value).await {
                        error!(nonce = interaction.nonce, error = %undo, "Failed to return pulled output");
                    }
                }
                if !native_expected.is_zero() {
                    if let Err(undo) = self
                        .ledger
                        .transfer_native(self.address, bridge, native_expected)
                        .await
                    {
                        error!(nonce = interaction.nonce, error = %undo, "Failed to return native output");
                    }
                }
                return Err(e);
            }
            pulled.push((token, value));
        }
        Ok(())
    }

    fn complete(
        &self,
        state: &mut ProcessorState,
        interaction: &Interaction,
        outputs: BridgeOutputs,
    ) -> Result<InteractionResult, BridgeError> {
        for (asset, value) in [
            (&interaction.output_asset_a, outputs.output_value_a),
            (&interaction.output_asset_b, outputs.output_value_b),
        ] {
            if let Some(key) = asset.key() {
                state.credit(key, value)?;
            }
        }
        if let Some(record) = state.interactions.get_mut(&interaction.nonce) {
            record.status = InteractionStatus::Completed {
                output_value_a: outputs.output_value_a,
                output_value_b: outputs.output_value_b,
            };
        }
        self.emit_processed(interaction, outputs.output_value_a, outputs.output_value_b, true);
        info!(
            nonce = interaction.nonce,
            bridge_id = interaction.bridge_id,
            input_amount = %interaction.input_amount,
            output_value_a = %outputs.output_value_a,
            output_value_b = %outputs.output_value_b,
            "Interaction completed"
        );
        Ok(InteractionResult {
            nonce: interaction.nonce,
            output_value_a: outputs.output_value_a,
            output_value_b: outputs.output_value_b,
            is_async: false,
        })
    }

    /// Unwind a failed conversion. If the escrow comes back the pool is
    /// restored and the nonce freed; otherwise the interaction is marked
    /// failed. Returns the bridge's error.
    async fn abandon(
        &self,
        state: &mut ProcessorState,
        bridge: &Arc<dyn BridgeAdapter>,
        interaction: &Interaction,
        cause: BridgeError,
    ) -> BridgeError {
        let nonce = interaction.nonce;
        match self
            .move_inputs(interaction, bridge.address(), self.address)
            .await
        {
            Ok(()) => {
                let mut restored = Ok(());
                for key in input_keys(interaction) {
                    restored = restored.and(state.credit(key, interaction.input_amount));
                }
                if let Err(e) = restored {
                    error!(nonce, error = %e, "Failed to restore pooled balance");
                    return e;
                }
                state.interactions.remove(&nonce);
                warn!(nonce, bridge = bridge.name(), error = %cause, "Interaction reverted");
            }
            Err(unwind) => {
                if let Some(record) = state.interactions.get_mut(&nonce) {
                    record.status = InteractionStatus::Failed;
                }
                error!(
                    nonce,
                    bridge = bridge.name(),
                    error = %cause,
                    unwind_error = %unwind,
                    "Escrowed input could not be recovered"
                );
            }
        }
        self.emit_processed(interaction, U256::ZERO, U256::ZERO, false);
        cause
    }

    fn emit_processed(
        &self,
        interaction: &Interaction,
        output_value_a: U256,
        output_value_b: U256,
        result: bool,
    ) {
        self.events.emit(
            self.address,
            &InteractionProcessed {
                bridgeId: interaction.bridge_id,
                nonce: U256::from(interaction.nonce),
                totalInputValue: total_input_value(interaction),
                outputAssetA: asset_address(&interaction.output_asset_a),
                outputAssetB: asset_address(&interaction.output_asset_b),
                outputValueA: output_value_a,
                outputValueB: output_value_b,
                result,
            },
        );
    }
}
