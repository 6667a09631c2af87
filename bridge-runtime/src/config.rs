//! TOML configuration of a runtime deployment: where the processor lives and
//! which bridges are wired to it.

use std::path::Path;
use std::sync::Arc;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::bridges::aave_lending::AaveLendingBridge;
use crate::bridges::uniswap::{DEFAULT_DEADLINE_SECS, DEFAULT_FEE_TIER, MAX_FEE_TIER, UniswapBridge};
use crate::error::BridgeError;
use crate::events::EventLog;
use crate::ledger::TokenLedger;
use crate::venues::{LendingVenue, SwapVenue};

/// Parse a hex address from config.
pub fn parse_address(addr: &str) -> Result<Address, BridgeError> {
    addr.parse::<Address>()
        .map_err(|e| BridgeError::ConfigError(format!("Invalid address '{addr}': {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub aave: Option<AaveBridgeConfig>,
    #[serde(default)]
    pub uniswap: Option<UniswapBridgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AaveBridgeConfig {
    pub bridge_id: u32,
    pub address: String,
    /// Lending pool the bridge deposits into
    pub pool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UniswapBridgeConfig {
    pub bridge_id: u32,
    pub address: String,
    pub router: String,
    pub wrapped_native: String,
    #[serde(default = "default_fee_tier")]
    pub fee_tier: u32,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: i64,
    #[serde(default)]
    pub supported_outputs: Vec<String>,
}

fn default_fee_tier() -> u32 {
    DEFAULT_FEE_TIER
}

fn default_deadline_secs() -> i64 {
    DEFAULT_DEADLINE_SECS
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, BridgeError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check every address parses and bridge ids are distinct.
    pub fn validate(&self) -> Result<(), BridgeError> {
        self.processor.address()?;
        if let Some(aave) = &self.aave {
            parse_address(&aave.address)?;
            parse_address(&aave.pool)?;
        }
        if let Some(uniswap) = &self.uniswap {
            parse_address(&uniswap.address)?;
            parse_address(&uniswap.router)?;
            uniswap.wrapped_native()?;
            uniswap.supported_outputs()?;
            if uniswap.fee_tier > MAX_FEE_TIER {
                return Err(BridgeError::ConfigError(format!(
                    "fee tier {} does not fit in uint24",
                    uniswap.fee_tier
                )));
            }
            if self.aave.as_ref().map(|a| a.bridge_id) == Some(uniswap.bridge_id) {
                return Err(BridgeError::ConfigError(format!(
                    "bridge id {} is used twice",
                    uniswap.bridge_id
                )));
            }
        }
        Ok(())
    }
}

impl ProcessorConfig {
    pub fn address(&self) -> Result<Address, BridgeError> {
        parse_address(&self.address)
    }
}

impl AaveBridgeConfig {
    pub fn pool(&self) -> Result<Address, BridgeError> {
        parse_address(&self.pool)
    }

    pub fn build(
        &self,
        processor: Address,
        ledger: Arc<dyn TokenLedger>,
        pool: Arc<dyn LendingVenue>,
        events: Arc<EventLog>,
    ) -> Result<AaveLendingBridge, BridgeError> {
        Ok(AaveLendingBridge::new(
            parse_address(&self.address)?,
            processor,
            ledger,
            pool,
            events,
        ))
    }
}

impl UniswapBridgeConfig {
    pub fn router(&self) -> Result<Address, BridgeError> {
        parse_address(&self.router)
    }

    pub fn wrapped_native(&self) -> Result<Address, BridgeError> {
        parse_address(&self.wrapped_native)
    }

    pub fn supported_outputs(&self) -> Result<Vec<Address>, BridgeError> {
        self.supported_outputs
            .iter()
            .map(|a| parse_address(a))
            .collect()
    }

    pub fn build(
        &self,
        processor: Address,
        ledger: Arc<dyn TokenLedger>,
        router: Arc<dyn SwapVenue>,
    ) -> Result<UniswapBridge, BridgeError> {
        Ok(UniswapBridge::new(
            parse_address(&self.address)?,
            processor,
            ledger,
            router,
            self.supported_outputs()?,
        )
        .with_fee_tier(self.fee_tier)
        .with_deadline_secs(self.deadline_secs))
    }
}
