use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// How value moves for an asset slot of an interaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    #[default]
    NotUsed,
    Native,
    Fungible,
}

/// Asset slot passed by value between the processor and a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AssetDescriptor {
    /// Local handle of the asset inside the processor
    pub id: u32,
    pub kind: AssetKind,
    /// Token contract, present iff `kind == Fungible`
    pub contract: Option<Address>,
}

impl AssetDescriptor {
    pub const fn none() -> Self {
        Self {
            id: 0,
            kind: AssetKind::NotUsed,
            contract: None,
        }
    }

    pub const fn native(id: u32) -> Self {
        Self {
            id,
            kind: AssetKind::Native,
            contract: None,
        }
    }

    pub const fn fungible(id: u32, contract: Address) -> Self {
        Self {
            id,
            kind: AssetKind::Fungible,
            contract: Some(contract),
        }
    }

    pub fn is_used(&self) -> bool {
        self.kind != AssetKind::NotUsed
    }

    /// Pooled-balance identity, `None` for an unused slot.
    pub fn key(&self) -> Option<AssetKey> {
        match (self.kind, self.contract) {
            (AssetKind::Native, _) => Some(AssetKey::Native),
            (AssetKind::Fungible, Some(token)) => Some(AssetKey::Token(token)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        match (self.kind, self.contract) {
            (AssetKind::Fungible, None) => Err(BridgeError::InvalidInput(format!(
                "fungible asset {} has no contract",
                self.id
            ))),
            (AssetKind::Native | AssetKind::NotUsed, Some(contract)) => {
                Err(BridgeError::InvalidInput(format!(
                    "{:?} asset {} must not carry contract {contract}",
                    self.kind, self.id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Identity under which the processor pools balances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssetKey {
    Native,
    Token(Address),
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetKey::Native => write!(f, "native"),
            AssetKey::Token(token) => write!(f, "{token}"),
        }
    }
}

/// Token metadata as reported by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl TokenMetadata {
    pub fn new(name: impl Into<String>, symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            decimals,
        }
    }
}

/// Lifecycle of an interaction. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionStatus {
    Pending,
    Completed {
        output_value_a: U256,
        output_value_b: U256,
    },
    Failed,
}

impl InteractionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InteractionStatus::Pending)
    }
}

/// A single conversion request tracked by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interaction {
    pub nonce: u64,
    pub bridge_id: u32,
    pub input_asset_a: AssetDescriptor,
    pub input_asset_b: AssetDescriptor,
    pub output_asset_a: AssetDescriptor,
    pub output_asset_b: AssetDescriptor,
    pub input_amount: U256,
    pub aux_data: U256,
    pub status: InteractionStatus,
}

impl Interaction {
    /// Input slots that actually carry value
    pub fn used_inputs(&self) -> impl Iterator<Item = &AssetDescriptor> {
        [&self.input_asset_a, &self.input_asset_b]
            .into_iter()
            .filter(|asset| asset.is_used())
    }
}

/// What `Processor::convert` / `Processor::finalise` hand back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteractionResult {
    pub nonce: u64,
    pub output_value_a: U256,
    pub output_value_b: U256,
    pub is_async: bool,
}
