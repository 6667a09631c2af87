pub mod error;
pub mod types;
pub mod math;
pub mod contracts;
pub mod events;
pub mod ledger;
pub mod venues;
pub mod bridges;
pub mod processor;
pub mod config;
pub mod sandbox;

pub use bridges::aave_lending::AaveLendingBridge;
pub use bridges::uniswap::{SwapReceipt, UniswapBridge};
pub use bridges::{BridgeAdapter, BridgeOutputs, ConvertOutcome, ConvertRequest, FinaliseRequest};
pub use error::BridgeError;
pub use events::EventLog;
pub use processor::{ConvertArgs, Processor};
pub use types::*;
