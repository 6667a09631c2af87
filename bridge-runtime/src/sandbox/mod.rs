//! In-memory stand-ins for the token ledger and the external venues.
//!
//! Used by the integration tests and the `bridge-sim` binary to run the
//! processor and both bridges end to end without a chain.

pub mod ledger;
pub mod lending_pool;
pub mod swap_router;

pub use ledger::InMemoryLedger;
pub use lending_pool::SandboxLendingPool;
pub use swap_router::{PoolPrice, SandboxSwapRouter};
