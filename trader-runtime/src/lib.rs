//! Shared runtime library for the trader operator toolkit.
//!
//! Provides the chain client (transaction submission with retry/repricing),
//! `sol!` contract bindings for the staking system, and the staking types
//! shared by every component.

pub mod chain;
pub mod contracts;
pub mod error;
pub mod types;

pub use chain::{ChainClient, TxSettings};
pub use error::OperatorError;
pub use types::{PlannedTx, StakingState, TxDescriptor, TxKind};
