//! Operator-facing toolkit for the autonomous trader service.
//!
//! Builds on `trader-runtime` to provide the staking program catalog, the
//! staking state inspector, the reconciler state machine, the incremental
//! mech event mirror with its JSON-backed cache, trade statistics, and
//! report assembly.

pub mod catalog;
pub mod config;
pub mod env_store;
pub mod inspector;
pub mod mech_events;
pub mod reconciler;
pub mod report;
pub mod store;
pub mod trades;

pub use catalog::{NO_STAKING_PROGRAM_ID, StakingCatalog, StakingProgram};
pub use config::OperatorConfig;
pub use reconciler::{Plan, PlanAction, Reconciler, build_plan};
