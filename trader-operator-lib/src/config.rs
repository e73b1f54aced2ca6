//! Operator configuration.
//!
//! One immutable struct populated at startup from CLI arguments and the
//! `.env` selection file, then passed by reference to every component.

use std::path::PathBuf;

use alloy::primitives::Address;
use trader_runtime::chain::TxSettings;

/// Gnosis chain.
pub const DEFAULT_CHAIN_ID: u64 = 100;

/// Programs excluded from staking discovery probes. The Everest contract
/// predates `getServiceStakingState` and reverts on the probe.
pub const DEFAULT_EXCLUDED_PROGRAMS: &[&str] = &["quickstart_alpha_everest"];

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub service_id: u64,
    pub service_registry: Address,
    /// Program id the reconciler drives toward.
    pub target_program: String,
    /// Path to the owner key file (raw hex or JSON keystore).
    pub key_path: PathBuf,
    pub password: Option<String>,
    /// Attended runs prompt before unstaking mid-epoch; unattended runs
    /// proceed automatically.
    pub attended: bool,
    pub tx_settings: TxSettings,
    /// Directory holding the `.env` selection file and the events cache.
    pub store_dir: PathBuf,
    pub excluded_programs: Vec<String>,
}

impl OperatorConfig {
    pub fn env_file_path(&self) -> PathBuf {
        self.store_dir.join(".env")
    }

    pub fn mech_events_path(&self) -> PathBuf {
        self.store_dir.join("mech_events.json")
    }

    pub fn default_excluded_programs() -> Vec<String> {
        DEFAULT_EXCLUDED_PROGRAMS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}
