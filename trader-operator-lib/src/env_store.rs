//! `.env` selection store.
//!
//! The selected staking program and its derived deployment variables are
//! persisted to a `.env`-style key-value file consumed by downstream
//! deployment tooling. `dotenvy` handles reading; writing preserves
//! unrelated lines and comments verbatim.

use std::path::{Path, PathBuf};

use alloy::primitives::Address;
use trader_runtime::chain::ChainClient;
use trader_runtime::contracts::{IActivityChecker, IStakingToken};
use trader_runtime::error::OperatorError;

use crate::catalog::{NO_STAKING_PROGRAM_ID, StakingCatalog, ZERO_ADDRESS};

/// One line of the file: either an opaque line (comment, blank) kept as-is,
/// or a key-value pair.
#[derive(Debug, Clone)]
enum Line {
    Raw(String),
    Pair(String, String),
}

#[derive(Debug)]
pub struct EnvFile {
    path: PathBuf,
    lines: Vec<Line>,
}

impl EnvFile {
    /// Load the file, or start empty when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OperatorError> {
        let path = path.as_ref().to_path_buf();
        let lines = match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .lines()
                .map(|line| {
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        return Line::Raw(line.to_string());
                    }
                    match line.split_once('=') {
                        Some((key, value)) => {
                            Line::Pair(key.trim().to_string(), value.trim().to_string())
                        }
                        None => Line::Raw(line.to_string()),
                    }
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(OperatorError::Store(e.to_string())),
        };
        Ok(Self { path, lines })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Pair(k, v) if k == key => Some(v.as_str()),
            _ => None,
        })
    }

    /// Set a key, replacing an existing pair in place or appending.
    pub fn set(&mut self, key: &str, value: &str) {
        for line in &mut self.lines {
            if let Line::Pair(k, v) = line {
                if k == key {
                    *v = value.to_string();
                    return;
                }
            }
        }
        self.lines
            .push(Line::Pair(key.to_string(), value.to_string()));
    }

    pub fn unset(&mut self, key: &str) {
        self.lines
            .retain(|line| !matches!(line, Line::Pair(k, _) if k == key));
    }

    pub fn save(&self) -> Result<(), OperatorError> {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Raw(raw) => out.push_str(raw),
                Line::Pair(k, v) => {
                    out.push_str(k);
                    out.push('=');
                    out.push_str(v);
                }
            }
            out.push('\n');
        }
        std::fs::write(&self.path, out).map_err(|e| OperatorError::Store(e.to_string()))
    }
}

/// Deployment variables derived from a staking program selection.
#[derive(Debug, Clone)]
pub struct StakingEnvVariables {
    pub use_staking: bool,
    pub program_id: String,
    pub agent_id: String,
    pub service_registry: Address,
    pub service_registry_token_utility: Address,
    pub olas_address: Address,
    pub staking_address: Address,
    pub activity_checker: Address,
    pub mech_contract: Address,
    pub min_staking_bond: String,
    pub min_staking_deposit: String,
}

impl StakingEnvVariables {
    /// Fixed variable set for the no-staking sentinel. Non-staking agents
    /// still need an arbitrary staking contract address so that
    /// `getStakingState()` can be called.
    pub fn no_staking() -> Self {
        Self {
            use_staking: false,
            program_id: NO_STAKING_PROGRAM_ID.to_string(),
            agent_id: "25".to_string(),
            service_registry: alloy::primitives::address!(
                "9338b5153AE39BB89f50468E608eD9d764B755fD"
            ),
            service_registry_token_utility: alloy::primitives::address!(
                "a45E64d13A30a51b91ae0eb182e88a40e9b18eD8"
            ),
            olas_address: ZERO_ADDRESS,
            staking_address: alloy::primitives::address!(
                "43fB32f25dce34EB76c78C7A42C8F40F84BCD237"
            ),
            activity_checker: ZERO_ADDRESS,
            mech_contract: alloy::primitives::address!(
                "77af31De935740567Cf4fF1986D04B2c964A786a"
            ),
            min_staking_bond: "0".to_string(),
            min_staking_deposit: "0".to_string(),
        }
    }

    pub fn apply(&self, env: &mut EnvFile) {
        env.set("USE_STAKING", if self.use_staking { "true" } else { "false" });
        env.set("STAKING_PROGRAM", &self.program_id);
        env.set("AGENT_ID", &self.agent_id);
        env.set(
            "CUSTOM_SERVICE_REGISTRY_ADDRESS",
            &format!("{:#x}", self.service_registry),
        );
        env.set(
            "CUSTOM_SERVICE_REGISTRY_TOKEN_UTILITY_ADDRESS",
            &format!("{:#x}", self.service_registry_token_utility),
        );
        env.set("CUSTOM_OLAS_ADDRESS", &format!("{:#x}", self.olas_address));
        env.set(
            "CUSTOM_STAKING_ADDRESS",
            &format!("{:#x}", self.staking_address),
        );
        env.set(
            "MECH_ACTIVITY_CHECKER_CONTRACT",
            &format!("{:#x}", self.activity_checker),
        );
        env.set(
            "MECH_CONTRACT_ADDRESS",
            &format!("{:#x}", self.mech_contract),
        );
        env.set("MIN_STAKING_BOND_OLAS", &self.min_staking_bond);
        env.set("MIN_STAKING_DEPOSIT_OLAS", &self.min_staking_deposit);
    }
}

/// Clear the selection keys, leaving everything else in place.
pub fn reset_selection(env: &mut EnvFile) {
    env.unset("USE_STAKING");
    env.unset("STAKING_PROGRAM");
}

/// Read the derived deployment variables for a program from its staking
/// contract. Newer programs expose an activity checker whose `agentMech()`
/// points at the mech; older ones expose `agentMech()` directly.
pub async fn staking_env_variables(
    client: &ChainClient,
    catalog: &StakingCatalog,
    program_id: &str,
) -> Result<StakingEnvVariables, OperatorError> {
    if program_id == NO_STAKING_PROGRAM_ID {
        return Ok(StakingEnvVariables::no_staking());
    }

    let staking_address = catalog.resolve(program_id)?;
    let staking = IStakingToken::new(staking_address, &client.provider);
    let rpc_err = |e: alloy::contract::Error| OperatorError::Rpc(e.to_string());

    let agent_id = staking
        .agentIds(alloy::primitives::U256::ZERO)
        .call()
        .await
        .map_err(rpc_err)?;
    let service_registry = staking.serviceRegistry().call().await.map_err(rpc_err)?;
    let olas_address = staking.stakingToken().call().await.map_err(rpc_err)?;
    let service_registry_token_utility = staking
        .serviceRegistryTokenUtility()
        .call()
        .await
        .map_err(rpc_err)?;
    let min_staking_deposit = staking.minStakingDeposit().call().await.map_err(rpc_err)?;

    let (activity_checker, mech_contract) = match staking.activityChecker().call().await {
        Ok(checker) if checker != ZERO_ADDRESS => {
            let checker_contract = IActivityChecker::new(checker, &client.provider);
            let mech = checker_contract.agentMech().call().await.map_err(rpc_err)?;
            (checker, mech)
        }
        _ => {
            let mech = staking.agentMech().call().await.map_err(rpc_err)?;
            (ZERO_ADDRESS, mech)
        }
    };

    Ok(StakingEnvVariables {
        use_staking: true,
        program_id: program_id.to_string(),
        agent_id: agent_id.to_string(),
        service_registry,
        service_registry_token_utility,
        olas_address,
        staking_address,
        activity_checker,
        mech_contract,
        // The bond equals the deposit for these programs.
        min_staking_bond: min_staking_deposit.to_string(),
        min_staking_deposit: min_staking_deposit.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_file_set_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");

        let mut env = EnvFile::load(&path).unwrap();
        env.set("STAKING_PROGRAM", "quickstart_beta_expert");
        env.set("USE_STAKING", "true");
        env.save().unwrap();

        let env = EnvFile::load(&path).unwrap();
        assert_eq!(env.get("STAKING_PROGRAM"), Some("quickstart_beta_expert"));
        assert_eq!(env.get("USE_STAKING"), Some("true"));
        assert_eq!(env.get("MISSING"), None);
    }

    #[test]
    fn test_env_file_set_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# deployment config\nSTAKING_PROGRAM=old\nRPC=x\n").unwrap();

        let mut env = EnvFile::load(&path).unwrap();
        env.set("STAKING_PROGRAM", "new");
        env.save().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("# deployment config\n"));
        assert_eq!(raw.matches("STAKING_PROGRAM").count(), 1);
        assert!(raw.contains("STAKING_PROGRAM=new"));
        assert!(raw.contains("RPC=x"));
    }

    #[test]
    fn test_reset_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");

        let mut env = EnvFile::load(&path).unwrap();
        StakingEnvVariables::no_staking().apply(&mut env);
        assert_eq!(env.get("USE_STAKING"), Some("false"));

        reset_selection(&mut env);
        assert_eq!(env.get("USE_STAKING"), None);
        assert_eq!(env.get("STAKING_PROGRAM"), None);
        // Derived addresses survive a reset.
        assert!(env.get("CUSTOM_STAKING_ADDRESS").is_some());
    }

    #[test]
    fn test_no_staking_variables() {
        let vars = StakingEnvVariables::no_staking();
        assert!(!vars.use_staking);
        assert_eq!(vars.program_id, NO_STAKING_PROGRAM_ID);
        assert_eq!(vars.olas_address, ZERO_ADDRESS);
        assert_ne!(vars.staking_address, ZERO_ADDRESS);
    }
}
