//! Staking program catalog.
//!
//! Maps named staking programs to their Gnosis contract addresses,
//! including deprecated programs kept for historical unstake-only
//! operations, and lazily fetches human-readable program metadata from the
//! IPFS gateway. Fetched metadata is memoized per catalog instance.

use std::collections::HashMap;

use alloy::primitives::{Address, address};
use serde::Deserialize;
use trader_runtime::chain::ChainClient;
use trader_runtime::contracts::IStakingToken;
use trader_runtime::error::OperatorError;

pub const NO_STAKING_PROGRAM_ID: &str = "no_staking";
pub const ZERO_ADDRESS: Address = Address::ZERO;

/// CID convention for the gateway: `f01701220` + hex-encoded sha256 digest.
pub const CID_PREFIX: &str = "f01701220";
pub const DEFAULT_IPFS_GATEWAY: &str = "https://gateway.autonolas.tech/ipfs/";

#[derive(Debug, Clone)]
pub struct StakingProgram {
    pub program_id: &'static str,
    pub contract_address: Address,
    pub deprecated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramMetadata {
    pub name: String,
    pub description: String,
}

impl ProgramMetadata {
    /// Placeholder used whenever descriptive metadata cannot be fetched.
    /// Program selection must be able to proceed without it.
    fn placeholder(program_id: &str) -> Self {
        Self {
            name: program_id.to_string(),
            description: program_id.to_string(),
        }
    }
}

fn no_staking_metadata() -> ProgramMetadata {
    ProgramMetadata {
        name: "No staking".to_string(),
        description: "Your trader agent will still actively participate in prediction \
                      markets, but it will not be staked within any staking program."
            .to_string(),
    }
}

pub struct StakingCatalog {
    programs: Vec<StakingProgram>,
    gateway: String,
    http: reqwest::Client,
    metadata_cache: HashMap<String, ProgramMetadata>,
}

impl Default for StakingCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_IPFS_GATEWAY)
    }
}

impl StakingCatalog {
    pub fn new(gateway: &str) -> Self {
        // Declaration order is the canonical discovery order.
        let programs = vec![
            StakingProgram {
                program_id: NO_STAKING_PROGRAM_ID,
                contract_address: ZERO_ADDRESS,
                deprecated: false,
            },
            StakingProgram {
                program_id: "quickstart_beta_hobbyist",
                contract_address: address!("389B46c259631Acd6a69Bde8B6cEe218230bAE8C"),
                deprecated: false,
            },
            StakingProgram {
                program_id: "quickstart_beta_hobbyist_2",
                contract_address: address!("238EB6993b90a978ec6AAD7530d6429c949C08DA"),
                deprecated: false,
            },
            StakingProgram {
                program_id: "quickstart_beta_expert",
                contract_address: address!("5344B7DD311e5d3DdDd46A4f71481bD7b05AAA3e"),
                deprecated: false,
            },
            StakingProgram {
                program_id: "quickstart_beta_expert_2",
                contract_address: address!("b964e44c126410df341ae04B13aB10A985fE3513"),
                deprecated: false,
            },
            StakingProgram {
                program_id: "quickstart_beta_expert_3",
                contract_address: address!("80faD33Cadb5F53f9D29F02Db97D682E8b101618"),
                deprecated: false,
            },
            StakingProgram {
                program_id: "quickstart_beta_expert_4",
                contract_address: address!("aD9d891134443B443D7F30013c7e14Fe27F2E029"),
                deprecated: false,
            },
            StakingProgram {
                program_id: "quickstart_beta_expert_5",
                contract_address: address!("E56dF1E563De1B10715cB313D514af350D207212"),
                deprecated: false,
            },
            StakingProgram {
                program_id: "quickstart_alpha_everest",
                contract_address: address!("5add592ce0a1B5DceCebB5Dcac086Cd9F9e3eA5C"),
                deprecated: true,
            },
            StakingProgram {
                program_id: "quickstart_alpha_alpine",
                contract_address: address!("2Ef503950Be67a98746F484DA0bBAdA339DF3326"),
                deprecated: true,
            },
            StakingProgram {
                program_id: "quickstart_alpha_coastal",
                contract_address: address!("43fB32f25dce34EB76c78C7A42C8F40F84BCD237"),
                deprecated: true,
            },
        ];

        Self {
            programs,
            gateway: gateway.to_string(),
            http: reqwest::Client::new(),
            metadata_cache: HashMap::new(),
        }
    }

    /// All programs in canonical order, sentinel first.
    pub fn programs(&self) -> &[StakingProgram] {
        &self.programs
    }

    /// Active (non-deprecated) programs, including the sentinel.
    pub fn active_programs(&self) -> impl Iterator<Item = &StakingProgram> {
        self.programs.iter().filter(|p| !p.deprecated)
    }

    /// Programs to probe during discovery: everything except the sentinel
    /// and the configured excluded set, in canonical order.
    pub fn discovery_candidates<'a>(
        &'a self,
        excluded: &'a [String],
    ) -> impl Iterator<Item = &'a StakingProgram> {
        self.programs.iter().filter(move |p| {
            p.program_id != NO_STAKING_PROGRAM_ID
                && !excluded.iter().any(|e| e == p.program_id)
        })
    }

    pub fn resolve(&self, program_id: &str) -> Result<Address, OperatorError> {
        self.programs
            .iter()
            .find(|p| p.program_id == program_id)
            .map(|p| p.contract_address)
            .ok_or_else(|| OperatorError::UnknownProgram(program_id.to_string()))
    }

    pub fn is_deprecated(&self, program_id: &str) -> bool {
        self.programs
            .iter()
            .any(|p| p.program_id == program_id && p.deprecated)
    }

    /// Human-readable metadata for a program.
    ///
    /// The sentinel has a fixed description; other programs resolve their
    /// `metadataHash` against the IPFS gateway. Any fetch failure degrades
    /// to `{name: program_id, description: program_id}` so selection can
    /// always proceed.
    pub async fn metadata(&mut self, client: &ChainClient, program_id: &str) -> ProgramMetadata {
        if program_id == NO_STAKING_PROGRAM_ID {
            return no_staking_metadata();
        }
        if let Some(cached) = self.metadata_cache.get(program_id) {
            return cached.clone();
        }

        let metadata = match self.fetch_metadata(client, program_id).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!("Failed to fetch metadata for {program_id}: {e}");
                ProgramMetadata::placeholder(program_id)
            }
        };
        self.metadata_cache
            .insert(program_id.to_string(), metadata.clone());
        metadata
    }

    async fn fetch_metadata(
        &self,
        client: &ChainClient,
        program_id: &str,
    ) -> Result<ProgramMetadata, OperatorError> {
        let contract_address = self.resolve(program_id)?;
        let staking = IStakingToken::new(contract_address, &client.provider);
        let metadata_hash = staking
            .metadataHash()
            .call()
            .await
            .map_err(|e| OperatorError::Rpc(e.to_string()))?;

        let url = format!(
            "{}{}{}",
            self.gateway,
            CID_PREFIX,
            hex::encode(metadata_hash)
        );
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(OperatorError::Http(format!(
                "failed to fetch metadata from {url}: {}",
                response.status()
            )));
        }
        let metadata: ProgramMetadata = response.json().await?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sentinel_with_zero_address() {
        let catalog = StakingCatalog::default();
        let sentinels: Vec<_> = catalog
            .programs()
            .iter()
            .filter(|p| p.contract_address == ZERO_ADDRESS)
            .collect();
        assert_eq!(sentinels.len(), 1);
        assert_eq!(sentinels[0].program_id, NO_STAKING_PROGRAM_ID);
    }

    #[test]
    fn test_resolve_known_program() {
        let catalog = StakingCatalog::default();
        assert!(catalog.resolve("quickstart_beta_expert").is_ok());
        assert!(catalog.resolve("quickstart_alpha_alpine").is_ok());
    }

    #[test]
    fn test_resolve_unknown_program() {
        let catalog = StakingCatalog::default();
        let err = catalog.resolve("does_not_exist").unwrap_err();
        assert!(matches!(err, OperatorError::UnknownProgram(_)));
    }

    #[test]
    fn test_discovery_skips_sentinel_and_excluded() {
        let catalog = StakingCatalog::default();
        let excluded = vec!["quickstart_alpha_everest".to_string()];
        let ids: Vec<_> = catalog
            .discovery_candidates(&excluded)
            .map(|p| p.program_id)
            .collect();
        assert!(!ids.contains(&NO_STAKING_PROGRAM_ID));
        assert!(!ids.contains(&"quickstart_alpha_everest"));
        assert!(ids.contains(&"quickstart_beta_hobbyist"));
        assert!(ids.contains(&"quickstart_alpha_alpine"));
    }

    #[test]
    fn test_discovery_order_is_canonical() {
        let catalog = StakingCatalog::default();
        let ids: Vec<_> = catalog
            .discovery_candidates(&[])
            .map(|p| p.program_id)
            .collect();
        let hobbyist = ids.iter().position(|id| *id == "quickstart_beta_hobbyist");
        let alpine = ids.iter().position(|id| *id == "quickstart_alpha_alpine");
        assert!(hobbyist.unwrap() < alpine.unwrap());
    }

    #[test]
    fn test_deprecated_flag() {
        let catalog = StakingCatalog::default();
        assert!(catalog.is_deprecated("quickstart_alpha_coastal"));
        assert!(!catalog.is_deprecated("quickstart_beta_expert"));
    }
}
