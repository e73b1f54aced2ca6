//! Read-only staking state queries.
//!
//! Thin typed wrappers over the staking contract view surface, plus the
//! catalog-wide discovery probe and the snapshot collection the reconciler
//! decides on. None of these mutate state; all are safe to call repeatedly.

use alloy::primitives::{Address, U256};
use trader_runtime::chain::ChainClient;
use trader_runtime::contracts::IStakingToken;
use trader_runtime::error::OperatorError;
use trader_runtime::types::{ServiceInfo, StakingState};

use crate::catalog::{NO_STAKING_PROGRAM_ID, StakingCatalog};
use crate::config::OperatorConfig;

fn rpc_err(e: impl std::fmt::Display) -> OperatorError {
    OperatorError::Rpc(e.to_string())
}

fn to_u64(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

pub async fn staking_state(
    client: &ChainClient,
    staking_contract: Address,
    service_id: u64,
) -> Result<StakingState, OperatorError> {
    let staking = IStakingToken::new(staking_contract, &client.provider);
    let raw = staking
        .getServiceStakingState(U256::from(service_id))
        .call()
        .await
        .map_err(rpc_err)?;
    StakingState::try_from(raw)
}

/// True when the on-chain state is STAKED or EVICTED: an evicted service
/// still holds its stake and remains eligible for unstaking.
pub async fn is_service_staked(
    client: &ChainClient,
    staking_contract: Address,
    service_id: u64,
) -> Result<bool, OperatorError> {
    Ok(staking_state(client, staking_contract, service_id)
        .await?
        .is_staked())
}

pub async fn is_service_evicted(
    client: &ChainClient,
    staking_contract: Address,
    service_id: u64,
) -> Result<bool, OperatorError> {
    Ok(staking_state(client, staking_contract, service_id).await? == StakingState::Evicted)
}

pub async fn available_rewards(
    client: &ChainClient,
    staking_contract: Address,
) -> Result<U256, OperatorError> {
    let staking = IStakingToken::new(staking_contract, &client.provider);
    staking.availableRewards().call().await.map_err(rpc_err)
}

/// `maxNumServices - len(getServiceIds)`.
pub async fn available_slots(
    client: &ChainClient,
    staking_contract: Address,
) -> Result<u64, OperatorError> {
    let staking = IStakingToken::new(staking_contract, &client.provider);
    let max_num_services = staking.maxNumServices().call().await.map_err(rpc_err)?;
    let service_ids = staking.getServiceIds().call().await.map_err(rpc_err)?;
    Ok(to_u64(max_num_services).saturating_sub(service_ids.len() as u64))
}

pub async fn liveness_period(
    client: &ChainClient,
    staking_contract: Address,
) -> Result<u64, OperatorError> {
    let staking = IStakingToken::new(staking_contract, &client.provider);
    Ok(to_u64(staking.livenessPeriod().call().await.map_err(rpc_err)?))
}

pub async fn min_staking_duration(
    client: &ChainClient,
    staking_contract: Address,
) -> Result<u64, OperatorError> {
    let staking = IStakingToken::new(staking_contract, &client.provider);
    Ok(to_u64(
        staking.minStakingDuration().call().await.map_err(rpc_err)?,
    ))
}

pub async fn next_checkpoint_ts(
    client: &ChainClient,
    staking_contract: Address,
) -> Result<u64, OperatorError> {
    let staking = IStakingToken::new(staking_contract, &client.provider);
    Ok(to_u64(
        staking
            .getNextRewardCheckpointTimestamp()
            .call()
            .await
            .map_err(rpc_err)?,
    ))
}

pub async fn service_info(
    client: &ChainClient,
    staking_contract: Address,
    service_id: u64,
) -> Result<ServiceInfo, OperatorError> {
    let staking = IStakingToken::new(staking_contract, &client.provider);
    let info = staking
        .mapServiceInfo(U256::from(service_id))
        .call()
        .await
        .map_err(rpc_err)?;
    Ok(ServiceInfo {
        multisig: info.multisig,
        owner: info.owner,
        staked_since_ts: to_u64(info.tsStart),
        accrued_reward: info.reward,
    })
}

/// Probe every known program (active and deprecated, minus the sentinel and
/// the excluded set) for the service's stake. The first positive in
/// canonical catalog order wins; a probe failure on one program skips to
/// the next. At most one program can actually hold the stake by contract
/// design, so two positives would be an operator-visible bug upstream.
pub async fn discover_staked_program(
    client: &ChainClient,
    catalog: &StakingCatalog,
    excluded: &[String],
    service_id: u64,
) -> Result<Option<(String, StakingState)>, OperatorError> {
    for program in catalog.discovery_candidates(excluded) {
        match staking_state(client, program.contract_address, service_id).await {
            Ok(state) if state.is_staked() => {
                return Ok(Some((program.program_id.to_string(), state)));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    "Staking probe failed for {}: {e}; skipping",
                    program.program_id
                );
            }
        }
    }
    Ok(None)
}

/// Everything the reconciler needs to decide on one invocation, collected
/// fresh from chain. Never cached across runs: it can change per block.
#[derive(Debug, Clone)]
pub struct StakingSnapshot {
    pub service_id: u64,
    /// Program currently holding the service's stake, if any.
    pub current_program: Option<String>,
    pub state: StakingState,
    pub staked_since_ts: u64,
    pub next_checkpoint_ts: u64,
    pub liveness_period: u64,
    pub min_staking_duration: u64,
    /// Available rewards on the current program's contract.
    pub current_rewards: U256,
    /// Available rewards on the target program's contract.
    pub target_rewards: U256,
    /// Free slots on the target program's contract.
    pub target_slots: u64,
}

pub async fn collect_snapshot(
    client: &ChainClient,
    catalog: &StakingCatalog,
    config: &OperatorConfig,
    target_program: &str,
) -> Result<StakingSnapshot, OperatorError> {
    let service_id = config.service_id;
    let discovered =
        discover_staked_program(client, catalog, &config.excluded_programs, service_id).await?;

    let mut snapshot = StakingSnapshot {
        service_id,
        current_program: None,
        state: StakingState::Unstaked,
        staked_since_ts: 0,
        next_checkpoint_ts: 0,
        liveness_period: 0,
        min_staking_duration: 0,
        current_rewards: U256::ZERO,
        target_rewards: U256::ZERO,
        target_slots: 0,
    };

    if let Some((program_id, state)) = discovered {
        let contract = catalog.resolve(&program_id)?;
        let info = service_info(client, contract, service_id).await?;
        snapshot.staked_since_ts = info.staked_since_ts;
        snapshot.next_checkpoint_ts = next_checkpoint_ts(client, contract).await?;
        snapshot.liveness_period = liveness_period(client, contract).await?;
        snapshot.min_staking_duration = min_staking_duration(client, contract).await?;
        snapshot.current_rewards = available_rewards(client, contract).await?;
        snapshot.current_program = Some(program_id);
        snapshot.state = state;
    }

    if target_program != NO_STAKING_PROGRAM_ID {
        let target_contract = catalog.resolve(target_program)?;
        snapshot.target_rewards = available_rewards(client, target_contract).await?;
        snapshot.target_slots = available_slots(client, target_contract).await?;
    }

    Ok(snapshot)
}
