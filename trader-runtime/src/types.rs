use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::error::OperatorError;

/// On-chain staking state of a service, as reported by
/// `getServiceStakingState`. Shared by every component that consumes
/// staking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakingState {
    Unstaked,
    Staked,
    Evicted,
}

impl TryFrom<u8> for StakingState {
    type Error = OperatorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StakingState::Unstaked),
            1 => Ok(StakingState::Staked),
            2 => Ok(StakingState::Evicted),
            other => Err(OperatorError::ChainInteraction(format!(
                "unexpected staking state {other}"
            ))),
        }
    }
}

impl StakingState {
    /// An evicted service still holds its stake and is eligible for
    /// unstaking, so it counts as staked here.
    pub fn is_staked(self) -> bool {
        matches!(self, StakingState::Staked | StakingState::Evicted)
    }
}

/// A raw transaction descriptor: target, calldata, native value.
#[derive(Debug, Clone)]
pub struct TxDescriptor {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

impl TxDescriptor {
    pub fn call(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            value: U256::ZERO,
        }
    }
}

/// What a planned transaction does, for logging and plan assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Approve,
    Stake,
    Unstake,
    Claim,
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxKind::Approve => "approve",
            TxKind::Stake => "stake",
            TxKind::Unstake => "unstake",
            TxKind::Claim => "claim",
        };
        f.write_str(s)
    }
}

/// A transaction descriptor paired with its role in a plan.
#[derive(Debug, Clone)]
pub struct PlannedTx {
    pub kind: TxKind,
    pub tx: TxDescriptor,
}

/// Info returned by `mapServiceInfo` for a staked service.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub multisig: Address,
    pub owner: Address,
    /// Unix timestamp the service was staked at.
    pub staked_since_ts: u64,
    /// Rewards accrued by this service so far.
    pub accrued_reward: U256,
}

const WEI_PER_UNIT: f64 = 1e18;

/// Format a wei amount as a decimal unit amount with a symbol suffix.
/// Lossy, display only.
pub fn wei_to_unit(wei: U256, symbol: &str) -> String {
    let approx: f64 = wei.to_string().parse().unwrap_or(f64::INFINITY);
    format!("{:.2} {symbol}", approx / WEI_PER_UNIT)
}

pub fn wei_to_olas(wei: U256) -> String {
    wei_to_unit(wei, "OLAS")
}

pub fn wei_to_xdai(wei: U256) -> String {
    wei_to_unit(wei, "xDAI")
}

pub fn wei_to_wxdai(wei: U256) -> String {
    wei_to_unit(wei, "WxDAI")
}

/// Format a duration in seconds as `"{days}D {hours}h {minutes}m"`.
pub fn format_duration(duration_seconds: u64) -> String {
    let days = duration_seconds / 86_400;
    let hours = (duration_seconds % 86_400) / 3_600;
    let minutes = (duration_seconds % 3_600) / 60;
    format!("{days}D {hours}h {minutes}m")
}
