//! Operator report assembly.
//!
//! Pulls staking status, balances, trade statistics, and cached mech usage
//! into one summary struct. Rendering is left to the binary.

use alloy::primitives::{Address, U256, address};
use rust_decimal::Decimal;
use trader_runtime::chain::ChainClient;
use trader_runtime::contracts::IERC20;
use trader_runtime::error::OperatorError;

use crate::catalog::StakingCatalog;
use crate::config::OperatorConfig;
use crate::inspector;
use crate::trades::{MarketAttribute, MarketState, StatisticsTable};

pub const WXDAI_CONTRACT_ADDRESS: Address =
    address!("e91D153E0b41518A2Ce8Dd3D7944Fa863463a97d");

/// Minimum combined Safe balance before the report flags a warning (wei).
pub const SAFE_BALANCE_THRESHOLD: u128 = 500_000_000_000_000_000;
pub const AGENT_XDAI_BALANCE_THRESHOLD: u128 = 50_000_000_000_000_000;
pub const OPERATOR_XDAI_BALANCE_THRESHOLD: u128 = 50_000_000_000_000_000;

pub const TRADES_LOOKBACK_DAYS: u64 = 3;

#[derive(Debug, Clone)]
pub struct AccountReport {
    pub address: Address,
    pub native_wei: U256,
    pub low_balance: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub service_id: u64,
    pub staking_program: Option<String>,
    pub evicted: bool,
    pub accrued_rewards: U256,
    /// ROI over closed markets only.
    pub roi_closed: Decimal,
    /// Buy trades within the lookback window, and the distinct markets
    /// they touched.
    pub recent_trades: usize,
    pub recent_markets: usize,
    pub lookback_days: u64,
    pub agent: AccountReport,
    pub safe: AccountReport,
    pub safe_wxdai: U256,
    pub operator: AccountReport,
}

impl ServiceReport {
    pub fn is_staked(&self) -> bool {
        self.staking_program.is_some()
    }
}

/// Addresses the report covers.
#[derive(Debug, Clone, Copy)]
pub struct ReportAccounts {
    pub agent: Address,
    pub safe: Address,
    pub operator: Address,
}

async fn account_report(
    client: &ChainClient,
    address: Address,
    threshold: u128,
) -> Result<AccountReport, OperatorError> {
    let native_wei = client.native_balance(address).await?;
    Ok(AccountReport {
        address,
        native_wei,
        low_balance: native_wei < U256::from(threshold),
    })
}

pub async fn token_balance(
    client: &ChainClient,
    token: Address,
    owner: Address,
) -> Result<U256, OperatorError> {
    let erc20 = IERC20::new(token, &client.provider);
    erc20
        .balanceOf(owner)
        .call()
        .await
        .map_err(|e| OperatorError::Rpc(e.to_string()))
}

pub async fn token_allowance(
    client: &ChainClient,
    token: Address,
    owner: Address,
    spender: Address,
) -> Result<U256, OperatorError> {
    let erc20 = IERC20::new(token, &client.provider);
    erc20
        .allowance(owner, spender)
        .call()
        .await
        .map_err(|e| OperatorError::Rpc(e.to_string()))
}

/// Count trades (and distinct markets) created within the last
/// `lookback_days`.
pub fn trades_since(
    trades: &[crate::trades::FpmmTrade],
    now: u64,
    lookback_days: u64,
) -> (usize, usize) {
    let since = now.saturating_sub(lookback_days * 86_400);
    let recent: Vec<_> = trades
        .iter()
        .filter(|t| t.creation_timestamp.parse::<u64>().unwrap_or(0) >= since)
        .collect();
    let mut markets: Vec<&str> = recent.iter().map(|t| t.fpmm.id.as_str()).collect();
    markets.sort_unstable();
    markets.dedup();
    (recent.len(), markets.len())
}

/// Assemble the full operator report.
pub async fn build_report(
    client: &ChainClient,
    catalog: &StakingCatalog,
    config: &OperatorConfig,
    accounts: ReportAccounts,
    trades: &[crate::trades::FpmmTrade],
    statistics: &StatisticsTable,
    now: u64,
) -> Result<ServiceReport, OperatorError> {
    let discovered = inspector::discover_staked_program(
        client,
        catalog,
        &config.excluded_programs,
        config.service_id,
    )
    .await?;

    let (staking_program, evicted, accrued_rewards) = match discovered {
        Some((program_id, state)) => {
            let contract = catalog.resolve(&program_id)?;
            let info = inspector::service_info(client, contract, config.service_id).await?;
            (
                Some(program_id),
                state == trader_runtime::types::StakingState::Evicted,
                info.accrued_reward,
            )
        }
        None => (None, false, U256::ZERO),
    };

    let (recent_trades, recent_markets) = trades_since(trades, now, TRADES_LOOKBACK_DAYS);

    let agent = account_report(client, accounts.agent, AGENT_XDAI_BALANCE_THRESHOLD).await?;
    let operator =
        account_report(client, accounts.operator, OPERATOR_XDAI_BALANCE_THRESHOLD).await?;
    let safe_wxdai = token_balance(client, WXDAI_CONTRACT_ADDRESS, accounts.safe).await?;
    let safe_native = client.native_balance(accounts.safe).await?;
    let safe = AccountReport {
        address: accounts.safe,
        native_wei: safe_native,
        low_balance: safe_native + safe_wxdai < U256::from(SAFE_BALANCE_THRESHOLD),
    };

    Ok(ServiceReport {
        service_id: config.service_id,
        staking_program,
        evicted,
        accrued_rewards,
        roi_closed: statistics.get(MarketAttribute::Roi, MarketState::Closed),
        recent_trades,
        recent_markets,
        lookback_days: TRADES_LOOKBACK_DAYS,
        agent,
        safe,
        safe_wxdai,
        operator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trades::{Condition, Fpmm, FpmmTrade};

    fn trade_at(ts: u64, market: &str) -> FpmmTrade {
        FpmmTrade {
            id: format!("0x{ts}"),
            title: "q".to_string(),
            creation_timestamp: ts.to_string(),
            collateral_amount: "0".to_string(),
            fee_amount: "0".to_string(),
            outcome_index: "0".to_string(),
            outcome_tokens_traded: "0".to_string(),
            fpmm: Fpmm {
                id: market.to_string(),
                title: "q".to_string(),
                opening_timestamp: None,
                answer_finalized_timestamp: None,
                current_answer: None,
                is_pending_arbitration: false,
                condition: Condition { id: "c".to_string() },
            },
        }
    }

    #[test]
    fn test_trades_since_window_and_dedup() {
        let now = 10 * 86_400;
        let trades = vec![
            trade_at(now - 86_400, "0xm1"),
            trade_at(now - 2 * 86_400, "0xm1"),
            trade_at(now - 2 * 86_400, "0xm2"),
            // Outside the 3-day window.
            trade_at(now - 5 * 86_400, "0xm3"),
        ];
        let (count, markets) = trades_since(&trades, now, 3);
        assert_eq!(count, 3);
        assert_eq!(markets, 2);
    }

    #[test]
    fn test_trades_since_empty() {
        let (count, markets) = trades_since(&[], 1_000_000, 3);
        assert_eq!(count, 0);
        assert_eq!(markets, 0);
    }
}
