//! Omen trade retrieval and aggregated market statistics.
//!
//! Queries the Omen xDAI subgraph for a creator's buy trades and the
//! conditional-tokens subgraph for redemption state, then aggregates them
//! into a `MarketAttribute x MarketState` table of wei amounts and counts.
//! The table is recomputed from scratch on every report run and never
//! persisted.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;
use trader_runtime::error::OperatorError;

use crate::store::MechEvent;

pub const OMEN_XDAI_SUBGRAPH_URL: &str =
    "https://api.thegraph.com/subgraphs/name/protofire/omen-xdai";
pub const CONDITIONAL_TOKENS_SUBGRAPH_URL: &str =
    "https://api.thegraph.com/subgraphs/name/gnosis/conditional-tokens-gc";

const OMEN_TRADES_QUERY: &str = r#"
{
    fpmmTrades(
        where: {type: Buy, creator: "$creator"}
        first: 1000
        skip: 0
    ) {
        id
        title
        collateralToken
        type
        creationTimestamp
        collateralAmount
        feeAmount
        outcomeIndex
        outcomeTokensTraded
        transactionHash
        fpmm {
            id
            outcomes
            title
            openingTimestamp
            answerFinalizedTimestamp
            currentAnswer
            isPendingArbitration
            arbitrationOccurred
            condition {
                id
            }
        }
    }
}
"#;

const USER_POSITIONS_QUERY: &str = r#"
{
    user(id: "$creator") {
        userPositions {
            balance
            id
            position {
                id
                conditionIds
            }
            totalBalance
            wrappedBalance
        }
    }
}
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FpmmTrade {
    pub id: String,
    pub title: String,
    pub creation_timestamp: String,
    pub collateral_amount: String,
    pub fee_amount: String,
    pub outcome_index: String,
    pub outcome_tokens_traded: String,
    pub fpmm: Fpmm,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fpmm {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub opening_timestamp: Option<String>,
    #[serde(default)]
    pub answer_finalized_timestamp: Option<String>,
    #[serde(default)]
    pub current_answer: Option<String>,
    pub is_pending_arbitration: bool,
    pub condition: Condition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPosition {
    pub balance: String,
    pub position: PositionInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub condition_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GraphResponse<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TradesData {
    #[serde(rename = "fpmmTrades", default)]
    fpmm_trades: Vec<FpmmTrade>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    user: Option<UserPositions>,
}

#[derive(Debug, Deserialize)]
struct UserPositions {
    #[serde(rename = "userPositions", default)]
    user_positions: Vec<UserPosition>,
}

/// Client for the Omen and conditional-tokens subgraphs.
#[derive(Debug, Clone)]
pub struct SubgraphClient {
    trades_url: String,
    conditional_tokens_url: String,
    http: reqwest::Client,
}

impl Default for SubgraphClient {
    fn default() -> Self {
        Self::new(OMEN_XDAI_SUBGRAPH_URL, CONDITIONAL_TOKENS_SUBGRAPH_URL)
    }
}

impl SubgraphClient {
    pub fn new(trades_url: &str, conditional_tokens_url: &str) -> Self {
        Self {
            trades_url: trades_url.to_string(),
            conditional_tokens_url: conditional_tokens_url.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post_query<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: String,
    ) -> Result<T, OperatorError> {
        let response = self
            .http
            .post(url)
            .header("content-type", "application/json")
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OperatorError::Http(format!(
                "subgraph query to {url} failed: {}",
                response.status()
            )));
        }
        let parsed: GraphResponse<T> = response.json().await?;
        parsed
            .data
            .ok_or_else(|| OperatorError::Http(format!("subgraph {url} returned no data")))
    }

    /// Buy trades of a creator address.
    pub async fn trades(&self, creator: &str) -> Result<Vec<FpmmTrade>, OperatorError> {
        let query = OMEN_TRADES_QUERY.replace("$creator", &creator.to_lowercase());
        let data: TradesData = self.post_query(&self.trades_url, query).await?;
        Ok(data.fpmm_trades)
    }

    /// Conditional-token positions of a creator, for redemption detection.
    pub async fn user_positions(&self, creator: &str) -> Result<Vec<UserPosition>, OperatorError> {
        let query = USER_POSITIONS_QUERY.replace("$creator", &creator.to_lowercase());
        let data: UserData = self.post_query(&self.conditional_tokens_url, query).await?;
        Ok(data.user.map(|u| u.user_positions).unwrap_or_default())
    }
}

/// A position with zero balance whose condition matches means the earnings
/// were redeemed.
pub fn is_redeemed(user_positions: &[UserPosition], condition_id: &str) -> bool {
    user_positions.iter().any(|p| {
        p.position.condition_ids.iter().any(|c| c == condition_id)
            && p.balance.parse::<u128>().unwrap_or(u128::MAX) == 0
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarketState {
    Open,
    Pending,
    Finalizing,
    Arbitrating,
    Closed,
}

impl MarketState {
    pub const ALL: [MarketState; 5] = [
        MarketState::Open,
        MarketState::Pending,
        MarketState::Finalizing,
        MarketState::Arbitrating,
        MarketState::Closed,
    ];
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketState::Open => "OPEN",
            MarketState::Pending => "PENDING",
            MarketState::Finalizing => "FINALIZING",
            MarketState::Arbitrating => "ARBITRATING",
            MarketState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarketAttribute {
    NumTrades,
    WinnerTrades,
    NumRedeemed,
    Investment,
    Fees,
    MechCalls,
    MechFees,
    Earnings,
    NetEarnings,
    Redemptions,
    Roi,
}

impl MarketAttribute {
    pub const ALL: [MarketAttribute; 11] = [
        MarketAttribute::NumTrades,
        MarketAttribute::WinnerTrades,
        MarketAttribute::NumRedeemed,
        MarketAttribute::Investment,
        MarketAttribute::Fees,
        MarketAttribute::MechCalls,
        MarketAttribute::MechFees,
        MarketAttribute::Earnings,
        MarketAttribute::NetEarnings,
        MarketAttribute::Redemptions,
        MarketAttribute::Roi,
    ];
}

/// Classify a market's lifecycle state at `now`.
pub fn market_state(fpmm: &Fpmm, now: u64) -> MarketState {
    if fpmm.is_pending_arbitration {
        return MarketState::Arbitrating;
    }
    let opening = parse_ts(fpmm.opening_timestamp.as_deref());
    if now < opening {
        return MarketState::Open;
    }
    match (&fpmm.current_answer, &fpmm.answer_finalized_timestamp) {
        (None, _) => MarketState::Pending,
        (Some(_), None) => MarketState::Finalizing,
        (Some(_), Some(finalized)) => {
            if now < finalized.parse::<u64>().unwrap_or(0) {
                MarketState::Finalizing
            } else {
                MarketState::Closed
            }
        }
    }
}

fn parse_ts(raw: Option<&str>) -> u64 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Parse a subgraph wei string into a `Decimal` (scale 0).
fn parse_wei(raw: &str) -> Decimal {
    Decimal::from_i128_with_scale(raw.parse::<i128>().unwrap_or(0), 0)
}

fn wei_u128(amount: u128) -> Decimal {
    Decimal::from_i128_with_scale(amount.min(i128::MAX as u128) as i128, 0)
}

/// Per-market mech usage: request count and total fees, attributed by the
/// market question appearing in the request prompt.
pub fn mech_statistics(title: &str, requests: &[&MechEvent]) -> (u64, u128) {
    let mut calls = 0u64;
    let mut fees = 0u128;
    for request in requests {
        let prompt = request
            .ipfs_contents
            .get("prompt")
            .and_then(|p| p.as_str())
            .unwrap_or_default();
        if !title.is_empty() && prompt.contains(title) {
            calls += 1;
            fees += request.fee;
        }
    }
    (calls, fees)
}

/// `MarketAttribute x MarketState` table of aggregated wei amounts and
/// counts, with a derived TOTAL column.
#[derive(Debug, Clone, Default)]
pub struct StatisticsTable {
    cells: HashMap<(MarketAttribute, MarketState), Decimal>,
}

impl StatisticsTable {
    pub fn get(&self, attribute: MarketAttribute, state: MarketState) -> Decimal {
        self.cells
            .get(&(attribute, state))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn add(&mut self, attribute: MarketAttribute, state: MarketState, amount: Decimal) {
        *self.cells.entry((attribute, state)).or_default() += amount;
    }

    fn set(&mut self, attribute: MarketAttribute, state: MarketState, amount: Decimal) {
        self.cells.insert((attribute, state), amount);
    }

    /// TOTAL column: sum across states, except ROI which is re-derived
    /// from the summed components.
    pub fn total(&self, attribute: MarketAttribute) -> Decimal {
        match attribute {
            MarketAttribute::Roi => compute_roi(
                self.total(MarketAttribute::Earnings),
                self.total(MarketAttribute::Investment),
                self.total(MarketAttribute::Fees),
                self.total(MarketAttribute::MechFees),
            ),
            _ => MarketState::ALL
                .iter()
                .map(|s| self.get(attribute, *s))
                .sum(),
        }
    }
}

/// `ROI = (EARNINGS - INVESTMENT - FEES - MECH_FEES) / (INVESTMENT + FEES +
/// MECH_FEES)`, exactly zero when the denominator is zero.
pub fn compute_roi(
    earnings: Decimal,
    investment: Decimal,
    fees: Decimal,
    mech_fees: Decimal,
) -> Decimal {
    let denominator = investment + fees + mech_fees;
    if denominator.is_zero() {
        return Decimal::ZERO;
    }
    let net_earnings = earnings - investment - fees - mech_fees;
    net_earnings / denominator
}

/// Aggregate a creator's trades into the statistics table.
pub fn compute_statistics(
    trades: &[FpmmTrade],
    user_positions: &[UserPosition],
    mech_requests: &[&MechEvent],
    now: u64,
) -> StatisticsTable {
    let mut table = StatisticsTable::default();

    for trade in trades {
        let state = market_state(&trade.fpmm, now);
        let investment = parse_wei(&trade.collateral_amount);
        let fees = parse_wei(&trade.fee_amount);
        let tokens_traded = parse_wei(&trade.outcome_tokens_traded);

        table.add(MarketAttribute::NumTrades, state, Decimal::ONE);
        table.add(MarketAttribute::Investment, state, investment);
        table.add(MarketAttribute::Fees, state, fees);

        let (mech_calls, mech_fees) = mech_statistics(&trade.title, mech_requests);
        table.add(
            MarketAttribute::MechCalls,
            state,
            Decimal::from(mech_calls),
        );
        table.add(MarketAttribute::MechFees, state, wei_u128(mech_fees));

        // Earnings only exist once an answer is in.
        if let Some(answer) = &trade.fpmm.current_answer {
            let answer_index =
                u64::from_str_radix(answer.trim_start_matches("0x"), 16).unwrap_or(u64::MAX);
            let outcome_index = trade.outcome_index.parse::<u64>().unwrap_or(u64::MAX);
            if answer_index == outcome_index {
                let earnings = tokens_traded;
                table.add(MarketAttribute::WinnerTrades, state, Decimal::ONE);
                table.add(MarketAttribute::Earnings, state, earnings);
                if is_redeemed(user_positions, &trade.fpmm.condition.id) {
                    table.add(MarketAttribute::NumRedeemed, state, Decimal::ONE);
                    table.add(MarketAttribute::Redemptions, state, earnings);
                }
            }
        }
    }

    // Derived rows, once per column.
    for state in MarketState::ALL {
        let earnings = table.get(MarketAttribute::Earnings, state);
        let investment = table.get(MarketAttribute::Investment, state);
        let fees = table.get(MarketAttribute::Fees, state);
        let mech_fees = table.get(MarketAttribute::MechFees, state);
        table.set(
            MarketAttribute::NetEarnings,
            state,
            earnings - investment - fees - mech_fees,
        );
        table.set(
            MarketAttribute::Roi,
            state,
            compute_roi(earnings, investment, fees, mech_fees),
        );
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn closed_trade(
        title: &str,
        collateral: u128,
        fee: u128,
        tokens: u128,
        outcome: u64,
        answer: u64,
    ) -> FpmmTrade {
        FpmmTrade {
            id: "0xtrade".to_string(),
            title: title.to_string(),
            creation_timestamp: "1000".to_string(),
            collateral_amount: collateral.to_string(),
            fee_amount: fee.to_string(),
            outcome_index: outcome.to_string(),
            outcome_tokens_traded: tokens.to_string(),
            fpmm: Fpmm {
                id: "0xmarket".to_string(),
                title: title.to_string(),
                opening_timestamp: Some("500".to_string()),
                answer_finalized_timestamp: Some("2000".to_string()),
                current_answer: Some(format!("{answer:#x}")),
                is_pending_arbitration: false,
                condition: Condition {
                    id: "0xcondition".to_string(),
                },
            },
        }
    }

    #[test]
    fn test_roi_zero_denominator_is_zero() {
        let roi = compute_roi(
            Decimal::from(100),
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        assert_eq!(roi, Decimal::ZERO);
    }

    #[test]
    fn test_roi_identity() {
        // NET = 150 - 100 - 10 - 40 = 0; ROI = 0 / 150 = 0
        let roi = compute_roi(
            Decimal::from(150),
            Decimal::from(100),
            Decimal::from(10),
            Decimal::from(40),
        );
        assert_eq!(roi, Decimal::ZERO);

        // NET = 300 - 100 - 50 - 50 = 100; denom = 200; ROI = 0.5
        let roi = compute_roi(
            Decimal::from(300),
            Decimal::from(100),
            Decimal::from(50),
            Decimal::from(50),
        );
        assert_eq!(roi, Decimal::new(5, 1));
    }

    #[test]
    fn test_market_state_classification() {
        let mut fpmm = Fpmm {
            id: "m".to_string(),
            title: "t".to_string(),
            opening_timestamp: Some("1000".to_string()),
            answer_finalized_timestamp: None,
            current_answer: None,
            is_pending_arbitration: false,
            condition: Condition { id: "c".to_string() },
        };

        assert_eq!(market_state(&fpmm, 500), MarketState::Open);
        assert_eq!(market_state(&fpmm, 1500), MarketState::Pending);

        fpmm.current_answer = Some("0x0".to_string());
        assert_eq!(market_state(&fpmm, 1500), MarketState::Finalizing);

        fpmm.answer_finalized_timestamp = Some("2000".to_string());
        assert_eq!(market_state(&fpmm, 1500), MarketState::Finalizing);
        assert_eq!(market_state(&fpmm, 2500), MarketState::Closed);

        fpmm.is_pending_arbitration = true;
        assert_eq!(market_state(&fpmm, 2500), MarketState::Arbitrating);
    }

    #[test]
    fn test_statistics_winner_and_net_earnings() {
        let trades = vec![
            closed_trade("will it rain", 100, 10, 300, 1, 1),
            closed_trade("will it snow", 50, 5, 120, 0, 1),
        ];
        let table = compute_statistics(&trades, &[], &[], 3000);

        assert_eq!(
            table.get(MarketAttribute::NumTrades, MarketState::Closed),
            Decimal::from(2)
        );
        assert_eq!(
            table.get(MarketAttribute::WinnerTrades, MarketState::Closed),
            Decimal::ONE
        );
        assert_eq!(
            table.get(MarketAttribute::Earnings, MarketState::Closed),
            Decimal::from(300)
        );
        // NET = 300 - 150 - 15 - 0 = 135
        assert_eq!(
            table.get(MarketAttribute::NetEarnings, MarketState::Closed),
            Decimal::from(135)
        );
        // ROI = 135 / 165
        assert_eq!(
            table.get(MarketAttribute::Roi, MarketState::Closed),
            Decimal::from(135) / Decimal::from(165)
        );
    }

    #[test]
    fn test_statistics_empty_column_roi_is_zero() {
        let table = compute_statistics(&[], &[], &[], 3000);
        for state in MarketState::ALL {
            assert_eq!(table.get(MarketAttribute::Roi, state), Decimal::ZERO);
        }
        assert_eq!(table.total(MarketAttribute::Roi), Decimal::ZERO);
    }

    #[test]
    fn test_is_redeemed() {
        let positions = vec![UserPosition {
            balance: "0".to_string(),
            position: PositionInfo {
                condition_ids: vec!["0xcondition".to_string()],
            },
        }];
        assert!(is_redeemed(&positions, "0xcondition"));
        assert!(!is_redeemed(&positions, "0xother"));

        let held = vec![UserPosition {
            balance: "10".to_string(),
            position: PositionInfo {
                condition_ids: vec!["0xcondition".to_string()],
            },
        }];
        assert!(!is_redeemed(&held, "0xcondition"));
    }

    #[tokio::test]
    async fn test_subgraph_trades_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/trades"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "fpmmTrades": [{
                        "id": "0xabc",
                        "title": "Will ETH flip BTC?",
                        "creationTimestamp": "1700000000",
                        "collateralAmount": "1000000000000000000",
                        "feeAmount": "20000000000000000",
                        "outcomeIndex": "1",
                        "outcomeTokensTraded": "1900000000000000000",
                        "fpmm": {
                            "id": "0xmarket",
                            "title": "Will ETH flip BTC?",
                            "openingTimestamp": "1700000000",
                            "answerFinalizedTimestamp": null,
                            "currentAnswer": null,
                            "isPendingArbitration": false,
                            "arbitrationOccurred": false,
                            "condition": {"id": "0xcond"}
                        }
                    }]
                }
            })))
            .mount(&server)
            .await;

        let client = SubgraphClient::new(
            &format!("{}/trades", server.uri()),
            &format!("{}/ct", server.uri()),
        );
        let trades = client.trades("0xCreator").await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].collateral_amount, "1000000000000000000");
        assert!(trades[0].fpmm.current_answer.is_none());
    }
}
