//! End-to-end flow over the local pieces: subgraph clients feeding the
//! statistics table, mech request attribution from the events cache, and
//! cache persistence across store reopenings. No live chain involved.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use trader_operator_lib::reconciler::{PlanAction, build_plan};
use trader_operator_lib::store::{MechEvent, MechEventStore};
use trader_operator_lib::trades::{
    MarketAttribute, MarketState, SubgraphClient, compute_statistics,
};
use trader_runtime::types::StakingState;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mech_request(id: &str, prompt: &str, fee: u128) -> MechEvent {
    MechEvent {
        event_id: id.to_string(),
        sender: "0xsafe".to_string(),
        ipfs_hash: "ab".repeat(32),
        transaction_hash: "0xtx".to_string(),
        block_number: 100,
        block_timestamp: 1_700_000_000,
        ipfs_link: "ipfs://link".to_string(),
        ipfs_contents: serde_json::json!({
            "tool": "prediction-online",
            "prompt": prompt,
        }),
        fee,
    }
}

#[tokio::test]
async fn statistics_from_subgraph_with_mech_fees() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/omen"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "fpmmTrades": [{
                    "id": "0xtrade1",
                    "title": "Will GNO reach 500 by March?",
                    "creationTimestamp": "1000",
                    "collateralAmount": "1000",
                    "feeAmount": "20",
                    "outcomeIndex": "0",
                    "outcomeTokensTraded": "1900",
                    "fpmm": {
                        "id": "0xmarket1",
                        "title": "Will GNO reach 500 by March?",
                        "openingTimestamp": "500",
                        "answerFinalizedTimestamp": "2000",
                        "currentAnswer": "0x0",
                        "isPendingArbitration": false,
                        "arbitrationOccurred": false,
                        "condition": {"id": "0xcond1"}
                    }
                }]
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/ct"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "user": {
                    "userPositions": [{
                        "balance": "0",
                        "id": "0xpos",
                        "position": {"id": "0xp", "conditionIds": ["0xcond1"]},
                        "totalBalance": "0",
                        "wrappedBalance": "0"
                    }]
                }
            }
        })))
        .mount(&server)
        .await;

    let client = SubgraphClient::new(
        &format!("{}/omen", server.uri()),
        &format!("{}/ct", server.uri()),
    );
    let trades = client.trades("0xSafe").await.unwrap();
    let positions = client.user_positions("0xSafe").await.unwrap();

    let requests = vec![
        mech_request("1", "Please answer: Will GNO reach 500 by March?", 40),
        mech_request("2", "Unrelated question about something else", 40),
    ];
    let request_refs: Vec<&MechEvent> = requests.iter().collect();

    let table = compute_statistics(&trades, &positions, &request_refs, 3_000);

    let closed = MarketState::Closed;
    assert_eq!(table.get(MarketAttribute::NumTrades, closed), Decimal::ONE);
    assert_eq!(table.get(MarketAttribute::WinnerTrades, closed), Decimal::ONE);
    assert_eq!(table.get(MarketAttribute::NumRedeemed, closed), Decimal::ONE);
    // Only the matching prompt is attributed.
    assert_eq!(table.get(MarketAttribute::MechCalls, closed), Decimal::ONE);
    assert_eq!(table.get(MarketAttribute::MechFees, closed), Decimal::from(40));
    // NET = 1900 - 1000 - 20 - 40 = 840; denom = 1060.
    assert_eq!(
        table.get(MarketAttribute::NetEarnings, closed),
        Decimal::from(840)
    );
    assert_eq!(
        table.get(MarketAttribute::Roi, closed),
        Decimal::from(840) / Decimal::from(1060)
    );
    assert_eq!(table.total(MarketAttribute::NumTrades), Decimal::ONE);
}

#[test]
fn cache_survives_reopen_and_plan_is_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("mech_events.json");

    let mut store = MechEventStore::open(&cache).unwrap();
    store.merge("0xsafe", "0xmech", "Request", mech_request("7", "prompt", 40));
    store.set_watermark("0xsafe", "0xmech", "Request", 30_000_000);
    store.flush().unwrap();

    // Interruption: a new process opens the cache and resumes from the
    // persisted watermark with the events intact.
    let store = MechEventStore::open(&cache).unwrap();
    assert_eq!(store.watermark("0xsafe", "0xmech", "Request"), 30_000_000);
    assert_eq!(store.get("0xsafe", "Request").len(), 1);

    // Planning twice over identical chain state yields identical plans.
    let snapshot = trader_operator_lib::inspector::StakingSnapshot {
        service_id: 7,
        current_program: Some("quickstart_beta_expert".to_string()),
        state: StakingState::Staked,
        staked_since_ts: 0,
        next_checkpoint_ts: 0,
        liveness_period: 86_400,
        min_staking_duration: 0,
        current_rewards: U256::ZERO,
        target_rewards: U256::ZERO,
        target_slots: 0,
    };
    let first = build_plan(&snapshot, "quickstart_beta_expert", 1_000).unwrap();
    let second = build_plan(&snapshot, "quickstart_beta_expert", 1_000).unwrap();
    assert_eq!(first.actions, second.actions);
    assert_eq!(
        first.actions,
        vec![PlanAction::Unstake {
            program: "quickstart_beta_expert".to_string()
        }]
    );
}
