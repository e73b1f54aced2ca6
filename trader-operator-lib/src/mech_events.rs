//! Incremental on-chain mech event mirroring.
//!
//! Walks Request/Deliver logs for a sender in fixed-size block chunks and
//! merges them into the local JSON cache, persisting the per-contract
//! watermark after every chunk so an interrupted scan resumes where it
//! stopped. IPFS side-data is resolved opportunistically; a failed fetch
//! leaves the contents empty for a later sync to fill in.

use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use tokio::time::sleep;
use trader_runtime::chain::ChainClient;
use trader_runtime::contracts::IAgentMech;
use trader_runtime::error::OperatorError;

use crate::store::{MechEvent, MechEventStore};

/// Chunk size for log queries, small enough for provider response limits.
pub const LOG_QUERY_CHUNK_SIZE: u64 = 5_000;

/// Blocks shaved off the head when scanning close to it, so the provider
/// is never asked for blocks it may not have indexed yet.
const HEAD_SAFETY_MARGIN: u64 = 16;

const NEAR_HEAD_PAUSE: Duration = Duration::from_secs(2);

pub const CID_PREFIX: &str = "f01701220";
pub const DEFAULT_IPFS_GATEWAY: &str = "https://gateway.autonolas.tech/ipfs/";

/// Fee charged per mech request.
/// TODO extract the actual fee from the request transaction.
pub const DEFAULT_MECH_FEE: u128 = 10_000_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechEventKind {
    Request,
    Deliver,
}

impl MechEventKind {
    pub fn event_name(self) -> &'static str {
        match self {
            MechEventKind::Request => "Request",
            MechEventKind::Deliver => "Deliver",
        }
    }

    fn signature_hash(self) -> B256 {
        match self {
            MechEventKind::Request => IAgentMech::Request::SIGNATURE_HASH,
            MechEventKind::Deliver => IAgentMech::Deliver::SIGNATURE_HASH,
        }
    }
}

/// A mech contract to scan, with the block its history starts at.
#[derive(Debug, Clone)]
pub struct MechContract {
    pub address: Address,
    pub earliest_block: u64,
}

pub struct MechEventMirror {
    contracts: Vec<MechContract>,
    gateway: String,
    http: reqwest::Client,
    store: MechEventStore,
}

impl MechEventMirror {
    pub fn new(store: MechEventStore, contracts: Vec<MechContract>) -> Self {
        Self {
            contracts,
            gateway: DEFAULT_IPFS_GATEWAY.to_string(),
            http: reqwest::Client::new(),
            store,
        }
    }

    pub fn with_gateway(mut self, gateway: &str) -> Self {
        self.gateway = gateway.to_string();
        self
    }

    /// All cached events for the sender, independent of the live chain.
    pub fn events(&self, sender: Address, kind: MechEventKind) -> Vec<&MechEvent> {
        self.store
            .get(&format!("{sender:#x}"), kind.event_name())
    }

    pub fn store(&self) -> &MechEventStore {
        &self.store
    }

    /// Scan all tracked contracts for new events of `kind` sent by
    /// `sender`, resuming from each contract's persisted watermark.
    pub async fn sync(
        &mut self,
        client: &ChainClient,
        sender: Address,
        kind: MechEventKind,
    ) -> Result<(), OperatorError> {
        tracing::info!(
            "Updating the local mech events cache (event {}, sender {sender:#x}); \
             this may take a while",
            kind.event_name()
        );
        for contract in self.contracts.clone() {
            self.sync_contract(client, &contract, sender, kind).await?;
        }
        self.store.flush()
    }

    async fn sync_contract(
        &mut self,
        client: &ChainClient,
        contract: &MechContract,
        sender: Address,
        kind: MechEventKind,
    ) -> Result<(), OperatorError> {
        let sender_key = format!("{sender:#x}");
        let contract_key = format!("{:#x}", contract.address);
        let event_name = kind.event_name();

        let watermark = self.store.watermark(&sender_key, &contract_key, event_name);
        let mut current = contract.earliest_block.max(watermark.saturating_add(1));

        loop {
            let mut head = client.block_number().await?;
            if head.saturating_sub(current) <= 2 * LOG_QUERY_CHUNK_SIZE {
                // Close to the head: tolerate provider indexing lag rather
                // than erroring on not-yet-served blocks.
                sleep(NEAR_HEAD_PAUSE).await;
                head = head.saturating_sub(HEAD_SAFETY_MARGIN);
            }
            if current > head {
                break;
            }
            let to = (current + LOG_QUERY_CHUNK_SIZE - 1).min(head);

            let filter = Filter::new()
                .address(contract.address)
                .event_signature(kind.signature_hash())
                .topic1(sender.into_word())
                .from_block(current)
                .to_block(to);

            let logs = client
                .provider
                .get_logs(&filter)
                .await
                .map_err(|e| OperatorError::Rpc(e.to_string()))?;

            for log in &logs {
                self.process_log(log, &sender_key, &contract_key, kind)
                    .await?;
            }

            // Persist after every chunk: a crash loses at most one chunk.
            self.store
                .set_watermark(&sender_key, &contract_key, event_name, to);
            self.store.flush()?;

            tracing::debug!(
                "Scanned {contract_key} blocks {current}..={to} ({} logs)",
                logs.len()
            );
            current = to + 1;
        }

        Ok(())
    }

    async fn process_log(
        &mut self,
        log: &Log,
        sender_key: &str,
        contract_key: &str,
        kind: MechEventKind,
    ) -> Result<(), OperatorError> {
        let (event_sender, request_id, payload) = match kind {
            MechEventKind::Request => {
                let decoded = log
                    .log_decode::<IAgentMech::Request>()
                    .map_err(|e| OperatorError::ChainInteraction(e.to_string()))?;
                let data = decoded.inner.data;
                (data.sender, data.requestId, data.data)
            }
            MechEventKind::Deliver => {
                let decoded = log
                    .log_decode::<IAgentMech::Deliver>()
                    .map_err(|e| OperatorError::ChainInteraction(e.to_string()))?;
                let data = decoded.inner.data;
                (data.sender, data.requestId, data.data)
            }
        };

        let event_id = request_id.to_string();
        if self
            .store
            .is_resolved(sender_key, contract_key, kind.event_name(), &event_id)
        {
            return Ok(());
        }

        let ipfs_hash = hex::encode(&payload);
        let (ipfs_link, ipfs_contents) = self.resolve_ipfs(&ipfs_hash).await;

        let event = MechEvent {
            event_id,
            sender: format!("{event_sender:#x}"),
            ipfs_hash,
            transaction_hash: log
                .transaction_hash
                .map(|h| format!("{h:#x}"))
                .unwrap_or_default(),
            block_number: log.block_number.unwrap_or_default(),
            block_timestamp: log.block_timestamp.unwrap_or_default(),
            ipfs_link,
            ipfs_contents,
            fee: DEFAULT_MECH_FEE,
        };
        self.store
            .merge(sender_key, contract_key, kind.event_name(), event);
        self.store.flush_throttled()
    }

    /// Fetch the event's gateway payload, trying the `metadata.json`
    /// sub-path first and the raw body second. Failure is tolerated: the
    /// contents stay empty and a later sync retries.
    async fn resolve_ipfs(&self, ipfs_hash: &str) -> (String, serde_json::Value) {
        let base = format!("{}{CID_PREFIX}{ipfs_hash}", self.gateway);
        for url in [format!("{base}/metadata.json"), base] {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    if let Ok(contents) = response.json::<serde_json::Value>().await {
                        if contents.is_object() {
                            return (url, contents);
                        }
                    }
                }
                Ok(_) | Err(_) => {}
            }
        }
        (String::new(), serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mirror_with_gateway(gateway: &str) -> (MechEventMirror, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MechEventStore::open(dir.path().join("mech_events.json")).unwrap();
        let mirror = MechEventMirror::new(store, vec![]).with_gateway(gateway);
        (mirror, dir)
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(MechEventKind::Request.event_name(), "Request");
        assert_eq!(MechEventKind::Deliver.event_name(), "Deliver");
        assert_ne!(
            MechEventKind::Request.signature_hash(),
            MechEventKind::Deliver.signature_hash()
        );
    }

    #[tokio::test]
    async fn test_resolve_ipfs_metadata_subpath() {
        let server = MockServer::start().await;
        let hash = "ab".repeat(32);
        Mock::given(method("GET"))
            .and(path(format!("/{CID_PREFIX}{hash}/metadata.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tool": "prediction-online",
                "prompt": "Will it rain tomorrow?"
            })))
            .mount(&server)
            .await;

        let (mirror, _dir) = mirror_with_gateway(&format!("{}/", server.uri()));
        let (link, contents) = mirror.resolve_ipfs(&hash).await;
        assert!(link.ends_with("/metadata.json"));
        assert_eq!(contents["tool"], "prediction-online");
    }

    #[tokio::test]
    async fn test_resolve_ipfs_falls_back_to_raw_body() {
        let server = MockServer::start().await;
        let hash = "cd".repeat(32);
        Mock::given(method("GET"))
            .and(path(format!("/{CID_PREFIX}{hash}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tool": "claude-prediction-offline"
            })))
            .mount(&server)
            .await;

        let (mirror, _dir) = mirror_with_gateway(&format!("{}/", server.uri()));
        let (link, contents) = mirror.resolve_ipfs(&hash).await;
        assert!(!link.is_empty());
        assert_eq!(contents["tool"], "claude-prediction-offline");
    }

    #[tokio::test]
    async fn test_resolve_ipfs_degrades_on_failure() {
        let server = MockServer::start().await;
        // No mocks mounted: every request 404s.
        let (mirror, _dir) = mirror_with_gateway(&format!("{}/", server.uri()));
        let (link, contents) = mirror.resolve_ipfs(&"ef".repeat(32)).await;
        assert!(link.is_empty());
        assert_eq!(contents, serde_json::json!({}));
    }
}
