//! JSON-backed local cache for mech events.
//!
//! One document keyed `sender -> contract -> event name -> bucket`, where a
//! bucket holds the `last_processed_block` watermark and the events seen so
//! far. The whole file is rewritten on every persisted update; writes are
//! throttled except for forced flushes. The document is versioned, and an
//! older version on disk is renamed aside and restarted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use trader_runtime::error::OperatorError;

pub const MECH_EVENTS_DB_VERSION: u64 = 3;

/// Minimum delay between throttled writes.
const MINIMUM_WRITE_FILE_DELAY: Duration = Duration::from_secs(20);

/// A mech Request/Deliver event as cached locally. Immutable once its IPFS
/// contents are resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MechEvent {
    /// On-chain request id.
    pub event_id: String,
    pub sender: String,
    pub ipfs_hash: String,
    pub transaction_hash: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    #[serde(default)]
    pub ipfs_link: String,
    /// Resolved gateway payload (tool, prompt, ...). Empty object when the
    /// fetch failed; a later sync may fill it in.
    #[serde(default)]
    pub ipfs_contents: serde_json::Value,
    /// Fee paid for the request, in wei.
    pub fee: u128,
}

impl MechEvent {
    pub fn has_resolved_contents(&self) -> bool {
        self.ipfs_contents
            .as_object()
            .is_some_and(|o| !o.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventBucket {
    pub last_processed_block: u64,
    pub mech_events: BTreeMap<String, MechEvent>,
}

type SenderMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, EventBucket>>>;

#[derive(Debug, Serialize, Deserialize)]
struct MechEventsDocument {
    db_version: u64,
    #[serde(flatten)]
    senders: SenderMap,
}

impl Default for MechEventsDocument {
    fn default() -> Self {
        Self {
            db_version: MECH_EVENTS_DB_VERSION,
            senders: SenderMap::new(),
        }
    }
}

pub struct MechEventStore {
    path: PathBuf,
    doc: MechEventsDocument,
    last_write: Option<Instant>,
}

impl MechEventStore {
    /// Open (or create) the store at `path`. A document with an older
    /// `db_version` is renamed aside and a fresh one started.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OperatorError> {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let doc: MechEventsDocument = serde_json::from_str(&raw)
                    .map_err(|e| OperatorError::Store(format!("corrupt events cache: {e}")))?;
                if doc.db_version < MECH_EVENTS_DB_VERSION {
                    let stamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
                    let old = path.with_file_name(format!("mech_events.{stamp}.old.json"));
                    std::fs::rename(&path, &old)
                        .map_err(|e| OperatorError::Store(e.to_string()))?;
                    tracing::warn!(
                        "Events cache was version {}, expected {MECH_EVENTS_DB_VERSION}; \
                         moved aside to {}",
                        doc.db_version,
                        old.display()
                    );
                    MechEventsDocument::default()
                } else {
                    doc
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MechEventsDocument::default(),
            Err(e) => return Err(OperatorError::Store(e.to_string())),
        };
        Ok(Self {
            path,
            doc,
            last_write: None,
        })
    }

    pub fn watermark(&self, sender: &str, contract: &str, event_name: &str) -> u64 {
        self.doc
            .senders
            .get(sender)
            .and_then(|c| c.get(contract))
            .and_then(|e| e.get(event_name))
            .map(|b| b.last_processed_block)
            .unwrap_or(0)
    }

    /// Advance the watermark. Only ever moves forward.
    pub fn set_watermark(&mut self, sender: &str, contract: &str, event_name: &str, block: u64) {
        let bucket = self.bucket_mut(sender, contract, event_name);
        bucket.last_processed_block = bucket.last_processed_block.max(block);
    }

    /// Whether an event is already cached with resolved IPFS contents, in
    /// which case it must never be refetched.
    pub fn is_resolved(
        &self,
        sender: &str,
        contract: &str,
        event_name: &str,
        event_id: &str,
    ) -> bool {
        self.doc
            .senders
            .get(sender)
            .and_then(|c| c.get(contract))
            .and_then(|e| e.get(event_name))
            .and_then(|b| b.mech_events.get(event_id))
            .is_some_and(MechEvent::has_resolved_contents)
    }

    /// Merge one event into its bucket, replacing any unresolved copy.
    pub fn merge(&mut self, sender: &str, contract: &str, event_name: &str, event: MechEvent) {
        let bucket = self.bucket_mut(sender, contract, event_name);
        bucket.mech_events.insert(event.event_id.clone(), event);
    }

    /// All cached events for a sender and event name across all tracked
    /// contracts, independent of the live chain.
    pub fn get(&self, sender: &str, event_name: &str) -> Vec<&MechEvent> {
        self.doc
            .senders
            .get(sender)
            .map(|contracts| {
                contracts
                    .values()
                    .filter_map(|events| events.get(event_name))
                    .flat_map(|bucket| bucket.mech_events.values())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Write the document to disk unconditionally.
    pub fn flush(&mut self) -> Result<(), OperatorError> {
        let raw = serde_json::to_string_pretty(&self.doc)?;
        std::fs::write(&self.path, raw).map_err(|e| OperatorError::Store(e.to_string()))?;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    /// Write the document unless a write happened within the throttle
    /// window.
    pub fn flush_throttled(&mut self) -> Result<(), OperatorError> {
        match self.last_write {
            Some(at) if at.elapsed() < MINIMUM_WRITE_FILE_DELAY => Ok(()),
            _ => self.flush(),
        }
    }

    fn bucket_mut(&mut self, sender: &str, contract: &str, event_name: &str) -> &mut EventBucket {
        self.doc
            .senders
            .entry(sender.to_string())
            .or_default()
            .entry(contract.to_string())
            .or_default()
            .entry(event_name.to_string())
            .or_default()
    }
}
