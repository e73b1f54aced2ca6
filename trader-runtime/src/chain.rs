//! Shared chain client for the Gnosis ledger.
//!
//! Wraps a configured alloy provider with a local signer and provides the
//! transaction submission loop: bounded retries for transient RPC errors,
//! repricing for underpriced transactions, duplicate detection, and an
//! absolute deadline.

use std::time::Duration;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use tokio::time::{Instant, sleep};

use crate::error::OperatorError;
use crate::types::TxDescriptor;

/// The concrete provider type produced by
/// `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type HttpProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider<Ethereum>,
    Ethereum,
>;

const GAS_LIMIT: u64 = 500_000;
const MAX_FEE_PER_GAS: u128 = 30_000_000_000;
const MAX_PRIORITY_FEE_PER_GAS: u128 = 3_000_000_000;

/// Submission retry/timeout policy.
#[derive(Debug, Clone)]
pub struct TxSettings {
    /// Absolute deadline for one submission, including retries.
    pub timeout: Duration,
    /// Maximum submission/poll attempts.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_sleep: Duration,
}

impl Default for TxSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 10,
            retry_sleep: Duration::from_secs(6),
        }
    }
}

/// A chain client wrapping an alloy provider with a local signer.
pub struct ChainClient {
    pub provider: HttpProvider,
    pub wallet: EthereumWallet,
    pub signer_address: Address,
    pub chain_id: u64,
    pub settings: TxSettings,
}

impl ChainClient {
    /// Create a new chain client from an RPC URL and a loaded signer.
    pub fn new(
        rpc_url: &str,
        signer: PrivateKeySigner,
        chain_id: u64,
    ) -> Result<Self, OperatorError> {
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let url: url::Url = rpc_url
            .parse()
            .map_err(|e| OperatorError::Config(format!("Invalid RPC URL: {e}")))?;

        let provider = ProviderBuilder::new()
            .wallet(wallet.clone())
            .connect_http(url);

        Ok(Self {
            provider,
            wallet,
            signer_address,
            chain_id,
            settings: TxSettings::default(),
        })
    }

    /// Client for view-only commands. The ephemeral signer never signs
    /// anything.
    pub fn read_only(rpc_url: &str, chain_id: u64) -> Result<Self, OperatorError> {
        Self::new(rpc_url, PrivateKeySigner::random(), chain_id)
    }

    pub fn with_settings(mut self, settings: TxSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Get a reference to the underlying provider.
    pub fn provider(&self) -> &HttpProvider {
        &self.provider
    }

    /// Native balance of an address.
    pub async fn native_balance(&self, owner: Address) -> Result<U256, OperatorError> {
        self.provider
            .get_balance(owner)
            .await
            .map_err(|e| OperatorError::Rpc(e.to_string()))
    }

    /// Current chain head block number.
    pub async fn block_number(&self) -> Result<u64, OperatorError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| OperatorError::Rpc(e.to_string()))
    }

    /// Sign and submit a transaction, then wait for its receipt.
    ///
    /// Retries transient errors with a fixed sleep, reprices underpriced
    /// submissions, and switches to pure receipt polling once the node
    /// reports the transaction as already known. A receipt with a failed
    /// status is fatal.
    pub async fn submit(&self, tx: &TxDescriptor) -> Result<TransactionReceipt, OperatorError> {
        let settings = self.settings.clone();
        let deadline = Instant::now() + settings.timeout;

        let nonce = self
            .provider
            .get_transaction_count(self.signer_address)
            .await
            .map_err(|e| OperatorError::Rpc(e.to_string()))?;

        let mut max_fee = MAX_FEE_PER_GAS;
        let mut max_priority = MAX_PRIORITY_FEE_PER_GAS;
        let mut known_digest: Option<B256> = None;
        let mut retries = 0u32;

        while retries < settings.max_retries && Instant::now() < deadline {
            retries += 1;

            let digest = match known_digest {
                Some(digest) => digest,
                None => {
                    let request = TransactionRequest::default()
                        .with_to(tx.to)
                        .with_input(tx.data.clone())
                        .with_value(tx.value)
                        .with_nonce(nonce)
                        .with_chain_id(self.chain_id)
                        .with_gas_limit(GAS_LIMIT)
                        .with_max_fee_per_gas(max_fee)
                        .with_max_priority_fee_per_gas(max_priority);

                    let envelope = request.build(&self.wallet).await.map_err(|e| {
                        OperatorError::ChainInteraction(format!("failed to sign transaction: {e}"))
                    })?;
                    let digest = *envelope.tx_hash();

                    match self
                        .provider
                        .send_raw_transaction(&envelope.encoded_2718())
                        .await
                    {
                        Ok(_) => {
                            tracing::debug!("Transaction broadcast: {digest}");
                            known_digest = Some(digest);
                            digest
                        }
                        Err(e) => {
                            let error = e.to_string();
                            if is_already_known(&error) {
                                known_digest = Some(digest);
                                digest
                            } else if should_reprice(&error) {
                                tracing::info!("Repricing the transaction...");
                                max_fee = max_fee + max_fee / 4;
                                max_priority = max_priority + max_priority / 4;
                                continue;
                            } else if should_retry(&error) {
                                tracing::warn!(
                                    "Error occurred when interacting with chain: {error}; \
                                     will retry in {:?}...",
                                    settings.retry_sleep
                                );
                                sleep(settings.retry_sleep).await;
                                continue;
                            } else {
                                return Err(OperatorError::ChainInteraction(error));
                            }
                        }
                    }
                }
            };

            match self.provider.get_transaction_receipt(digest).await {
                Ok(Some(receipt)) => return check_receipt(receipt),
                Ok(None) => {
                    sleep(settings.retry_sleep).await;
                }
                Err(e) => {
                    let error = e.to_string();
                    if !should_retry(&error) {
                        return Err(OperatorError::Rpc(error));
                    }
                    sleep(settings.retry_sleep).await;
                }
            }
        }

        Err(OperatorError::ChainTimeout(format!(
            "no receipt for transaction to {} after {retries} attempts",
            tx.to
        )))
    }
}

/// A receipt with a failed status aborts the calling operation; the receipt
/// is carried in the error for manual inspection.
fn check_receipt(receipt: TransactionReceipt) -> Result<TransactionReceipt, OperatorError> {
    if receipt.status() {
        return Ok(receipt);
    }
    Err(OperatorError::TransactionFailed {
        tx_hash: format!("{}", receipt.transaction_hash),
        status: 0,
        receipt_json: serde_json::to_string(&receipt).unwrap_or_default(),
    })
}

fn is_already_known(error: &str) -> bool {
    let e = error.to_ascii_lowercase();
    e.contains("already known") || e.contains("alreadyknown") || e.contains("known transaction")
}

fn should_reprice(error: &str) -> bool {
    let e = error.to_ascii_lowercase();
    e.contains("underpriced") || e.contains("feetoolow") || e.contains("fee too low")
}

fn should_retry(error: &str) -> bool {
    let e = error.to_ascii_lowercase();
    should_reprice(&e)
        || e.contains("nonce too low")
        || e.contains("connection")
        || e.contains("timeout")
        || e.contains("timed out")
        || e.contains("temporarily unavailable")
        || e.contains("too many requests")
        || e.contains("try again")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> PrivateKeySigner {
        // Well-known test private key (Hardhat account #0)
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_chain_client_creation() {
        let client = ChainClient::new("http://localhost:8545", test_signer(), 100);
        assert!(client.is_ok());
        assert_eq!(client.unwrap().chain_id, 100);
    }

    #[test]
    fn test_invalid_rpc_url() {
        let result = ChainClient::new("not a url", test_signer(), 100);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(is_already_known("AlreadyKnown"));
        assert!(is_already_known("tx already known by pool"));
        assert!(should_reprice("replacement transaction underpriced"));
        assert!(should_reprice("FeeTooLow"));
        assert!(should_retry("nonce too low"));
        assert!(should_retry("connection refused"));
        assert!(should_retry("request timed out"));
        assert!(!should_retry("execution reverted"));
        assert!(!should_retry("insufficient funds for gas * price + value"));
    }

    #[test]
    fn test_default_settings() {
        let settings = TxSettings::default();
        assert_eq!(settings.timeout, Duration::from_secs(120));
        assert_eq!(settings.max_retries, 10);
        assert_eq!(settings.retry_sleep, Duration::from_secs(6));
    }
}
