use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timed out when waiting for transaction to go through: {0}")]
    ChainTimeout(String),

    #[error("Chain interaction error: {0}")]
    ChainInteraction(String),

    #[error("Transaction {tx_hash} failed on-chain (status {status}): {receipt_json}")]
    TransactionFailed {
        tx_hash: String,
        status: u64,
        receipt_json: String,
    },

    #[error("Unknown staking program: {0}")]
    UnknownProgram(String),

    #[error("Staking guard violation: {reason}. {suggestion}")]
    StakingGuard { reason: String, suggestion: String },

    #[error("Key error: {0}")]
    Key(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for OperatorError {
    fn from(e: reqwest::Error) -> Self {
        OperatorError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(e: serde_json::Error) -> Self {
        OperatorError::Serialization(e.to_string())
    }
}

impl OperatorError {
    /// Guard violation with an operator-facing suggestion.
    pub fn guard(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        OperatorError::StakingGuard {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }
}
