//! Error types for the deposit relayer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("ledger: {0}")]
    Database(#[from] sqlx::Error),

    #[error("RPC failure on chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("broadcast rejected: {0}")]
    Transaction(String),

    #[error("signer nonce on chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("gas estimation: {0}")]
    GasEstimation(String),

    #[error("undecodable bridge log: {0}")]
    EventParsing(String),

    #[error("signer: {0}")]
    Wallet(String),

    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("chain {chain_id} is not configured")]
    ChainNotFound { chain_id: u64 },

    #[error("no deposit with nonce {nonce} from chain {source_chain}")]
    DepositNotFound { source_chain: u64, nonce: String },

    #[error("deposit cannot move from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("deposit evicted by reorg on chain {chain_id} (observed at block {block_number})")]
    ReorgDetected { chain_id: u64, block_number: u64 },

    #[error("signer underfunded on chain {chain_id}: balance {have} wei, needs {need} wei")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("coordinator hand-off channel closed")]
    ChannelClosed,

    #[error("internal: {0}")]
    Internal(String),
}

impl RelayerError {
    /// RPC-side trouble that says nothing about the deposit itself
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::Nonce { .. }
                | RelayerError::GasEstimation(_)
                | RelayerError::InsufficientBalance { .. }
        )
    }

    /// Conditions an operator has to act on
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientBalance { .. }
                | RelayerError::ReorgDetected { .. }
                | RelayerError::Wallet(_)
        )
    }
}

pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underfunded_signer_retries_and_alerts() {
        let err = RelayerError::InsufficientBalance {
            chain_id: 84532,
            have: "10".to_string(),
            need: "2000".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.should_alert());
    }

    #[test]
    fn test_lifecycle_errors_are_final() {
        let err = RelayerError::InvalidStateTransition {
            from: "completed".to_string(),
            to: "pending".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!err.should_alert());

        let err = RelayerError::ReorgDetected {
            chain_id: 17000,
            block_number: 42,
        };
        assert!(!err.is_retryable());
        assert!(err.should_alert());
    }
}
