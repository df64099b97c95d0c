//! Ledger records

use crate::error::RelayerError;
use crate::events::DepositObserved;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a deposit. Ordered; `Failed` is terminal and reachable from
/// every state except `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Distributing,
    Completed,
    Failed,
}

impl DepositStatus {
    pub const ALL: [DepositStatus; 5] = [
        DepositStatus::Pending,
        DepositStatus::Confirmed,
        DepositStatus::Distributing,
        DepositStatus::Completed,
        DepositStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Confirmed => "confirmed",
            DepositStatus::Distributing => "distributing",
            DepositStatus::Completed => "completed",
            DepositStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositStatus::Completed | DepositStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            DepositStatus::Pending => 0,
            DepositStatus::Confirmed => 1,
            DepositStatus::Distributing => 2,
            DepositStatus::Completed => 3,
            DepositStatus::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic
    pub fn can_transition_to(&self, next: DepositStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }

    /// All states from which `next` may be entered
    pub fn predecessors(next: DepositStatus) -> Vec<DepositStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepositStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DepositStatus::Pending),
            "confirmed" => Ok(DepositStatus::Confirmed),
            "distributing" => Ok(DepositStatus::Distributing),
            "completed" => Ok(DepositStatus::Completed),
            "failed" => Ok(DepositStatus::Failed),
            other => Err(RelayerError::Internal(format!(
                "unknown deposit status {}",
                other
            ))),
        }
    }
}

/// A deposit about to be recorded for the first time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeposit {
    pub source_chain: u64,
    pub target_chain: u64,
    pub deposit_tx_hash: H256,
    pub log_index: u64,
    pub token: Address,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    pub nonce: U256,
    pub source_block_number: u64,
    pub source_block_hash: H256,
}

impl NewDeposit {
    pub fn from_observed(event: &DepositObserved, target_chain: u64) -> Self {
        Self {
            source_chain: event.chain_id,
            target_chain,
            deposit_tx_hash: event.tx_hash,
            log_index: event.log_index,
            token: event.token,
            sender: event.sender,
            recipient: event.recipient,
            amount: event.amount,
            nonce: event.nonce,
            source_block_number: event.block_number,
            source_block_hash: event.block_hash,
        }
    }
}

/// One cross-chain transfer attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub source_chain: u64,
    pub target_chain: u64,
    pub deposit_tx_hash: H256,
    pub log_index: u64,
    pub token: Address,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    pub nonce: U256,
    pub source_block_number: u64,
    pub source_block_hash: H256,
    pub confirmations: u64,
    pub status: DepositStatus,
    pub distribution_tx_hash: Option<H256>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    pub fn pending(new: &NewDeposit, now: DateTime<Utc>) -> Self {
        Self {
            source_chain: new.source_chain,
            target_chain: new.target_chain,
            deposit_tx_hash: new.deposit_tx_hash,
            log_index: new.log_index,
            token: new.token,
            sender: new.sender,
            recipient: new.recipient,
            amount: new.amount,
            nonce: new.nonce,
            source_block_number: new.source_block_number,
            source_block_hash: new.source_block_hash,
            confirmations: 0,
            status: DepositStatus::Pending,
            distribution_tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key the ledger enforces uniqueness on
    pub fn key(&self) -> (u64, U256) {
        (self.source_chain, self.nonce)
    }
}

/// Optional fields written together with a status transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub distribution_tx_hash: Option<H256>,
    pub failure_reason: Option<String>,
    pub confirmations: Option<u64>,
}

impl StatusUpdate {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_tx_hash(tx_hash: Option<H256>) -> Self {
        Self {
            distribution_tx_hash: tx_hash,
            ..Default::default()
        }
    }

    pub fn with_confirmations(confirmations: u64) -> Self {
        Self {
            confirmations: Some(confirmations),
            ..Default::default()
        }
    }
}

/// Result of recording an observed deposit
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub deposit: Deposit,
    /// False when the deposit was already known
    pub created: bool,
}

/// Filter for deposit listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepositQuery {
    pub status: Option<DepositStatus>,
    pub source_chain: Option<u64>,
    pub limit: Option<i64>,
}

impl DepositQuery {
    pub const DEFAULT_LIMIT: i64 = 100;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1_000)
    }
}

/// Per-chain scan cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMetadata {
    pub chain_id: u64,
    /// `None` until the first range has been scanned
    pub last_block_scanned: Option<u64>,
    pub required_confirmations: u64,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedToken {
    pub chain_id: u64,
    pub token_address: Address,
    pub symbol: String,
    pub decimals: u8,
}

/// Deposit counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DepositStats {
    pub pending: u64,
    pub confirmed: u64,
    pub distributing: u64,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        use DepositStatus::*;

        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Distributing));
        assert!(Distributing.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Distributing.can_transition_to(Failed));

        assert!(!Confirmed.can_transition_to(Pending));
        assert!(!Distributing.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_predecessors() {
        use DepositStatus::*;

        assert_eq!(DepositStatus::predecessors(Distributing), vec![Pending, Confirmed]);
        assert_eq!(
            DepositStatus::predecessors(Failed),
            vec![Pending, Confirmed, Distributing]
        );
        assert!(DepositStatus::predecessors(Pending).is_empty());
    }

    #[test]
    fn test_query_limit_is_clamped() {
        assert_eq!(DepositQuery::default().limit(), 100);
        let query = DepositQuery {
            limit: Some(50_000),
            ..Default::default()
        };
        assert_eq!(query.limit(), 1_000);
    }
}
