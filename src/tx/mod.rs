//! Distribution submission: signer nonces, gas, retries and the per-chain
//! ordered executor

mod executor;
mod gas;
mod nonce;
pub mod retry;
mod sender;

pub use executor::{DistributionExecutor, ExecutorConfig};
pub use nonce::NonceManager;
pub use retry::RetryConfig;
pub use sender::TransactionSender;
