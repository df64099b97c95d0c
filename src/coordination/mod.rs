//! Relay coordination
//!
//! The coordinator owns the deposit lifecycle between observation and
//! hand-off to a destination executor:
//! 1. Persists every deposit a watcher delivers before acknowledging it
//! 2. Waits for source-chain finality and evicts reorged deposits
//! 3. Queues confirmed deposits on the executor of their destination chain

pub mod engine;

pub use engine::RelayCoordinator;
