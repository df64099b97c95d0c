//! Scripted in-process chain for engine tests

use crate::chain::{ChainClient, DistributionReceipt, Inclusion, SubmitError};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{DepositObserved, DistributionCall};
use crate::state::{
    ChainMetadata, Deposit, DepositQuery, DepositStats, DepositStatus, Ledger, MemoryLedger,
    NewDeposit, RecordOutcome, StatusUpdate, SupportedToken,
};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    head: u64,
    deposits: Vec<DepositObserved>,
    inclusions: HashMap<H256, Inclusion>,
    receipts: HashMap<H256, DistributionReceipt>,
    submissions: Vec<DistributionCall>,
    submit_script: VecDeque<Result<(), SubmitError>>,
    landings: VecDeque<Landing>,
    /// Broadcasts the node still knows, mined or not
    known: HashSet<H256>,
    rpc_down: bool,
}

/// How an accepted broadcast ends up on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    Mined,
    Reverted,
    /// Sits in the mempool until the test mines or drops it
    Unmined,
}

/// A chain whose head, logs, receipts and submission results are set by
/// the test. Broadcast distributions are mined immediately unless a
/// scripted error or landing is queued.
pub struct FakeChain {
    chain_id: u64,
    state: Mutex<FakeState>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    /// Emit a deposit log and make its transaction retrievable
    pub fn add_deposit(&self, event: DepositObserved) {
        let mut state = self.state();
        state.inclusions.insert(
            event.tx_hash,
            Inclusion {
                block_number: event.block_number,
                block_hash: event.block_hash,
            },
        );
        state.deposits.push(event);
    }

    /// Re-mine or evict a transaction
    pub fn set_inclusion(&self, tx_hash: H256, inclusion: Option<Inclusion>) {
        let mut state = self.state();
        match inclusion {
            Some(inclusion) => state.inclusions.insert(tx_hash, inclusion),
            None => state.inclusions.remove(&tx_hash),
        };
    }

    pub fn set_receipt(&self, tx_hash: H256, success: bool) {
        let mut state = self.state();
        let block_number = state.head;
        state.known.insert(tx_hash);
        state.receipts.insert(
            tx_hash,
            DistributionReceipt {
                success,
                block_number,
            },
        );
    }

    /// Queue the result of the next `send_distribution` call
    pub fn script_submit(&self, result: Result<(), SubmitError>) {
        self.state().submit_script.push_back(result);
    }

    /// Queue how the next accepted broadcast lands
    pub fn script_landing(&self, landing: Landing) {
        self.state().landings.push_back(landing);
    }

    /// Evict an unmined broadcast from the mempool
    pub fn drop_tx(&self, tx_hash: H256) {
        self.state().known.remove(&tx_hash);
    }

    pub fn set_rpc_down(&self, down: bool) {
        self.state().rpc_down = down;
    }

    /// Every `distribute` call attempted, in order
    pub fn submissions(&self) -> Vec<DistributionCall> {
        self.state().submissions.clone()
    }

    fn check_rpc(&self, state: &FakeState) -> RelayerResult<()> {
        if state.rpc_down {
            return Err(RelayerError::ChainConnection {
                chain_id: self.chain_id,
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        let state = self.state();
        self.check_rpc(&state)?;
        Ok(state.head)
    }

    async fn deposit_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<DepositObserved>> {
        let state = self.state();
        self.check_rpc(&state)?;
        Ok(state
            .deposits
            .iter()
            .filter(|d| d.block_number >= from_block && d.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn transaction_inclusion(&self, tx_hash: H256) -> RelayerResult<Option<Inclusion>> {
        let state = self.state();
        self.check_rpc(&state)?;
        Ok(state.inclusions.get(&tx_hash).copied())
    }

    async fn send_distribution(&self, call: &DistributionCall) -> Result<H256, SubmitError> {
        let mut state = self.state();
        state.submissions.push(call.clone());
        if let Some(Err(e)) = state.submit_script.pop_front() {
            return Err(e);
        }

        let tx_hash = H256::from_low_u64_be(0x1000 + state.submissions.len() as u64);
        state.known.insert(tx_hash);
        let landing = state.landings.pop_front().unwrap_or(Landing::Mined);
        if landing != Landing::Unmined {
            let block_number = state.head;
            state.receipts.insert(
                tx_hash,
                DistributionReceipt {
                    success: landing == Landing::Mined,
                    block_number,
                },
            );
        }
        Ok(tx_hash)
    }

    async fn distribution_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<DistributionReceipt>> {
        let state = self.state();
        self.check_rpc(&state)?;
        Ok(state.receipts.get(&tx_hash).copied())
    }

    async fn distribution_known(&self, tx_hash: H256) -> RelayerResult<bool> {
        let state = self.state();
        self.check_rpc(&state)?;
        Ok(state.known.contains(&tx_hash))
    }
}

/// A deposit observed on `chain_id` at `block`, keyed by `nonce`
pub fn observed(chain_id: u64, nonce: u64, block: u64) -> DepositObserved {
    DepositObserved {
        chain_id,
        token: Address::repeat_byte(0x02),
        sender: Address::repeat_byte(0x03),
        recipient: Address::repeat_byte(0x04),
        amount: U256::exp10(18),
        nonce: U256::from(nonce),
        tx_hash: H256::from_low_u64_be(nonce),
        block_number: block,
        block_hash: H256::from_low_u64_be(0xb000 + block),
        log_index: 0,
    }
}

pub fn new_deposit(source_chain: u64, target_chain: u64, nonce: u64) -> NewDeposit {
    NewDeposit::from_observed(&observed(source_chain, nonce, 100), target_chain)
}

/// [`MemoryLedger`] whose next few `transition` calls fail as if the
/// database were briefly unreachable
#[derive(Default)]
pub struct FlakyLedger {
    inner: MemoryLedger,
    failing_transitions: AtomicU32,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transitions(&self, count: u32) {
        self.failing_transitions.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn record_deposit(&self, deposit: &NewDeposit) -> RelayerResult<RecordOutcome> {
        self.inner.record_deposit(deposit).await
    }

    async fn get_deposit(&self, source_chain: u64, nonce: U256) -> RelayerResult<Option<Deposit>> {
        self.inner.get_deposit(source_chain, nonce).await
    }

    async fn list_deposits(&self, query: &DepositQuery) -> RelayerResult<Vec<Deposit>> {
        self.inner.list_deposits(query).await
    }

    async fn list_unfinished(&self) -> RelayerResult<Vec<Deposit>> {
        self.inner.list_unfinished().await
    }

    async fn lowest_open_nonce(
        &self,
        source_chain: u64,
        target_chain: u64,
    ) -> RelayerResult<Option<U256>> {
        self.inner.lowest_open_nonce(source_chain, target_chain).await
    }

    async fn update_confirmations(
        &self,
        source_chain: u64,
        nonce: U256,
        confirmations: u64,
    ) -> RelayerResult<()> {
        self.inner
            .update_confirmations(source_chain, nonce, confirmations)
            .await
    }

    async fn transition(
        &self,
        source_chain: u64,
        nonce: U256,
        to: DepositStatus,
        update: StatusUpdate,
    ) -> RelayerResult<Deposit> {
        let failing = self
            .failing_transitions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RelayerError::Internal("connection reset by peer".to_string()));
        }
        self.inner.transition(source_chain, nonce, to, update).await
    }

    async fn record_distribution_tx(
        &self,
        source_chain: u64,
        nonce: U256,
        tx_hash: Option<H256>,
    ) -> RelayerResult<()> {
        self.inner
            .record_distribution_tx(source_chain, nonce, tx_hash)
            .await
    }

    async fn get_chain_metadata(&self, chain_id: u64) -> RelayerResult<Option<ChainMetadata>> {
        self.inner.get_chain_metadata(chain_id).await
    }

    async fn list_chain_metadata(&self) -> RelayerResult<Vec<ChainMetadata>> {
        self.inner.list_chain_metadata().await
    }

    async fn register_chain(
        &self,
        chain_id: u64,
        required_confirmations: u64,
    ) -> RelayerResult<ChainMetadata> {
        self.inner.register_chain(chain_id, required_confirmations).await
    }

    async fn advance_cursor(
        &self,
        chain_id: u64,
        scanned_from: Option<u64>,
        block_number: u64,
    ) -> RelayerResult<Option<u64>> {
        self.inner
            .advance_cursor(chain_id, scanned_from, block_number)
            .await
    }

    async fn set_cursor(
        &self,
        chain_id: u64,
        block_number: Option<u64>,
    ) -> RelayerResult<ChainMetadata> {
        self.inner.set_cursor(chain_id, block_number).await
    }

    async fn set_chain_active(&self, chain_id: u64, active: bool) -> RelayerResult<ChainMetadata> {
        self.inner.set_chain_active(chain_id, active).await
    }

    async fn upsert_supported_token(&self, token: &SupportedToken) -> RelayerResult<()> {
        self.inner.upsert_supported_token(token).await
    }

    async fn list_supported_tokens(
        &self,
        chain_id: Option<u64>,
    ) -> RelayerResult<Vec<SupportedToken>> {
        self.inner.list_supported_tokens(chain_id).await
    }

    async fn stats(&self) -> RelayerResult<DepositStats> {
        self.inner.stats().await
    }

    async fn health_check(&self) -> RelayerResult<()> {
        self.inner.health_check().await
    }
}
