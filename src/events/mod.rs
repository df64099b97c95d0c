//! Bridge contract bindings and deposit event parsing
//!
//! Both chains run the same bridge contract: users lock tokens with `deposit`,
//! which emits `Deposit`, and the relayer releases them on the other side
//! with `distribute`.

use crate::error::{RelayerError, RelayerResult};

use ethers::abi::RawLog;
use ethers::contract::{abigen, EthEvent};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::error;

abigen!(
    BridgeContract,
    r#"[
        event Deposit(address indexed token, address indexed from, address indexed to, uint256 amount, uint256 nonce)
        function distribute(address token, address recipient, uint256 amount, uint256 nonce) external
    ]"#,
);

/// A deposit as reported by a chain watcher, before any finality check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositObserved {
    pub chain_id: u64,
    pub token: Address,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    pub nonce: U256,
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    pub log_index: u64,
}

/// Arguments of a `distribute` call on the destination bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionCall {
    pub target_chain: u64,
    pub token: Address,
    pub recipient: Address,
    pub amount: U256,
    pub nonce: U256,
}

impl DistributionCall {
    /// ABI-encoded calldata including the function selector
    pub fn calldata(&self) -> Bytes {
        let call = DistributeCall {
            token: self.token,
            recipient: self.recipient,
            amount: self.amount,
            nonce: self.nonce,
        };
        Bytes::from(ethers::abi::AbiEncode::encode(call))
    }
}

/// Topic0 of the `Deposit` event
pub fn deposit_topic() -> H256 {
    DepositFilter::signature()
}

/// Parses bridge logs into deposits for a single chain
pub struct EventParser {
    chain_id: u64,
    contract_address: Address,
}

impl EventParser {
    pub fn new(chain_id: u64, contract_address: Address) -> Self {
        Self {
            chain_id,
            contract_address,
        }
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    /// Filter selecting `Deposit` logs of this bridge in a block range
    pub fn deposit_filter(&self, from_block: u64, to_block: u64) -> Filter {
        Filter::new()
            .address(self.contract_address)
            .topic0(deposit_topic())
            .from_block(from_block)
            .to_block(to_block)
    }

    /// Parse a log entry into a deposit
    pub fn parse_log(&self, log: &Log) -> RelayerResult<DepositObserved> {
        if log.address != self.contract_address {
            return Err(RelayerError::EventParsing(format!(
                "log from unexpected contract {:?}",
                log.address
            )));
        }

        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| RelayerError::EventParsing("missing transaction hash".to_string()))?;
        let block_number = log
            .block_number
            .ok_or_else(|| RelayerError::EventParsing("missing block number".to_string()))?
            .as_u64();
        let block_hash = log
            .block_hash
            .ok_or_else(|| RelayerError::EventParsing("missing block hash".to_string()))?;
        let log_index = log.log_index.map(|i| i.as_u64()).unwrap_or_default();

        let raw = RawLog::from(log.clone());
        let event = <DepositFilter as EthEvent>::decode_log(&raw)
            .map_err(|e| RelayerError::EventParsing(format!("{} in tx {:?}", e, tx_hash)))?;

        Ok(DepositObserved {
            chain_id: self.chain_id,
            token: event.token,
            sender: event.from,
            recipient: event.to,
            amount: event.amount,
            nonce: event.nonce,
            tx_hash,
            block_number,
            block_hash,
            log_index,
        })
    }

    /// Decode a scanned range in log order, dropping logs a reorg removed.
    /// A bridge log that does not decode fails the whole range so the
    /// cursor stays before it.
    pub fn parse_logs(&self, logs: Vec<Log>) -> RelayerResult<Vec<DepositObserved>> {
        let mut deposits = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|l| l.removed != Some(true)) {
            match self.parse_log(log) {
                Ok(deposit) => deposits.push(deposit),
                Err(e) => {
                    error!(
                        alert = true,
                        chain_id = self.chain_id,
                        block = ?log.block_number,
                        tx_hash = ?log.transaction_hash,
                        "Undecodable bridge log, holding the scan: {}",
                        e
                    );
                    return Err(e);
                }
            }
        }
        deposits.sort_by_key(|d| (d.block_number, d.log_index));
        Ok(deposits)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ethers::abi::{self, Token};

    pub(crate) fn deposit_log(
        contract: Address,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
        nonce: U256,
    ) -> Log {
        Log {
            address: contract,
            topics: vec![
                deposit_topic(),
                H256::from(token),
                H256::from(from),
                H256::from(to),
            ],
            data: Bytes::from(abi::encode(&[Token::Uint(amount), Token::Uint(nonce)])),
            block_hash: Some(H256::repeat_byte(0xbb)),
            block_number: Some(U64::from(120)),
            transaction_hash: Some(H256::repeat_byte(0xaa)),
            transaction_index: Some(U64::zero()),
            log_index: Some(U256::from(3)),
            ..Default::default()
        }
    }

    #[test]
    fn test_deposit_topic_matches_signature() {
        let expected = ethers::utils::keccak256("Deposit(address,address,address,uint256,uint256)");
        assert_eq!(deposit_topic(), H256::from(expected));
    }

    #[test]
    fn test_parse_deposit_log() {
        let contract = Address::repeat_byte(0x01);
        let token = Address::repeat_byte(0x02);
        let from = Address::repeat_byte(0x03);
        let to = Address::repeat_byte(0x04);
        let amount = U256::exp10(18);

        let parser = EventParser::new(17000, contract);
        let log = deposit_log(contract, token, from, to, amount, U256::from(7));

        let deposit = parser.parse_log(&log).unwrap();
        assert_eq!(deposit.chain_id, 17000);
        assert_eq!(deposit.token, token);
        assert_eq!(deposit.sender, from);
        assert_eq!(deposit.recipient, to);
        assert_eq!(deposit.amount, amount);
        assert_eq!(deposit.nonce, U256::from(7));
        assert_eq!(deposit.block_number, 120);
        assert_eq!(deposit.block_hash, H256::repeat_byte(0xbb));
        assert_eq!(deposit.log_index, 3);
    }

    #[test]
    fn test_parse_rejects_foreign_contract() {
        let parser = EventParser::new(17000, Address::repeat_byte(0x01));
        let log = deposit_log(
            Address::repeat_byte(0x09),
            Address::zero(),
            Address::zero(),
            Address::zero(),
            U256::one(),
            U256::one(),
        );
        assert!(matches!(
            parser.parse_log(&log),
            Err(RelayerError::EventParsing(_))
        ));
    }

    #[test]
    fn test_undecodable_log_fails_range() {
        let contract = Address::repeat_byte(0x01);
        let parser = EventParser::new(17000, contract);
        let good = deposit_log(
            contract,
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
            Address::repeat_byte(0x04),
            U256::exp10(18),
            U256::from(5),
        );
        let mut truncated = good.clone();
        truncated.data = Bytes::from(vec![0u8; 7]);
        let mut removed = truncated.clone();
        removed.removed = Some(true);

        let deposits = parser.parse_logs(vec![removed, good.clone()]).unwrap();
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].nonce, U256::from(5));

        assert!(matches!(
            parser.parse_logs(vec![good, truncated]),
            Err(RelayerError::EventParsing(_))
        ));
    }

    #[test]
    fn test_distribution_calldata_selector() {
        let call = DistributionCall {
            target_chain: 8453,
            token: Address::repeat_byte(0x02),
            recipient: Address::repeat_byte(0x04),
            amount: U256::exp10(18),
            nonce: U256::from(7),
        };
        let data = call.calldata();
        let selector = &ethers::utils::keccak256("distribute(address,address,uint256,uint256)")[..4];
        assert_eq!(&data[..4], selector);
        assert_eq!(data.len(), 4 + 32 * 4);
    }
}
