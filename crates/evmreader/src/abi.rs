//! ABI bindings for the rollup contracts and decoding of their logs.
//!
//! InputAdded (input source), ClaimAccepted (consensus), OutputExecuted (application)
//! and the consensus `getEpochLength()` view.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;

use crate::error::{ReaderError, Result};

alloy::sol! {
    event InputAdded(address indexed appContract, uint256 indexed index, bytes input);

    event ClaimAccepted(
        address indexed appContract,
        uint256 lastProcessedBlockNumber,
        bytes32 outputsMerkleRoot
    );

    event OutputExecuted(uint64 outputIndex, bytes output);

    function getEpochLength() external view returns (uint256);
}

/// Chain position of a decoded log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogMeta {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
}

/// Observed InputAdded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputAddedObserved {
    pub application: Address,
    pub index: u64,
    pub input: Bytes,
    pub meta: LogMeta,
}

/// Observed ClaimAccepted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimAcceptedObserved {
    pub application: Address,
    pub last_processed_block_number: u64,
    pub claim: B256,
    pub meta: LogMeta,
}

/// Observed OutputExecuted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputExecutedObserved {
    pub output_index: u64,
    pub output: Bytes,
    pub meta: LogMeta,
}

fn log_meta(log: &Log) -> Result<LogMeta> {
    let block_number = log
        .block_number
        .ok_or_else(|| ReaderError::Decode("log without blockNumber".into()))?;
    Ok(LogMeta {
        block_number,
        log_index: log.log_index.unwrap_or_default(),
        transaction_hash: log
            .transaction_hash
            .ok_or_else(|| ReaderError::Decode("log without transactionHash".into()))?,
    })
}

fn to_u64(value: U256, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| ReaderError::Decode(format!("{what} does not fit in u64")))
}

/// Decode a raw log into InputAddedObserved.
pub fn decode_input_added(log: &Log) -> Result<InputAddedObserved> {
    let ev = InputAdded::decode_log_data(&log.inner.data, true)?;
    Ok(InputAddedObserved {
        application: ev.appContract,
        index: to_u64(ev.index, "input index")?,
        input: ev.input,
        meta: log_meta(log)?,
    })
}

/// Decode a raw log into ClaimAcceptedObserved.
pub fn decode_claim_accepted(log: &Log) -> Result<ClaimAcceptedObserved> {
    let ev = ClaimAccepted::decode_log_data(&log.inner.data, true)?;
    Ok(ClaimAcceptedObserved {
        application: ev.appContract,
        last_processed_block_number: to_u64(ev.lastProcessedBlockNumber, "lastProcessedBlockNumber")?,
        claim: ev.outputsMerkleRoot,
        meta: log_meta(log)?,
    })
}

/// Decode a raw log into OutputExecutedObserved.
pub fn decode_output_executed(log: &Log) -> Result<OutputExecutedObserved> {
    let ev = OutputExecuted::decode_log_data(&log.inner.data, true)?;
    Ok(OutputExecutedObserved {
        output_index: ev.outputIndex,
        output: ev.output,
        meta: log_meta(log)?,
    })
}

/// Indexed-address topic (left-padded to 32 bytes).
pub fn address_topic(address: &Address) -> B256 {
    address.into_word()
}
