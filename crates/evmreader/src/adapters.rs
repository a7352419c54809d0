//! Contract adapters: normalize raw contract logs into typed observations.
//!
//! One trait per contract role. The EVM implementations fetch logs through
//! [crate::chain::fetch_logs] and decode them with [crate::abi]; tests substitute
//! in-memory doubles.

use alloy::primitives::{Address, Bytes};
use alloy::rpc::types::Log;
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use futures_util::TryStreamExt;

use crate::abi::{
    self, address_topic, ClaimAccepted, ClaimAcceptedObserved, InputAdded, InputAddedObserved,
    OutputExecuted, OutputExecutedObserved,
};
use crate::chain::{fetch_logs, BlockTag, LogFilter, LogProvider};
use crate::error::{ReaderError, Result};

/// Application contract: output executions.
#[async_trait]
pub trait ApplicationAdapter: Send + Sync {
    async fn retrieve_output_executions(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<OutputExecutedObserved>>;
}

/// Input source contract: inputs added for any of `applications`.
#[async_trait]
pub trait InputSourceAdapter: Send + Sync {
    async fn retrieve_inputs(
        &self,
        from_block: u64,
        to_block: u64,
        applications: &[Address],
    ) -> Result<Vec<InputAddedObserved>>;
}

/// Consensus contract: claim acceptances and the epoch length it enforces.
#[async_trait]
pub trait ConsensusAdapter: Send + Sync {
    async fn retrieve_claim_accepted(
        &self,
        from_block: u64,
        to_block: u64,
        applications: &[Address],
    ) -> Result<Vec<ClaimAcceptedObserved>>;

    async fn epoch_length(&self) -> Result<u64>;
}

/// Fetch every log of `filter` and decode it, dropping logs the node marked as removed.
async fn collect_decoded<P, T>(
    provider: &P,
    filter: LogFilter,
    max_range: u64,
    decode: fn(&Log) -> Result<T>,
) -> Result<Vec<T>>
where
    P: LogProvider + ?Sized,
{
    let logs: Vec<Log> = fetch_logs(provider, filter, max_range).try_collect().await?;
    logs.iter()
        .filter(|log| !log.removed)
        .map(decode)
        .collect()
}

/// Application contract adapter over any [LogProvider].
#[derive(Debug, Clone)]
pub struct EvmApplication<P> {
    address: Address,
    provider: P,
    max_range: u64,
}

impl<P: LogProvider> EvmApplication<P> {
    pub fn new(address: Address, provider: P, max_range: u64) -> Self {
        Self {
            address,
            provider,
            max_range,
        }
    }
}

#[async_trait]
impl<P: LogProvider> ApplicationAdapter for EvmApplication<P> {
    async fn retrieve_output_executions(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<OutputExecutedObserved>> {
        let filter = LogFilter::new(self.address, OutputExecuted::SIGNATURE_HASH, from_block, to_block);
        collect_decoded(&self.provider, filter, self.max_range, abi::decode_output_executed).await
    }
}

/// Input source contract adapter over any [LogProvider].
#[derive(Debug, Clone)]
pub struct EvmInputSource<P> {
    address: Address,
    provider: P,
    max_range: u64,
}

impl<P: LogProvider> EvmInputSource<P> {
    pub fn new(address: Address, provider: P, max_range: u64) -> Self {
        Self {
            address,
            provider,
            max_range,
        }
    }
}

#[async_trait]
impl<P: LogProvider> InputSourceAdapter for EvmInputSource<P> {
    async fn retrieve_inputs(
        &self,
        from_block: u64,
        to_block: u64,
        applications: &[Address],
    ) -> Result<Vec<InputAddedObserved>> {
        let filter = LogFilter::new(self.address, InputAdded::SIGNATURE_HASH, from_block, to_block)
            .topic1(applications.iter().map(address_topic));
        collect_decoded(&self.provider, filter, self.max_range, abi::decode_input_added).await
    }
}

/// Consensus contract adapter over any [LogProvider].
#[derive(Debug, Clone)]
pub struct EvmConsensus<P> {
    address: Address,
    provider: P,
    max_range: u64,
}

impl<P: LogProvider> EvmConsensus<P> {
    pub fn new(address: Address, provider: P, max_range: u64) -> Self {
        Self {
            address,
            provider,
            max_range,
        }
    }
}

#[async_trait]
impl<P: LogProvider> ConsensusAdapter for EvmConsensus<P> {
    async fn retrieve_claim_accepted(
        &self,
        from_block: u64,
        to_block: u64,
        applications: &[Address],
    ) -> Result<Vec<ClaimAcceptedObserved>> {
        let filter = LogFilter::new(self.address, ClaimAccepted::SIGNATURE_HASH, from_block, to_block)
            .topic1(applications.iter().map(address_topic));
        collect_decoded(&self.provider, filter, self.max_range, abi::decode_claim_accepted).await
    }

    async fn epoch_length(&self) -> Result<u64> {
        let data = Bytes::from(abi::getEpochLengthCall {}.abi_encode());
        let ret = self.provider.call(self.address, data, BlockTag::Latest).await?;
        let decoded = abi::getEpochLengthCall::abi_decode_returns(&ret, true)?;
        u64::try_from(decoded._0)
            .map_err(|_| ReaderError::Decode("epoch length does not fit in u64".into()))
    }
}
