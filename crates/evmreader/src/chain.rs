//! Chain access seams: head subscription, header lookup, log retrieval and contract calls.

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::Log;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::DefaultBlock;
use crate::error::{ReaderError, Result};

/// Block selector for header lookups and calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
    Safe,
    Finalized,
    Pending,
}

impl BlockTag {
    pub fn to_rpc(self) -> Value {
        match self {
            BlockTag::Number(n) => Value::String(format!("0x{:x}", n)),
            BlockTag::Latest => json!("latest"),
            BlockTag::Safe => json!("safe"),
            BlockTag::Finalized => json!("finalized"),
            BlockTag::Pending => json!("pending"),
        }
    }
}

impl From<DefaultBlock> for BlockTag {
    fn from(b: DefaultBlock) -> Self {
        match b {
            DefaultBlock::Latest => BlockTag::Latest,
            DefaultBlock::Safe => BlockTag::Safe,
            DefaultBlock::Finalized => BlockTag::Finalized,
            DefaultBlock::Pending => BlockTag::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub number: u64,
    /// Absent for the pending block.
    pub hash: Option<B256>,
    pub parent_hash: B256,
}

/// Live newHeads feed. Headers arrive on `headers`; a transport failure is reported once
/// on `errors`. Dropping the subscription stops the feeding task.
pub struct HeadSubscription {
    pub headers: mpsc::Receiver<BlockHeader>,
    pub errors: oneshot::Receiver<ReaderError>,
    task: Option<JoinHandle<()>>,
}

impl HeadSubscription {
    pub fn new(
        headers: mpsc::Receiver<BlockHeader>,
        errors: oneshot::Receiver<ReaderError>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            headers,
            errors,
            task,
        }
    }
}

impl Drop for HeadSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// eth_getLogs filter: one emitting contract, topic0, and an optional topic1 set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: B256,
    /// Empty means any.
    pub topic1: Vec<B256>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogFilter {
    pub fn new(address: Address, topic0: B256, from_block: u64, to_block: u64) -> Self {
        Self {
            address,
            topic0,
            topic1: Vec::new(),
            from_block,
            to_block,
        }
    }

    pub fn topic1(mut self, topics: impl IntoIterator<Item = B256>) -> Self {
        self.topic1 = topics.into_iter().collect();
        self
    }

    pub fn with_range(&self, from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Value {
        let mut topics = vec![json!(self.topic0)];
        if !self.topic1.is_empty() {
            topics.push(json!(self.topic1));
        }
        json!({
            "address": self.address,
            "topics": topics,
            "fromBlock": format!("0x{:x}", self.from_block),
            "toBlock": format!("0x{:x}", self.to_block),
        })
    }
}

/// Head-following side of the chain client.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn header_by_number(&self, tag: BlockTag) -> Result<BlockHeader>;

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription>;
}

/// Log retrieval and read-only contract calls.
#[async_trait]
pub trait LogProvider: Send + Sync {
    /// One eth_getLogs request; the provider may reject ranges that are too large.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>>;

    async fn call(&self, to: Address, data: Bytes, block: BlockTag) -> Result<Bytes>;
}

#[async_trait]
impl<T: ChainClient + ?Sized> ChainClient for Arc<T> {
    async fn chain_id(&self) -> Result<u64> {
        (**self).chain_id().await
    }

    async fn header_by_number(&self, tag: BlockTag) -> Result<BlockHeader> {
        (**self).header_by_number(tag).await
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription> {
        (**self).subscribe_new_heads().await
    }
}

#[async_trait]
impl<T: LogProvider + ?Sized> LogProvider for Arc<T> {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        (**self).get_logs(filter).await
    }

    async fn call(&self, to: Address, data: Bytes, block: BlockTag) -> Result<Bytes> {
        (**self).call(to, data, block).await
    }
}

/// Provider messages that mean "split the range and ask again".
fn is_range_limit(err: &ReaderError) -> bool {
    let msg = match err {
        ReaderError::Rpc(m) => m.to_ascii_lowercase(),
        _ => return false,
    };
    ["range", "more than", "limit exceeded", "too many"]
        .iter()
        .any(|needle| msg.contains(needle))
}

/// Fetches one window, halving it while the provider rejects it as too large.
async fn fetch_window<P: LogProvider + ?Sized>(provider: &P, filter: LogFilter) -> Result<Vec<Log>> {
    let mut pending = vec![(filter.from_block, filter.to_block)];
    let mut logs = Vec::new();
    while let Some((from, to)) = pending.pop() {
        match provider.get_logs(&filter.with_range(from, to)).await {
            Ok(mut got) => logs.append(&mut got),
            Err(e) if from < to && is_range_limit(&e) => {
                let mid = from + (to - from) / 2;
                tracing::debug!(from, to, mid, reason = %e, "getLogs range rejected, splitting");
                // Pushed in reverse so the lower half is fetched first.
                pending.push((mid + 1, to));
                pending.push((from, mid));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(logs)
}

/// Lazily fetch logs for `filter`, `max_range` blocks per request. The stream ends at the
/// first error.
pub fn fetch_logs<'a, P: LogProvider + ?Sized>(
    provider: &'a P,
    filter: LogFilter,
    max_range: u64,
) -> BoxStream<'a, Result<Log>> {
    let max_range = max_range.max(1);
    let mut windows = Vec::new();
    let mut from = filter.from_block;
    while from <= filter.to_block {
        let to = from.saturating_add(max_range - 1).min(filter.to_block);
        windows.push((from, to));
        if to == u64::MAX {
            break;
        }
        from = to + 1;
    }
    stream::iter(windows)
        .then(move |(from, to)| fetch_window(provider, filter.with_range(from, to)))
        .map_ok(|logs| stream::iter(logs.into_iter().map(Ok::<Log, ReaderError>)))
        .try_flatten()
        .boxed()
}
