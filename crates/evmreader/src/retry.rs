//! Retry delegator: bounded, constant-delay retry around single remote calls.
//!
//! [call_with_retry] wraps one call; [Retrying] decorates every capability trait
//! (chain client, contract adapters) so each of their methods goes through it.

use alloy::primitives::Address;
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::abi::{ClaimAcceptedObserved, InputAddedObserved, OutputExecutedObserved};
use crate::adapters::{ApplicationAdapter, ConsensusAdapter, InputSourceAdapter};
use crate::chain::{BlockHeader, BlockTag, ChainClient, HeadSubscription};
use crate::config::RetryPolicy;
use crate::error::{ReaderError, Result};

/// Invoke `call`; on failure retry up to `policy.max_retries` more times with a fixed delay.
/// Returns the last error once attempts are exhausted, or `Cancelled` as soon as `cancel` fires.
pub async fn call_with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
            r = call() => r,
        };
        let err = match result {
            Ok(v) => {
                if attempt > 0 {
                    tracing::debug!(operation, attempt, "call succeeded after retries");
                }
                return Ok(v);
            }
            Err(ReaderError::Cancelled) => return Err(ReaderError::Cancelled),
            Err(e) => e,
        };
        if attempt >= policy.max_retries {
            tracing::error!(operation, attempts = attempt + 1, reason = %err, "call failed, giving up");
            return Err(err);
        }
        attempt += 1;
        tracing::warn!(
            operation,
            attempt,
            max_retries = policy.max_retries,
            reason = %err,
            "call failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
            _ = tokio::time::sleep(policy.delay()) => {}
        }
    }
}

/// Decorator that routes every call of the wrapped capability through [call_with_retry].
#[derive(Debug, Clone)]
pub struct Retrying<T> {
    inner: T,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<T> Retrying<T> {
    pub fn new(inner: T, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            cancel,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<C: ChainClient> ChainClient for Retrying<C> {
    async fn chain_id(&self) -> Result<u64> {
        call_with_retry("chain_id", &self.policy, &self.cancel, || self.inner.chain_id()).await
    }

    async fn header_by_number(&self, tag: BlockTag) -> Result<BlockHeader> {
        call_with_retry("header_by_number", &self.policy, &self.cancel, || {
            self.inner.header_by_number(tag)
        })
        .await
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription> {
        call_with_retry("subscribe_new_heads", &self.policy, &self.cancel, || {
            self.inner.subscribe_new_heads()
        })
        .await
    }
}

#[async_trait]
impl<A: ApplicationAdapter> ApplicationAdapter for Retrying<A> {
    async fn retrieve_output_executions(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<OutputExecutedObserved>> {
        call_with_retry("retrieve_output_executions", &self.policy, &self.cancel, || {
            self.inner.retrieve_output_executions(from_block, to_block)
        })
        .await
    }
}

#[async_trait]
impl<I: InputSourceAdapter> InputSourceAdapter for Retrying<I> {
    async fn retrieve_inputs(
        &self,
        from_block: u64,
        to_block: u64,
        applications: &[Address],
    ) -> Result<Vec<InputAddedObserved>> {
        call_with_retry("retrieve_inputs", &self.policy, &self.cancel, || {
            self.inner.retrieve_inputs(from_block, to_block, applications)
        })
        .await
    }
}

#[async_trait]
impl<C: ConsensusAdapter> ConsensusAdapter for Retrying<C> {
    async fn retrieve_claim_accepted(
        &self,
        from_block: u64,
        to_block: u64,
        applications: &[Address],
    ) -> Result<Vec<ClaimAcceptedObserved>> {
        call_with_retry("retrieve_claim_accepted", &self.policy, &self.cancel, || {
            self.inner.retrieve_claim_accepted(from_block, to_block, applications)
        })
        .await
    }

    async fn epoch_length(&self) -> Result<u64> {
        call_with_retry("epoch_length", &self.policy, &self.cancel, || {
            self.inner.epoch_length()
        })
        .await
    }
}
