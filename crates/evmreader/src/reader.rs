//! Block watcher: follows chain heads and runs one indexing pass per header.

use alloy::primitives::B256;
use rand::Rng;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::chain::{BlockHeader, ChainClient, HeadSubscription};
use crate::config::{DefaultBlock, ReaderConfig};
use crate::error::{ReaderError, Result};
use crate::factory::{AdapterFactory, ApplicationContracts};
use crate::repository::Repository;
use crate::{claims, inputs, outputs};

/// Watches new heads and reconciles every enabled application against the chain.
///
/// Headers are processed one at a time; nothing here runs concurrently with a pass.
pub struct EvmReader<C, R, F> {
    client: C,
    repository: R,
    factory: F,
    config: ReaderConfig,
    had_apps: bool,
    last_header: Option<B256>,
}

impl<C, R, F> EvmReader<C, R, F>
where
    C: ChainClient,
    R: Repository,
    F: AdapterFactory,
{
    pub fn new(client: C, repository: R, factory: F, config: ReaderConfig) -> Self {
        Self {
            client,
            repository,
            factory,
            config,
            had_apps: true,
            last_header: None,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Fails with [ReaderError::ChainIdMismatch] when the endpoint serves another chain.
    pub async fn ensure_chain_id(&self) -> Result<()> {
        let actual = self.client.chain_id().await?;
        if actual != self.config.chain_id {
            return Err(ReaderError::ChainIdMismatch {
                expected: self.config.chain_id,
                actual,
            });
        }
        tracing::info!(chain_id = actual, "connected to chain");
        Ok(())
    }

    /// Run until `cancel` fires, which is reported as `Err(ReaderError::Cancelled)`.
    ///
    /// `ready` is signalled once, after the first successful subscription. A dropped
    /// subscription is reopened; failed subscription attempts back off exponentially.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        mut ready: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let reconnection = self.config.reconnection.clone();
        let initial = Duration::from_secs(reconnection.initial_backoff_secs);
        let max = Duration::from_secs(reconnection.max_backoff_secs);
        let mut backoff = initial;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
                sub = self.client.subscribe_new_heads() => sub,
            };
            let mut subscription = match subscribed {
                Ok(sub) => sub,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    tracing::warn!(reason = %e, backoff_secs = backoff.as_secs(), "subscribe failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
                        _ = sleep(backoff + jitter) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, max);
                    continue;
                }
            };
            backoff = initial;
            tracing::info!("subscribed to new heads");
            if let Some(ready) = ready.take() {
                let _ = ready.send(());
            }

            match self.watch(&mut subscription, cancel).await {
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::warn!(reason = %e, "head subscription lost, resubscribing"),
                Ok(()) => tracing::warn!("head subscription ended, resubscribing"),
            }
        }
    }

    /// Consume one subscription until it fails or `cancel` fires.
    async fn watch(
        &mut self,
        subscription: &mut HeadSubscription,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let header = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
                header = subscription.headers.recv() => header,
                failure = &mut subscription.errors => {
                    return Err(failure.unwrap_or_else(|_| {
                        ReaderError::Subscription("subscription closed".into())
                    }));
                }
            };
            let Some(header) = header else {
                return Err(subscription
                    .errors
                    .try_recv()
                    .unwrap_or_else(|_| ReaderError::Subscription("header stream ended".into())));
            };

            if header.hash.is_some() && self.last_header == header.hash {
                tracing::debug!(block = header.number, "header already processed, skipping");
                continue;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ReaderError::Cancelled),
                r = self.process_block(&header, cancel) => r,
            };
            match result {
                Ok(()) => self.last_header = header.hash,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::error!(block = header.number, reason = %e, "failed to process block");
                }
            }
        }
    }

    /// One pass: inputs, then claims, then outputs, up to the block the policy selects.
    pub async fn process_block(
        &mut self,
        header: &BlockHeader,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let apps = self.repository.list_enabled_applications().await?;
        if apps.is_empty() {
            if self.had_apps {
                tracing::info!("no enabled applications, waiting");
            }
            self.had_apps = false;
            return Ok(());
        }
        if !self.had_apps {
            tracing::info!(count = apps.len(), "enabled applications found");
        }
        self.had_apps = true;

        let most_recent = match self.config.default_block {
            DefaultBlock::Latest => header.number,
            policy => self.client.header_by_number(policy.into()).await?.number,
        };
        tracing::debug!(block = header.number, most_recent, policy = %self.config.default_block, "processing block");

        let mut contracts = Vec::with_capacity(apps.len());
        for app in apps {
            match self.factory.create(&app, cancel) {
                Ok(adapters) => contracts.push(ApplicationContracts {
                    application: app,
                    adapters,
                }),
                Err(e) => {
                    tracing::error!(application = %app.address, reason = %e, "skipping application, adapters unavailable");
                }
            }
        }

        let contracts = inputs::resolve_epoch_lengths(&self.repository, contracts).await?;
        inputs::check_for_new_inputs(&self.repository, &contracts, most_recent).await?;
        claims::check_for_claim_status(&self.repository, &contracts, most_recent).await?;
        outputs::check_for_output_execution(&self.repository, &contracts, most_recent).await?;
        Ok(())
    }
}
