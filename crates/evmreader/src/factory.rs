//! Builds the contract adapters of an application from its configured addresses.

use alloy::primitives::Address;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::adapters::{
    ApplicationAdapter, ConsensusAdapter, EvmApplication, EvmConsensus, EvmInputSource,
    InputSourceAdapter,
};
use crate::chain::LogProvider;
use crate::config::RetryPolicy;
use crate::error::{ReaderError, Result};
use crate::model::Application;
use crate::retry::Retrying;

/// The three adapters of one application.
#[derive(Clone)]
pub struct ApplicationAdapters {
    pub application: Arc<dyn ApplicationAdapter>,
    pub input_source: Arc<dyn InputSourceAdapter>,
    pub consensus: Arc<dyn ConsensusAdapter>,
}

/// An enabled application paired with its adapters for one pass.
#[derive(Clone)]
pub struct ApplicationContracts {
    pub application: Application,
    pub adapters: ApplicationAdapters,
}

impl ApplicationContracts {
    pub fn address(&self) -> Address {
        self.application.address
    }
}

/// Decides how the adapters of an application are built.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, app: &Application, cancel: &CancellationToken) -> Result<ApplicationAdapters>;
}

/// Builds EVM adapters over a shared [LogProvider], each wrapped in a [crate::retry::Retrying].
#[derive(Debug, Clone)]
pub struct EvmAdapterFactory<P> {
    provider: P,
    retry: RetryPolicy,
    max_range: u64,
}

impl<P> EvmAdapterFactory<P> {
    pub fn new(provider: P, retry: RetryPolicy, max_range: u64) -> Self {
        Self {
            provider,
            retry,
            max_range,
        }
    }
}

fn require_address(address: Address, role: &str, app: &Application) -> Result<Address> {
    if address.is_zero() {
        return Err(ReaderError::Adapter(format!(
            "application {} has no {role} address",
            app.address
        )));
    }
    Ok(address)
}

impl<P: LogProvider + Clone + 'static> AdapterFactory for EvmAdapterFactory<P> {
    fn create(&self, app: &Application, cancel: &CancellationToken) -> Result<ApplicationAdapters> {
        let application = require_address(app.address, "application", app)?;
        let input_source = require_address(app.input_source_address, "input source", app)?;
        let consensus = require_address(app.consensus_address, "consensus", app)?;
        Ok(ApplicationAdapters {
            application: Arc::new(Retrying::new(
                EvmApplication::new(application, self.provider.clone(), self.max_range),
                self.retry.clone(),
                cancel.clone(),
            )),
            input_source: Arc::new(Retrying::new(
                EvmInputSource::new(input_source, self.provider.clone(), self.max_range),
                self.retry.clone(),
                cancel.clone(),
            )),
            consensus: Arc::new(Retrying::new(
                EvmConsensus::new(consensus, self.provider.clone(), self.max_range),
                self.retry.clone(),
                cancel.clone(),
            )),
        })
    }
}
