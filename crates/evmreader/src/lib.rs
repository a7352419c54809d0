//! Off-chain rollup reader: follows chain heads and keeps a local projection of
//! application state (epochs, inputs, outputs) in step with the rollup contracts.
//!
//! - **EvmReader**: block watcher. Subscribes to new heads, resolves the default-block
//!   policy and runs one pass per header: inputs, then claims, then outputs.
//! - **Input indexer** ([inputs]): assigns InputAdded events to epochs and closes epochs
//!   as the chain moves past them.
//! - **Claim reconciler** ([claims]): moves submitted epochs to ClaimAccepted when the
//!   consensus contract accepts a matching claim.
//! - **Output reconciler** ([outputs]): records execution transactions of stored outputs.
//!
//! Chain access goes through [ChainClient] / [LogProvider]; every remote call is wrapped
//! in a [Retrying] delegator. State lives behind the [Repository] trait.

pub mod abi;
pub mod adapters;
pub mod chain;
pub mod claims;
pub mod config;
pub mod cursor;
pub mod error;
pub mod factory;
pub mod inputs;
pub mod model;
pub mod outputs;
pub mod reader;
pub mod repository;
pub mod retry;
pub mod rpc;

pub use abi::{ClaimAcceptedObserved, InputAddedObserved, LogMeta, OutputExecutedObserved};
pub use adapters::{
    ApplicationAdapter, ConsensusAdapter, EvmApplication, EvmConsensus, EvmInputSource,
    InputSourceAdapter,
};
pub use chain::{fetch_logs, BlockHeader, BlockTag, ChainClient, HeadSubscription, LogFilter, LogProvider};
pub use config::{DefaultBlock, ReaderConfig, ReconnectionConfig, RetryPolicy};
pub use cursor::Cursor;
pub use error::{ReaderError, RepositoryError, Result};
pub use factory::{AdapterFactory, ApplicationAdapters, ApplicationContracts, EvmAdapterFactory};
pub use model::{
    Application, ApplicationState, Epoch, EpochInputs, EpochStatus, Input,
    InputCompletionStatus, MonitoredEvent, Output,
};
pub use reader::EvmReader;
pub use repository::{InMemoryRepository, Repository};
pub use retry::{call_with_retry, Retrying};
pub use rpc::JsonRpcClient;
