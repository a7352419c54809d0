//! Persisted projection of chain state: applications, epochs, inputs and outputs.

use alloy::primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Operational state of an application. Only `Enabled` applications are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationState {
    Enabled,
    Disabled,
    Inoperable,
}

/// A registered rollup application and its per-event scan cursors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    /// Application contract address (identity).
    pub address: Address,
    pub consensus_address: Address,
    pub input_source_address: Address,
    /// Block in which the input source was deployed; nothing before it is scanned.
    pub input_source_deployment_block: u64,
    /// Blocks per epoch. Zero means "ask the consensus contract".
    pub epoch_length: u64,
    pub state: ApplicationState,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub last_input_check_block: u64,
    #[serde(default)]
    pub last_claim_check_block: u64,
    #[serde(default)]
    pub last_output_check_block: u64,
}

/// Event kinds that carry their own "last checked block" cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitoredEvent {
    InputAdded,
    ClaimAccepted,
    OutputExecuted,
}

impl std::fmt::Display for MonitoredEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MonitoredEvent::InputAdded => "InputAdded",
            MonitoredEvent::ClaimAccepted => "ClaimAccepted",
            MonitoredEvent::OutputExecuted => "OutputExecuted",
        };
        f.write_str(name)
    }
}

/// Epoch lifecycle. Declaration order is the only allowed direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EpochStatus {
    Open,
    Closed,
    InputsProcessed,
    ClaimComputed,
    ClaimSubmitted,
    ClaimAccepted,
    ClaimRejected,
}

impl EpochStatus {
    /// Whether `self -> next` keeps the status monotonic.
    pub fn can_move_to(self, next: EpochStatus) -> bool {
        match (self, next) {
            (EpochStatus::ClaimAccepted, EpochStatus::ClaimRejected)
            | (EpochStatus::ClaimRejected, EpochStatus::ClaimAccepted) => false,
            _ => next >= self,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub application: Address,
    pub index: u64,
    pub first_block: u64,
    pub last_block: u64,
    pub status: EpochStatus,
    pub claim_hash: Option<B256>,
    pub claim_transaction_hash: Option<B256>,
}

impl Epoch {
    /// A fresh open epoch covering `index * length ..= index * length + length - 1`.
    pub fn open(application: Address, index: u64, epoch_length: u64) -> Self {
        let (first_block, last_block) = epoch_bounds(index, epoch_length);
        Self {
            application,
            index,
            first_block,
            last_block,
            status: EpochStatus::Open,
            claim_hash: None,
            claim_transaction_hash: None,
        }
    }
}

/// Epoch index that contains `block`.
pub fn epoch_index(block: u64, epoch_length: u64) -> u64 {
    block / epoch_length
}

/// First and last block of epoch `index`.
pub fn epoch_bounds(index: u64, epoch_length: u64) -> (u64, u64) {
    let first = index.saturating_mul(epoch_length);
    (first, first.saturating_add(epoch_length - 1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputCompletionStatus {
    None,
    Accepted,
    Rejected,
    Exception,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub application: Address,
    pub index: u64,
    pub epoch_index: u64,
    pub raw_data: Bytes,
    pub block_number: u64,
    pub status: InputCompletionStatus,
    /// Content hash of the originating event; stable lookup key.
    pub transaction_reference: B256,
}

/// Keccak-256 of `(application, index, payload)`, identifying one InputAdded event.
pub fn input_reference(application: &Address, index: u64, payload: &[u8]) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(application.as_slice());
    hasher.update([0u8; 24]);
    hasher.update(index.to_be_bytes());
    hasher.update(payload);
    B256::from_slice(&hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub application: Address,
    pub input_index: u64,
    /// Application-wide output index, as emitted by OutputExecuted.
    pub index: u64,
    pub raw_data: Bytes,
    pub hash: Option<B256>,
    pub execution_transaction_hash: Option<B256>,
}

/// An epoch about to be written together with the inputs it newly receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochInputs {
    pub epoch: Epoch,
    pub inputs: Vec<Input>,
}
