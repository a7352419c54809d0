//! Persistence seam for the reader, plus an in-memory store.
//!
//! Every write method is one atomic unit: either the whole change set (epochs, inputs,
//! outputs and the advanced cursor) is applied, or nothing is.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::RepositoryError;
use crate::model::{
    Application, ApplicationState, Epoch, EpochInputs, EpochStatus, Input, MonitoredEvent, Output,
};

pub type RepoResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_enabled_applications(&self) -> RepoResult<Vec<Application>>;

    /// Upsert `epochs` (with the inputs each newly receives) and advance the input cursor.
    async fn create_epochs_and_inputs(
        &self,
        application: Address,
        epochs: Vec<EpochInputs>,
        last_input_check_block: u64,
    ) -> RepoResult<()>;

    async fn get_epoch(&self, application: Address, index: u64) -> RepoResult<Option<Epoch>>;

    /// Epochs in `status` whose last block is strictly below `before_block`.
    async fn list_epochs_by_status(
        &self,
        application: Address,
        status: EpochStatus,
        before_block: u64,
    ) -> RepoResult<Vec<Epoch>>;

    /// Move `epochs` to ClaimAccepted and advance the claim cursor.
    async fn update_epochs_claim_accepted(
        &self,
        application: Address,
        epochs: &[Epoch],
        last_claim_check_block: u64,
    ) -> RepoResult<()>;

    async fn get_output(&self, application: Address, index: u64) -> RepoResult<Option<Output>>;

    /// Record execution transaction hashes and advance the output cursor.
    async fn update_outputs_execution(
        &self,
        application: Address,
        outputs: &[Output],
        last_output_check_block: u64,
    ) -> RepoResult<()>;

    /// Advance one cursor for several applications without other changes.
    async fn update_event_last_check_block(
        &self,
        applications: &[Address],
        event: MonitoredEvent,
        block: u64,
    ) -> RepoResult<()>;

    async fn update_application_state(
        &self,
        application: Address,
        state: ApplicationState,
        reason: Option<String>,
    ) -> RepoResult<()>;
}

#[async_trait]
impl<T: Repository + ?Sized> Repository for Arc<T> {
    async fn list_enabled_applications(&self) -> RepoResult<Vec<Application>> {
        (**self).list_enabled_applications().await
    }

    async fn create_epochs_and_inputs(
        &self,
        application: Address,
        epochs: Vec<EpochInputs>,
        last_input_check_block: u64,
    ) -> RepoResult<()> {
        (**self)
            .create_epochs_and_inputs(application, epochs, last_input_check_block)
            .await
    }

    async fn get_epoch(&self, application: Address, index: u64) -> RepoResult<Option<Epoch>> {
        (**self).get_epoch(application, index).await
    }

    async fn list_epochs_by_status(
        &self,
        application: Address,
        status: EpochStatus,
        before_block: u64,
    ) -> RepoResult<Vec<Epoch>> {
        (**self)
            .list_epochs_by_status(application, status, before_block)
            .await
    }

    async fn update_epochs_claim_accepted(
        &self,
        application: Address,
        epochs: &[Epoch],
        last_claim_check_block: u64,
    ) -> RepoResult<()> {
        (**self)
            .update_epochs_claim_accepted(application, epochs, last_claim_check_block)
            .await
    }

    async fn get_output(&self, application: Address, index: u64) -> RepoResult<Option<Output>> {
        (**self).get_output(application, index).await
    }

    async fn update_outputs_execution(
        &self,
        application: Address,
        outputs: &[Output],
        last_output_check_block: u64,
    ) -> RepoResult<()> {
        (**self)
            .update_outputs_execution(application, outputs, last_output_check_block)
            .await
    }

    async fn update_event_last_check_block(
        &self,
        applications: &[Address],
        event: MonitoredEvent,
        block: u64,
    ) -> RepoResult<()> {
        (**self)
            .update_event_last_check_block(applications, event, block)
            .await
    }

    async fn update_application_state(
        &self,
        application: Address,
        state: ApplicationState,
        reason: Option<String>,
    ) -> RepoResult<()> {
        (**self)
            .update_application_state(application, state, reason)
            .await
    }
}

#[derive(Debug)]
struct AppRecord {
    application: Application,
    epochs: BTreeMap<u64, Epoch>,
    inputs: BTreeMap<u64, Input>,
    outputs: BTreeMap<u64, Output>,
}

impl AppRecord {
    fn advance(&mut self, event: MonitoredEvent, block: u64) {
        let cursor = match event {
            MonitoredEvent::InputAdded => &mut self.application.last_input_check_block,
            MonitoredEvent::ClaimAccepted => &mut self.application.last_claim_check_block,
            MonitoredEvent::OutputExecuted => &mut self.application.last_output_check_block,
        };
        *cursor = (*cursor).max(block);
    }
}

/// In-memory repository. Also the seam the external pipeline stages (machine,
/// validator, claimer) use in tests to move epochs and add outputs.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    apps: RwLock<HashMap<Address, AppRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_application(&self, application: Application) {
        let mut apps = self.apps.write().await;
        apps.insert(
            application.address,
            AppRecord {
                application,
                epochs: BTreeMap::new(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
            },
        );
    }

    pub async fn application(&self, address: Address) -> Option<Application> {
        self.apps
            .read()
            .await
            .get(&address)
            .map(|r| r.application.clone())
    }

    pub async fn epochs(&self, address: Address) -> Vec<Epoch> {
        self.apps
            .read()
            .await
            .get(&address)
            .map(|r| r.epochs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn inputs(&self, address: Address) -> Vec<Input> {
        self.apps
            .read()
            .await
            .get(&address)
            .map(|r| r.inputs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Advance an epoch's status and optionally set its claim, as the downstream stages do.
    pub async fn set_epoch_status(
        &self,
        address: Address,
        index: u64,
        status: EpochStatus,
        claim_hash: Option<B256>,
    ) -> RepoResult<()> {
        let mut apps = self.apps.write().await;
        let record = apps
            .get_mut(&address)
            .ok_or(RepositoryError::ApplicationNotFound(address))?;
        let epoch = record
            .epochs
            .get_mut(&index)
            .ok_or_else(|| RepositoryError::Conflict(format!("epoch {index} not found")))?;
        if !epoch.status.can_move_to(status) {
            return Err(RepositoryError::InvalidTransition {
                application: address,
                index,
                from: epoch.status,
                to: status,
            });
        }
        epoch.status = status;
        if claim_hash.is_some() {
            epoch.claim_hash = claim_hash;
        }
        Ok(())
    }

    pub async fn insert_outputs(&self, address: Address, outputs: Vec<Output>) -> RepoResult<()> {
        let mut apps = self.apps.write().await;
        let record = apps
            .get_mut(&address)
            .ok_or(RepositoryError::ApplicationNotFound(address))?;
        for output in outputs {
            record.outputs.insert(output.index, output);
        }
        Ok(())
    }

    pub async fn outputs(&self, address: Address) -> Vec<Output> {
        self.apps
            .read()
            .await
            .get(&address)
            .map(|r| r.outputs.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn check_transition(
    application: Address,
    current: Option<&Epoch>,
    next: &Epoch,
) -> RepoResult<()> {
    match current {
        Some(existing) if !existing.status.can_move_to(next.status) => {
            Err(RepositoryError::InvalidTransition {
                application,
                index: next.index,
                from: existing.status,
                to: next.status,
            })
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn list_enabled_applications(&self) -> RepoResult<Vec<Application>> {
        let apps = self.apps.read().await;
        let mut enabled: Vec<Application> = apps
            .values()
            .filter(|r| r.application.state == ApplicationState::Enabled)
            .map(|r| r.application.clone())
            .collect();
        enabled.sort_by_key(|a| a.address);
        Ok(enabled)
    }

    async fn create_epochs_and_inputs(
        &self,
        application: Address,
        epochs: Vec<EpochInputs>,
        last_input_check_block: u64,
    ) -> RepoResult<()> {
        let mut apps = self.apps.write().await;
        let record = apps
            .get_mut(&application)
            .ok_or(RepositoryError::ApplicationNotFound(application))?;

        // Validate the whole unit before touching anything.
        let mut seen = HashSet::new();
        for unit in &epochs {
            check_transition(application, record.epochs.get(&unit.epoch.index), &unit.epoch)?;
            for input in &unit.inputs {
                if record.inputs.contains_key(&input.index) || !seen.insert(input.index) {
                    return Err(RepositoryError::Conflict(format!(
                        "input {} of {application} already stored",
                        input.index
                    )));
                }
                if input.epoch_index != unit.epoch.index {
                    return Err(RepositoryError::Conflict(format!(
                        "input {} belongs to epoch {}, not {}",
                        input.index, input.epoch_index, unit.epoch.index
                    )));
                }
            }
        }

        for unit in epochs {
            for input in unit.inputs {
                record.inputs.insert(input.index, input);
            }
            record.epochs.insert(unit.epoch.index, unit.epoch);
        }
        record.advance(MonitoredEvent::InputAdded, last_input_check_block);
        Ok(())
    }

    async fn get_epoch(&self, application: Address, index: u64) -> RepoResult<Option<Epoch>> {
        let apps = self.apps.read().await;
        let record = apps
            .get(&application)
            .ok_or(RepositoryError::ApplicationNotFound(application))?;
        Ok(record.epochs.get(&index).cloned())
    }

    async fn list_epochs_by_status(
        &self,
        application: Address,
        status: EpochStatus,
        before_block: u64,
    ) -> RepoResult<Vec<Epoch>> {
        let apps = self.apps.read().await;
        let record = apps
            .get(&application)
            .ok_or(RepositoryError::ApplicationNotFound(application))?;
        Ok(record
            .epochs
            .values()
            .filter(|e| e.status == status && e.last_block < before_block)
            .cloned()
            .collect())
    }

    async fn update_epochs_claim_accepted(
        &self,
        application: Address,
        epochs: &[Epoch],
        last_claim_check_block: u64,
    ) -> RepoResult<()> {
        let mut apps = self.apps.write().await;
        let record = apps
            .get_mut(&application)
            .ok_or(RepositoryError::ApplicationNotFound(application))?;
        for epoch in epochs {
            let stored = record.epochs.get(&epoch.index).ok_or_else(|| {
                RepositoryError::Conflict(format!("epoch {} of {application} not found", epoch.index))
            })?;
            if stored.status != EpochStatus::ClaimSubmitted {
                return Err(RepositoryError::InvalidTransition {
                    application,
                    index: epoch.index,
                    from: stored.status,
                    to: EpochStatus::ClaimAccepted,
                });
            }
        }
        for epoch in epochs {
            if let Some(stored) = record.epochs.get_mut(&epoch.index) {
                stored.status = EpochStatus::ClaimAccepted;
            }
        }
        record.advance(MonitoredEvent::ClaimAccepted, last_claim_check_block);
        Ok(())
    }

    async fn get_output(&self, application: Address, index: u64) -> RepoResult<Option<Output>> {
        let apps = self.apps.read().await;
        let record = apps
            .get(&application)
            .ok_or(RepositoryError::ApplicationNotFound(application))?;
        Ok(record.outputs.get(&index).cloned())
    }

    async fn update_outputs_execution(
        &self,
        application: Address,
        outputs: &[Output],
        last_output_check_block: u64,
    ) -> RepoResult<()> {
        let mut apps = self.apps.write().await;
        let record = apps
            .get_mut(&application)
            .ok_or(RepositoryError::ApplicationNotFound(application))?;
        if let Some(missing) = outputs.iter().find(|o| !record.outputs.contains_key(&o.index)) {
            return Err(RepositoryError::Conflict(format!(
                "output {} of {application} not found",
                missing.index
            )));
        }
        for output in outputs {
            if let Some(stored) = record.outputs.get_mut(&output.index) {
                stored.execution_transaction_hash = output.execution_transaction_hash;
            }
        }
        record.advance(MonitoredEvent::OutputExecuted, last_output_check_block);
        Ok(())
    }

    async fn update_event_last_check_block(
        &self,
        applications: &[Address],
        event: MonitoredEvent,
        block: u64,
    ) -> RepoResult<()> {
        let mut apps = self.apps.write().await;
        if let Some(missing) = applications.iter().find(|a| !apps.contains_key(*a)) {
            return Err(RepositoryError::ApplicationNotFound(*missing));
        }
        for address in applications {
            if let Some(record) = apps.get_mut(address) {
                record.advance(event, block);
            }
        }
        Ok(())
    }

    async fn update_application_state(
        &self,
        application: Address,
        state: ApplicationState,
        reason: Option<String>,
    ) -> RepoResult<()> {
        let mut apps = self.apps.write().await;
        let record = apps
            .get_mut(&application)
            .ok_or(RepositoryError::ApplicationNotFound(application))?;
        record.application.state = state;
        record.application.reason = reason;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Epoch, InputCompletionStatus};
    use alloy::primitives::Bytes;

    fn app() -> Application {
        Application {
            name: "app".into(),
            address: Address::repeat_byte(1),
            consensus_address: Address::repeat_byte(2),
            input_source_address: Address::repeat_byte(3),
            input_source_deployment_block: 0,
            epoch_length: 10,
            state: ApplicationState::Enabled,
            reason: None,
            last_input_check_block: 0,
            last_claim_check_block: 0,
            last_output_check_block: 0,
        }
    }

    fn input(index: u64, epoch_index: u64) -> Input {
        Input {
            application: app().address,
            index,
            epoch_index,
            raw_data: Bytes::from_static(b"x"),
            block_number: epoch_index * 10,
            status: InputCompletionStatus::None,
            transaction_reference: B256::ZERO,
        }
    }

    #[tokio::test]
    async fn duplicate_input_rolls_back_whole_unit() {
        let repo = InMemoryRepository::new();
        repo.insert_application(app()).await;
        let a = app().address;
        let first = EpochInputs {
            epoch: Epoch::open(a, 0, 10),
            inputs: vec![input(0, 0)],
        };
        repo.create_epochs_and_inputs(a, vec![first], 5).await.unwrap();

        let dup = EpochInputs {
            epoch: Epoch::open(a, 1, 10),
            inputs: vec![input(0, 1)],
        };
        let res = repo.create_epochs_and_inputs(a, vec![dup], 15).await;
        assert!(matches!(res, Err(RepositoryError::Conflict(_))));
        assert_eq!(repo.epochs(a).await.len(), 1);
        assert_eq!(repo.application(a).await.unwrap().last_input_check_block, 5);
    }

    #[tokio::test]
    async fn cursors_never_move_backwards() {
        let repo = InMemoryRepository::new();
        repo.insert_application(app()).await;
        let a = app().address;
        repo.update_event_last_check_block(&[a], MonitoredEvent::OutputExecuted, 20)
            .await
            .unwrap();
        repo.update_event_last_check_block(&[a], MonitoredEvent::OutputExecuted, 10)
            .await
            .unwrap();
        assert_eq!(repo.application(a).await.unwrap().last_output_check_block, 20);
    }

    #[tokio::test]
    async fn closed_epoch_cannot_reopen() {
        let repo = InMemoryRepository::new();
        repo.insert_application(app()).await;
        let a = app().address;
        let mut closed = Epoch::open(a, 0, 10);
        closed.status = EpochStatus::Closed;
        repo.create_epochs_and_inputs(
            a,
            vec![EpochInputs {
                epoch: closed,
                inputs: vec![],
            }],
            9,
        )
        .await
        .unwrap();
        let reopen = EpochInputs {
            epoch: Epoch::open(a, 0, 10),
            inputs: vec![],
        };
        let res = repo.create_epochs_and_inputs(a, vec![reopen], 12).await;
        assert!(matches!(res, Err(RepositoryError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn disabled_applications_are_not_listed() {
        let repo = InMemoryRepository::new();
        repo.insert_application(app()).await;
        repo.update_application_state(app().address, ApplicationState::Inoperable, Some("bad".into()))
            .await
            .unwrap();
        assert!(repo.list_enabled_applications().await.unwrap().is_empty());
        let stored = repo.application(app().address).await.unwrap();
        assert_eq!(stored.reason.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn claim_acceptance_requires_submitted_epoch() {
        let repo = InMemoryRepository::new();
        repo.insert_application(app()).await;
        let a = app().address;
        let mut epoch = Epoch::open(a, 0, 10);
        epoch.status = EpochStatus::Closed;
        repo.create_epochs_and_inputs(
            a,
            vec![EpochInputs {
                epoch: epoch.clone(),
                inputs: vec![],
            }],
            9,
        )
        .await
        .unwrap();
        let res = repo.update_epochs_claim_accepted(a, &[epoch], 20).await;
        assert!(matches!(res, Err(RepositoryError::InvalidTransition { .. })));

        repo.set_epoch_status(a, 0, EpochStatus::ClaimSubmitted, Some(B256::repeat_byte(7)))
            .await
            .unwrap();
        let epoch = repo.get_epoch(a, 0).await.unwrap().unwrap();
        repo.update_epochs_claim_accepted(a, &[epoch], 20).await.unwrap();
        assert_eq!(
            repo.get_epoch(a, 0).await.unwrap().unwrap().status,
            EpochStatus::ClaimAccepted
        );
        assert_eq!(repo.application(a).await.unwrap().last_claim_check_block, 20);
    }
}
