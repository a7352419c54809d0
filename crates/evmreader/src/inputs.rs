//! Input indexer: assigns InputAdded events to epochs and closes epochs at boundaries.

use alloy::primitives::Address;
use std::collections::BTreeMap;

use crate::abi::InputAddedObserved;
use crate::cursor::{group_by, Cursor, ScanRange};
use crate::error::{ReaderError, Result};
use crate::factory::ApplicationContracts;
use crate::model::{
    epoch_bounds, epoch_index, input_reference, Application, ApplicationState, Epoch,
    EpochInputs, EpochStatus, Input, InputCompletionStatus, MonitoredEvent,
};
use crate::repository::Repository;

/// Fill in epoch lengths the application record leaves at zero by asking the consensus
/// contract. An application whose consensus also reports zero is marked inoperable and dropped.
pub async fn resolve_epoch_lengths<R: Repository + ?Sized>(
    repository: &R,
    contracts: Vec<ApplicationContracts>,
) -> Result<Vec<ApplicationContracts>> {
    let mut resolved = Vec::with_capacity(contracts.len());
    for mut contract in contracts {
        if contract.application.epoch_length == 0 {
            let address = contract.address();
            match contract.adapters.consensus.epoch_length().await {
                Ok(0) => {
                    let reason = "consensus contract reports an epoch length of zero".to_string();
                    tracing::error!(application = %address, %reason, "marking application inoperable");
                    if let Err(e) = repository
                        .update_application_state(address, ApplicationState::Inoperable, Some(reason))
                        .await
                    {
                        tracing::error!(application = %address, reason = %e, "failed to update application state");
                    }
                    continue;
                }
                Ok(length) => {
                    tracing::debug!(application = %address, epoch_length = length, "epoch length read from consensus");
                    contract.application.epoch_length = length;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(application = %address, reason = %e, "epoch length unavailable, skipping application");
                    continue;
                }
            }
        }
        resolved.push(contract);
    }
    Ok(resolved)
}

/// Index new inputs of every application up to `most_recent`.
///
/// Applications sharing a cursor and an input source share one log fetch. Only
/// cancellation is returned as an error; everything else is logged per application.
pub async fn check_for_new_inputs<R: Repository + ?Sized>(
    repository: &R,
    contracts: &[ApplicationContracts],
    most_recent: u64,
) -> Result<()> {
    let by_cursor = group_by(contracts, |c| {
        Cursor::of(&c.application, MonitoredEvent::InputAdded)
    });

    for (cursor, group) in by_cursor {
        let (from, to) = match cursor.range_to(most_recent) {
            ScanRange::Ahead => {
                tracing::warn!(
                    last_processed = cursor.last_processed_block,
                    most_recent,
                    applications = group.len(),
                    "input cursor ahead of most recent block, skipping"
                );
                continue;
            }
            ScanRange::UpToDate => {
                tracing::info!(most_recent, applications = group.len(), "inputs up to date");
                continue;
            }
            ScanRange::Pending { from, to } => (from, to),
        };

        for (input_source, members) in group_by(group, |c| c.application.input_source_address) {
            let addresses: Vec<Address> = members.iter().map(|c| c.address()).collect();
            tracing::debug!(%input_source, from, to, applications = addresses.len(), "fetching inputs");

            // Every member shares this input source; any of their adapters reads it.
            let adapter = &members[0].adapters.input_source;
            let events = match adapter.retrieve_inputs(from, to, &addresses).await {
                Ok(events) => events,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::error!(%input_source, from, to, reason = %e, "failed to read inputs");
                    continue;
                }
            };

            let mut per_app = sort_by_application(events);
            for contract in members {
                let inputs = per_app.remove(&contract.address()).unwrap_or_default();
                match index_application(repository, &contract.application, inputs, from, to).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        tracing::error!(
                            application = %contract.address(),
                            from,
                            to,
                            reason = %e,
                            "failed to index inputs"
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// Split events per application, each sequence sorted by input index with duplicates dropped.
fn sort_by_application(events: Vec<InputAddedObserved>) -> BTreeMap<Address, Vec<InputAddedObserved>> {
    let mut per_app: BTreeMap<Address, Vec<InputAddedObserved>> = BTreeMap::new();
    for event in events {
        let seq = per_app.entry(event.application).or_default();
        match seq.binary_search_by_key(&event.index, |e| e.index) {
            Ok(_) => {
                tracing::debug!(application = %event.application, index = event.index, "duplicate input dropped");
            }
            Err(pos) => seq.insert(pos, event),
        }
    }
    per_app
}

/// Build and persist the epochs touched by `from..=to` for one application.
///
/// An epoch closes once its last block has been scanned, with or without inputs. An
/// epoch still open at `to` is written only when it gains inputs.
async fn index_application<R: Repository + ?Sized>(
    repository: &R,
    app: &Application,
    inputs: Vec<InputAddedObserved>,
    from: u64,
    to: u64,
) -> Result<()> {
    let length = app.epoch_length;
    if length == 0 {
        return Err(ReaderError::Adapter(format!(
            "application {} has no epoch length",
            app.address
        )));
    }
    let mut first_index = epoch_index(from, length);
    let scanned = from.saturating_sub(1);
    if scanned >= app.input_source_deployment_block {
        let held = epoch_index(scanned, length);
        if held < first_index {
            // The cursor sits on the last block of `held`; pick it up unless it was closed.
            match repository.get_epoch(app.address, held).await? {
                Some(epoch) if epoch.status != EpochStatus::Open => {}
                _ => first_index = held,
            }
        }
    }
    let last_index = epoch_index(to, length);

    let open = repository.get_epoch(app.address, first_index).await?;
    if let Some(epoch) = &open {
        if epoch.status != EpochStatus::Open {
            tracing::error!(
                application = %app.address,
                epoch_index = epoch.index,
                status = ?epoch.status,
                "epoch at the input cursor is no longer open, skipping application"
            );
            return Ok(());
        }
    }

    let mut by_epoch: BTreeMap<u64, Vec<Input>> = BTreeMap::new();
    for event in inputs {
        let block = event.meta.block_number;
        if block < from || block > to {
            tracing::error!(
                application = %app.address,
                index = event.index,
                block,
                from,
                to,
                "input outside the scanned range, skipping application"
            );
            return Ok(());
        }
        let index = epoch_index(block, length);
        tracing::debug!(application = %app.address, index = event.index, epoch_index = index, block, "input found");
        by_epoch.entry(index).or_default().push(Input {
            application: app.address,
            index: event.index,
            epoch_index: index,
            transaction_reference: input_reference(&app.address, event.index, &event.input),
            raw_data: event.input,
            block_number: block,
            status: InputCompletionStatus::None,
        });
    }

    let mut units = Vec::new();
    let mut open = open;
    for index in first_index..=last_index {
        let inputs = by_epoch.remove(&index).unwrap_or_default();
        let mut epoch = match open.take() {
            Some(existing) if existing.index == index => existing,
            _ => Epoch::open(app.address, index, length),
        };
        let (_, last_block) = epoch_bounds(index, length);
        if last_block <= to {
            epoch.status = EpochStatus::Closed;
            tracing::info!(
                application = %app.address,
                epoch_index = index,
                inputs = inputs.len(),
                "epoch closed"
            );
        } else if inputs.is_empty() {
            continue;
        }
        units.push(EpochInputs { epoch, inputs });
    }

    repository
        .create_epochs_and_inputs(app.address, units, to)
        .await?;
    Ok(())
}
