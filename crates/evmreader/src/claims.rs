//! Claim reconciler: matches ClaimAccepted events against locally computed epochs.
//!
//! Assumes a single-signer (authority) consensus: a submitted claim is either accepted
//! or still pending. ClaimRejected is never produced here.

use alloy::primitives::Address;

use crate::abi::ClaimAcceptedObserved;
use crate::cursor::{group_by, Cursor, ScanRange};
use crate::error::{ReaderError, Result};
use crate::factory::ApplicationContracts;
use crate::model::{epoch_index, Application, Epoch, EpochStatus, MonitoredEvent};
use crate::repository::Repository;

/// What reconciling one application's claim events left to do with its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Nothing written; the cursor may move to the upper bound.
    Advance,
    /// Epochs (and the cursor) already written, or the cursor must stay.
    Done,
}

/// Reconcile claim acceptances of every application up to `most_recent`.
///
/// Applications are grouped by claim cursor, then by consensus contract, so one
/// fetch serves every application a consensus contract covers.
pub async fn check_for_claim_status<R: Repository + ?Sized>(
    repository: &R,
    contracts: &[ApplicationContracts],
    most_recent: u64,
) -> Result<()> {
    let by_cursor = group_by(contracts, |c| {
        Cursor::of(&c.application, MonitoredEvent::ClaimAccepted)
    });

    for (cursor, group) in by_cursor {
        let (from, to) = match cursor.range_to(most_recent) {
            ScanRange::Ahead => {
                tracing::warn!(
                    last_processed = cursor.last_processed_block,
                    most_recent,
                    "claim cursor ahead of most recent block, skipping"
                );
                continue;
            }
            ScanRange::UpToDate => {
                tracing::debug!(most_recent, "claims up to date");
                continue;
            }
            ScanRange::Pending { from, to } => (from, to),
        };

        for (consensus, members) in group_by(group, |c| c.application.consensus_address) {
            let addresses: Vec<Address> = members.iter().map(|c| c.address()).collect();
            let adapter = &members[0].adapters.consensus;
            let mut events = match adapter.retrieve_claim_accepted(from, to, &addresses).await {
                Ok(events) => events,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::error!(%consensus, from, to, reason = %e, "failed to read claim acceptances");
                    continue;
                }
            };
            events.sort_by_key(|e| (e.meta.block_number, e.meta.log_index));
            if let Some(foreign) = events.iter().find(|e| !addresses.contains(&e.application)) {
                tracing::debug!(%consensus, application = %foreign.application, "claim for an unmonitored application ignored");
            }

            let mut advance = Vec::new();
            for contract in members {
                let app = &contract.application;
                let own: Vec<&ClaimAcceptedObserved> =
                    events.iter().filter(|e| e.application == app.address).collect();
                match reconcile_application(repository, app, &own, to).await {
                    Ok(Outcome::Advance) => advance.push(app.address),
                    Ok(Outcome::Done) => {}
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        tracing::error!(application = %app.address, reason = %e, "failed to reconcile claims");
                    }
                }
            }

            if !advance.is_empty() {
                if let Err(e) = repository
                    .update_event_last_check_block(&advance, MonitoredEvent::ClaimAccepted, to)
                    .await
                {
                    tracing::error!(%consensus, reason = %e, "failed to advance claim cursor");
                }
            }
        }
    }
    Ok(())
}

async fn reconcile_application<R: Repository + ?Sized>(
    repository: &R,
    app: &Application,
    events: &[&ClaimAcceptedObserved],
    most_recent: u64,
) -> Result<Outcome> {
    let address = app.address;
    if app.epoch_length == 0 {
        return Err(ReaderError::Adapter(format!(
            "application {address} has no epoch length"
        )));
    }
    let mut accepted: Vec<Epoch> = Vec::new();
    // Set when an event must be seen again on a later pass.
    let mut hold = false;

    for event in events {
        let last_processed = event.last_processed_block_number;
        let index = epoch_index(last_processed, app.epoch_length);

        let earlier = repository
            .list_epochs_by_status(address, EpochStatus::ClaimSubmitted, last_processed)
            .await?;
        if let Some(pending) = earlier
            .iter()
            .find(|e| !accepted.iter().any(|a| a.index == e.index))
        {
            tracing::error!(
                application = %address,
                epoch_index = pending.index,
                last_processed,
                "invalid application state: an earlier submitted claim was never accepted"
            );
            hold = true;
            continue;
        }

        let Some(mut epoch) = repository.get_epoch(address, index).await? else {
            tracing::error!(application = %address, epoch_index = index, "invalid application state: claim accepted for unknown epoch");
            hold = true;
            continue;
        };
        let Some(local_claim) = epoch.claim_hash else {
            tracing::error!(application = %address, epoch_index = index, "invalid application state: epoch has no computed claim");
            hold = true;
            continue;
        };
        if local_claim != event.claim || epoch.last_block != last_processed {
            tracing::error!(
                application = %address,
                epoch_index = index,
                local_claim = %local_claim,
                accepted_claim = %event.claim,
                epoch_last_block = epoch.last_block,
                last_processed,
                "invalid application state: accepted claim does not match local epoch"
            );
            hold = true;
            continue;
        }
        if epoch.status == EpochStatus::ClaimAccepted || accepted.iter().any(|a| a.index == index) {
            continue;
        }
        if epoch.status != EpochStatus::ClaimSubmitted {
            tracing::debug!(
                application = %address,
                epoch_index = index,
                status = ?epoch.status,
                "claim accepted before local submission was recorded, deferring"
            );
            hold = true;
            continue;
        }

        tracing::info!(application = %address, epoch_index = index, claim = %event.claim, "claim accepted");
        epoch.status = EpochStatus::ClaimAccepted;
        accepted.push(epoch);
    }

    if accepted.is_empty() {
        return Ok(if hold { Outcome::Done } else { Outcome::Advance });
    }
    let cursor = if hold {
        app.last_claim_check_block
    } else {
        most_recent
    };
    repository
        .update_epochs_claim_accepted(address, &accepted, cursor)
        .await?;
    Ok(Outcome::Done)
}
