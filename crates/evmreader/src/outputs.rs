//! Output reconciler: records which stored outputs were executed on chain.

use crate::cursor::{Cursor, ScanRange};
use crate::error::Result;
use crate::factory::ApplicationContracts;
use crate::model::{MonitoredEvent, Output};
use crate::repository::Repository;

/// Match OutputExecuted events of each application against its stored outputs.
///
/// A batch is all-or-nothing: an unknown output index or a payload that differs from
/// the stored one leaves the application untouched for this pass.
pub async fn check_for_output_execution<R: Repository + ?Sized>(
    repository: &R,
    contracts: &[ApplicationContracts],
    most_recent: u64,
) -> Result<()> {
    for contract in contracts {
        let address = contract.address();
        let cursor = Cursor::of(&contract.application, MonitoredEvent::OutputExecuted);
        let (from, to) = match cursor.range_to(most_recent) {
            ScanRange::Ahead => {
                tracing::warn!(
                    application = %address,
                    last_processed = cursor.last_processed_block,
                    most_recent,
                    "output cursor ahead of most recent block, skipping"
                );
                continue;
            }
            ScanRange::UpToDate => continue,
            ScanRange::Pending { from, to } => (from, to),
        };

        match reconcile_application(repository, contract, from, to).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::error!(application = %address, from, to, reason = %e, "failed to reconcile outputs");
            }
        }
    }
    Ok(())
}

async fn reconcile_application<R: Repository + ?Sized>(
    repository: &R,
    contract: &ApplicationContracts,
    from: u64,
    to: u64,
) -> Result<()> {
    let address = contract.address();
    let mut events = contract
        .adapters
        .application
        .retrieve_output_executions(from, to)
        .await?;
    events.sort_by_key(|e| (e.meta.block_number, e.meta.log_index));

    let mut executed: Vec<Output> = Vec::with_capacity(events.len());
    for event in events {
        let Some(mut output) = repository.get_output(address, event.output_index).await? else {
            tracing::warn!(
                application = %address,
                output_index = event.output_index,
                "executed output not found locally, retrying on a later block"
            );
            return Ok(());
        };
        if output.raw_data != event.output {
            tracing::error!(
                application = %address,
                output_index = event.output_index,
                block = event.meta.block_number,
                "invalid application state: executed output differs from the local one"
            );
            return Ok(());
        }
        tracing::debug!(application = %address, output_index = output.index, tx = %event.meta.transaction_hash, "output executed");
        output.execution_transaction_hash = Some(event.meta.transaction_hash);
        executed.push(output);
    }

    repository
        .update_outputs_execution(address, &executed, to)
        .await?;
    if !executed.is_empty() {
        tracing::info!(application = %address, count = executed.len(), "outputs executed");
    }
    Ok(())
}
