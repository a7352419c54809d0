//! Per-application scan cursors.
//!
//! Cursors live in the repository (`last_*_check_block`); this module only reads them,
//! clamps them to the input source deployment and groups applications that share one.

use std::collections::BTreeMap;

use crate::model::{Application, MonitoredEvent};

/// Cursor: last processed block for one event kind of one application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub last_processed_block: u64,
}

/// Where a cursor stands relative to the block a pass indexes up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRange {
    /// Cursor is past the upper bound (reorg below the previous cursor, or a lagging node).
    Ahead,
    UpToDate,
    /// Blocks `from..=to` have not been scanned yet.
    Pending { from: u64, to: u64 },
}

impl Cursor {
    pub fn new(last_processed_block: u64) -> Self {
        Self {
            last_processed_block,
        }
    }

    /// Reads the cursor of `event`, clamped so the deployment block itself is scanned.
    pub fn of(app: &Application, event: MonitoredEvent) -> Self {
        let raw = match event {
            MonitoredEvent::InputAdded => app.last_input_check_block,
            MonitoredEvent::ClaimAccepted => app.last_claim_check_block,
            MonitoredEvent::OutputExecuted => app.last_output_check_block,
        };
        Self::new(raw).clamped_to(app.input_source_deployment_block)
    }

    pub fn clamped_to(self, deployment_block: u64) -> Self {
        if self.last_processed_block < deployment_block {
            Self::new(deployment_block.saturating_sub(1))
        } else {
            self
        }
    }

    pub fn range_to(self, most_recent: u64) -> ScanRange {
        use std::cmp::Ordering;
        match self.last_processed_block.cmp(&most_recent) {
            Ordering::Greater => ScanRange::Ahead,
            Ordering::Equal => ScanRange::UpToDate,
            Ordering::Less => ScanRange::Pending {
                from: self.last_processed_block + 1,
                to: most_recent,
            },
        }
    }
}

/// Partitions `items` by key, preserving input order inside each group.
pub fn group_by<T, K: Ord>(
    items: impl IntoIterator<Item = T>,
    key: impl Fn(&T) -> K,
) -> BTreeMap<K, Vec<T>> {
    let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
    for item in items {
        groups.entry(key(&item)).or_default().push(item);
    }
    groups
}
