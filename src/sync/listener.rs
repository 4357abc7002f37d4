//! Applies remote change events to the local store between full runs.
//!
//! Events go through the same last-writer-wins rule as the merge phase. A
//! removal deletes the local row unless the local copy is strictly newer.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock;
use crate::error::Result;
use crate::storage::tombstones;
use crate::storage::traits::{ChangeKind, LocalStore, RemoteChange};
use crate::types::{Filter, SCHEMA_SENTINEL_ID};

use super::merge::{self, MergeAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Remote version written locally.
    Applied,
    /// Local row removed.
    Deleted,
    /// Not for us, older than the local copy, or awaiting deletion.
    Ignored,
}

pub struct ChangeListener<L: LocalStore> {
    local: Arc<L>,
    tenant: String,
    tables: HashSet<String>,
}

impl<L: LocalStore + 'static> ChangeListener<L> {
    pub fn new<I, S>(local: Arc<L>, tenant: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local,
            tenant: tenant.into(),
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Apply one event.
    pub fn apply(&self, change: &RemoteChange) -> Result<ChangeOutcome> {
        let id = change.document.id.as_str();
        if change.tenant != self.tenant
            || !self.tables.contains(&change.table)
            || id.is_empty()
            || id == SCHEMA_SENTINEL_ID
        {
            return Ok(ChangeOutcome::Ignored);
        }
        let table = change.table.as_str();
        let incoming = merge::to_local_record(&change.document);

        self.local.transaction(|s| {
            let existing = s.query(table, &Filter::id(id))?.into_iter().next();
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    if tombstones::pending_set(s, table)?.contains(id) {
                        return Ok(ChangeOutcome::Ignored);
                    }
                    match merge::decide(existing.as_ref(), Some(&incoming), false) {
                        Some(MergeAction::Download) => {
                            s.insert_or_replace(table, &incoming)?;
                            Ok(ChangeOutcome::Applied)
                        }
                        _ => Ok(ChangeOutcome::Ignored),
                    }
                }
                ChangeKind::Removed => {
                    tombstones::clear(s, table, &[id.to_string()])?;
                    let Some(existing) = existing else {
                        return Ok(ChangeOutcome::Ignored);
                    };
                    let local_ts = existing.get("updated_at").and_then(clock::parse_timestamp);
                    let remote_ts = incoming.get("updated_at").and_then(clock::parse_timestamp);
                    // A removal without a clock always applies.
                    if matches!((local_ts, remote_ts), (Some(l), Some(r)) if l > r) {
                        return Ok(ChangeOutcome::Ignored);
                    }
                    s.delete_where(table, &Filter::id(id))?;
                    Ok(ChangeOutcome::Deleted)
                }
            }
        })
    }

    /// Consume `events` until the channel closes.
    pub fn spawn(self, mut events: broadcast::Receiver<RemoteChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(change) => match self.apply(&change) {
                        Ok(outcome) => debug!(
                            table = %change.table,
                            id = %change.document.id,
                            kind = ?change.kind,
                            ?outcome,
                            "remote change"
                        ),
                        Err(e) => warn!(
                            table = %change.table,
                            id = %change.document.id,
                            error = %e,
                            "failed to apply remote change"
                        ),
                    },
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change listener lagged; next reconciliation will catch up");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
