use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    db::UpsertOutcome,
    graph::EdgeDelta,
    indexer::{ScanMode, ScanSummary},
};

/// Progress notifications emitted while the vault changes. Observers receive them on the
/// `std::sync::mpsc::Sender` handed to [`Vault::open`](crate::vault::Vault::open); every event
/// describes state that is already committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VaultEvent {
    ScanStarted {
        mode: ScanMode,
        template_id: String,
        generation: u64,
    },
    NodeUpserted {
        id: String,
        path: String,
        outcome: UpsertOutcome,
    },
    NodeRemoved {
        id: String,
        path: String,
    },
    /// Edge delta of one committed document transaction
    EdgesChanged(EdgeDelta),
    ScanFinished(ScanSummary),
}

impl VaultEvent {
    /// Node id the event is about, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            VaultEvent::NodeUpserted { id, .. } | VaultEvent::NodeRemoved { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl Display for VaultEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            VaultEvent::ScanStarted {
                mode,
                template_id,
                generation,
            } => write!(f, "ScanStarted({mode:?}, {template_id}@{generation})"),
            VaultEvent::NodeUpserted { id, outcome, .. } => {
                write!(f, "NodeUpserted({id}, {outcome:?})")
            }
            VaultEvent::NodeRemoved { id, .. } => write!(f, "NodeRemoved({id})"),
            VaultEvent::EdgesChanged(delta) => write!(
                f,
                "EdgesChanged(+{}, -{})",
                delta.added.len(),
                delta.removed.len()
            ),
            VaultEvent::ScanFinished(summary) => write!(f, "ScanFinished({summary})"),
        }
    }
}
