//! Observer channel for engine activity.
//!
//! Every auto-fix, every propagated node, every aborted chain and every
//! validator diagnostic is published here. Nothing in the engine blocks on
//! subscribers; a send with no receivers is dropped silently.

use crate::validate::Diagnostic;
use cascade_core::{NodeId, ProgressMetrics, Status};
use tokio::sync::broadcast;

/// Failure classes surfaced to observers, named by effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoFrontmatter,
    InvalidSyntax,
    MissingRecord,
    OrphanedChild,
    MalformedHierarchy,
    CycleDetected,
    CorruptRecord,
    Io,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A node's aggregate record was rewritten by a propagation chain.
    Propagated {
        id: NodeId,
        old_status: Status,
        new_status: Status,
        percentage: u32,
    },
    /// The reconciler corrected a diverging record on load.
    AutoFixed {
        id: NodeId,
        before: ProgressMetrics,
        after: ProgressMetrics,
    },
    Diagnostic(Diagnostic),
    Error { kind: ErrorKind, context: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
