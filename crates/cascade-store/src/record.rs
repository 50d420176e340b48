//! Aggregate record persistence.
//!
//! Records are the `state.json` files holding a node's rolled-up status
//! and progress. Loading always runs the reconciler: if the stored metrics
//! diverge from what the child map derives to, the record is corrected,
//! rewritten and reported through the observer channel. The comparison is
//! field-wise on the derived metrics only, so a clean record never causes
//! a write or a watcher event.

use crate::atomic::{WriteError, write_atomic_retry};
use crate::dispatch::SelfWriteSet;
use crate::events::{EngineEvent, EventBus};
use cascade_core::domain::progress::{derive_aggregate, promote_if_complete};
use cascade_core::types::AggregateRecord;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("missing record file {path}")]
    Missing { path: PathBuf },

    #[error("failed to read record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize record {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Write(#[from] WriteError),
}

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(Debug, Clone)]
pub struct RecordStore {
    events: EventBus,
    self_writes: Arc<SelfWriteSet>,
}

impl RecordStore {
    pub fn new(events: EventBus, self_writes: Arc<SelfWriteSet>) -> Self {
        Self {
            events,
            self_writes,
        }
    }

    /// Load a record and reconcile it before returning.
    pub fn load(&self, path: &Path, now: DateTime<Utc>) -> Result<AggregateRecord> {
        let rec = self.load_unchecked(path)?;
        self.reconcile(path, rec, now)
    }

    /// Parse a record without running the reconciler. Used by the
    /// validator, which must not write.
    pub fn load_unchecked(&self, path: &Path) -> Result<AggregateRecord> {
        let bytes = std::fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RecordError::Missing {
                    path: path.to_path_buf(),
                }
            } else {
                RecordError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|source| RecordError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Serialize with canonical key order and write atomically. Always
    /// refreshes `updated`.
    pub fn save(&self, path: &Path, rec: &mut AggregateRecord, now: DateTime<Utc>) -> Result<()> {
        rec.updated = now;
        let mut bytes =
            serde_json::to_vec_pretty(rec).map_err(|source| RecordError::Serialize {
                path: path.to_path_buf(),
                source,
            })?;
        bytes.push(b'\n');
        self.self_writes.record(path, &bytes);
        write_atomic_retry(path, &bytes)?;
        Ok(())
    }

    fn reconcile(
        &self,
        path: &Path,
        rec: AggregateRecord,
        now: DateTime<Utc>,
    ) -> Result<AggregateRecord> {
        let correct = derive_aggregate(&rec.children);
        if rec.progress == correct {
            return Ok(rec);
        }

        let before = rec.progress;
        let mut fixed = rec;
        fixed.progress = correct;
        fixed.status = promote_if_complete(fixed.status, &correct);
        tracing::warn!(
            path = %path.display(),
            id = %fixed.id,
            before_pct = before.percentage,
            after_pct = correct.percentage,
            "aggregate record diverged from children, rewriting"
        );
        self.save(path, &mut fixed, now)?;
        self.events.publish(EngineEvent::AutoFixed {
            id: fixed.id,
            before,
            after: correct,
        });
        Ok(fixed)
    }
}
