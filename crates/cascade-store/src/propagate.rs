//! Bottom-up state propagation.
//!
//! One chain walks from a changed node to the root, rewriting each
//! ancestor's child summary and derived aggregate. The walk stops early
//! when an ancestor comes out unchanged, carries a visited set so a
//! corrupted parent relation cannot loop, and isolates failures per chain
//! so one broken branch does not abort the rest of a batch.
//!
//! A batch shares a record cache: a second chain reaching an ancestor the
//! first chain already wrote sees the updated value, goes through the
//! unchanged short-circuit, and leaves the file alone. That is what bounds
//! each node to one update per batch.

use crate::events::{EngineEvent, ErrorKind, EventBus};
use crate::record::{RecordError, RecordStore};
use crate::registry::RegistryStore;
use cascade_core::domain::progress::{
    derive_parent_status, leaf_percentage, remove_child, update_child_summary,
};
use cascade_core::frontmatter::{Frontmatter, FrontmatterError};
use cascade_core::types::{AggregateRecord, NodeId, Status};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PropagateError {
    #[error("cycle detected at {0}")]
    CycleDetected(NodeId),

    #[error("no aggregate record path resolvable for {0}")]
    MalformedHierarchy(NodeId),

    #[error("changed path {0} does not belong to the hierarchy")]
    UnknownPath(PathBuf),

    #[error("frontmatter in {path}: {source}")]
    Frontmatter {
        path: PathBuf,
        #[source]
        source: FrontmatterError,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Record(#[from] RecordError),
}

impl PropagateError {
    /// Observer-channel classification, named by effect.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CycleDetected(_) => ErrorKind::CycleDetected,
            Self::MalformedHierarchy(_) | Self::UnknownPath(_) => ErrorKind::MalformedHierarchy,
            Self::Frontmatter { source, .. } => match source {
                FrontmatterError::NoFrontmatter => ErrorKind::NoFrontmatter,
                _ => ErrorKind::InvalidSyntax,
            },
            Self::Read { .. } => ErrorKind::Io,
            Self::Record(RecordError::Missing { .. }) => ErrorKind::MissingRecord,
            Self::Record(RecordError::Corrupt { .. }) => ErrorKind::CorruptRecord,
            Self::Record(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, PropagateError>;

/// Snapshot of the node a chain is currently standing on: either a leaf
/// read from frontmatter or an interior node read from its record.
#[derive(Debug, Clone, Copy)]
struct ChangedNode {
    id: NodeId,
    status: Status,
    percentage: u32,
}

pub struct Propagator<'a> {
    registry: &'a RegistryStore,
    records: &'a RecordStore,
    events: &'a EventBus,
    cache: HashMap<PathBuf, AggregateRecord>,
}

impl<'a> Propagator<'a> {
    pub fn new(registry: &'a RegistryStore, records: &'a RecordStore, events: &'a EventBus) -> Self {
        Self {
            registry,
            records,
            events,
            cache: HashMap::new(),
        }
    }

    /// Run one chain per unique path, in dispatch order. A failing chain
    /// is reported and skipped; the rest of the batch continues.
    pub fn propagate_batch(
        &mut self,
        paths: &[PathBuf],
        now: DateTime<Utc>,
    ) -> Vec<(PathBuf, PropagateError)> {
        let mut seen = HashSet::new();
        let mut failures = Vec::new();
        for path in paths {
            if !seen.insert(path.clone()) {
                continue;
            }
            if let Err(e) = self.propagate(path, now) {
                tracing::warn!(path = %path.display(), error = %e, "propagation chain aborted");
                self.events.publish(EngineEvent::Error {
                    kind: e.kind(),
                    context: format!("{}: {}", path.display(), e),
                });
                failures.push((path.clone(), e));
            }
        }
        failures
    }

    /// One full chain from `path` to the root.
    pub fn propagate(&mut self, path: &Path, now: DateTime<Utc>) -> Result<()> {
        let start = self.load_source(path, now)?;
        self.walk_up(start, now)
    }

    /// Resolve the changed path into a node snapshot. A leaf markdown
    /// yields a synthetic record from its frontmatter; anything else is an
    /// aggregate record load (which runs the reconciler).
    fn load_source(&mut self, path: &Path, now: DateTime<Utc>) -> Result<ChangedNode> {
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            let rec = self.load_record(path, now)?;
            return Ok(ChangedNode {
                id: rec.id,
                status: rec.status,
                percentage: rec.progress.percentage,
            });
        }

        let bytes = std::fs::read(path).map_err(|source| PropagateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        match Frontmatter::parse(&bytes) {
            Ok((fm, _body)) => {
                let id = fm
                    .id()
                    .or_else(|| self.registry.find_by_markdown_path(path).map(|e| e.id))
                    .ok_or_else(|| PropagateError::UnknownPath(path.to_path_buf()))?;
                if !id.is_leaf() {
                    // Interior markdown changed: its rollup lives in the
                    // sibling record, so the chain starts from there.
                    let record_path = self
                        .registry
                        .record_path_for(id)
                        .ok_or(PropagateError::MalformedHierarchy(id))?;
                    let rec = self.load_record(&record_path, now)?;
                    return Ok(ChangedNode {
                        id: rec.id,
                        status: rec.status,
                        percentage: rec.progress.percentage,
                    });
                }
                let status = fm.status().unwrap_or(Status::Planned);
                Ok(ChangedNode {
                    id,
                    status,
                    percentage: leaf_percentage(status),
                })
            }
            Err(FrontmatterError::NoFrontmatter) => {
                tracing::warn!(path = %path.display(), "markdown without frontmatter, treated as planned leaf");
                let entry = self
                    .registry
                    .find_by_markdown_path(path)
                    .ok_or_else(|| PropagateError::UnknownPath(path.to_path_buf()))?;
                Ok(ChangedNode {
                    id: entry.id,
                    status: Status::Planned,
                    percentage: 0,
                })
            }
            Err(source) => Err(PropagateError::Frontmatter {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn load_record(&mut self, path: &Path, now: DateTime<Utc>) -> Result<AggregateRecord> {
        if let Some(rec) = self.cache.get(path) {
            return Ok(rec.clone());
        }
        let rec = self.records.load(path, now)?;
        self.cache.insert(path.to_path_buf(), rec.clone());
        Ok(rec)
    }

    fn walk_up(&mut self, start: ChangedNode, now: DateTime<Utc>) -> Result<()> {
        let mut current = start;
        let mut visited: HashSet<NodeId> = HashSet::new();

        loop {
            let Some(parent_id) = self.registry.parent_of(current.id) else {
                return Ok(()); // reached the root
            };
            if !visited.insert(parent_id) {
                return Err(PropagateError::CycleDetected(parent_id));
            }

            let parent_path = self
                .registry
                .record_path_for(parent_id)
                .ok_or(PropagateError::MalformedHierarchy(parent_id))?;
            let parent = self.load_record(&parent_path, now)?;

            let mut next = parent.clone();
            if self.registry.is_live(current.id) {
                update_child_summary(&mut next, current.id, current.status, current.percentage);
            } else {
                remove_child(&mut next, &current.id);
            }
            self.prune_dead_children(parent_id, &mut next);
            next.status = derive_parent_status(parent.status, &next.progress);

            if next == parent {
                return Ok(()); // nothing changed upstream
            }

            self.records.save(&parent_path, &mut next, now)?;
            self.events.publish(EngineEvent::Propagated {
                id: parent_id,
                old_status: parent.status,
                new_status: next.status,
                percentage: next.progress.percentage,
            });
            current = ChangedNode {
                id: parent_id,
                status: next.status,
                percentage: next.progress.percentage,
            };
            self.cache.insert(parent_path, next);
        }
    }

    /// Drop summaries for children the registry no longer attributes to
    /// this parent: soft-deleted or reparented entries. Children with no
    /// registry entry at all are left for the validator to report.
    fn prune_dead_children(&self, parent_id: NodeId, rec: &mut AggregateRecord) {
        let dead: Vec<NodeId> = rec
            .children
            .keys()
            .filter(|cid| {
                self.registry
                    .get(**cid)
                    .is_some_and(|e| e.deleted || e.parent != Some(parent_id))
            })
            .copied()
            .collect();
        for id in dead {
            remove_child(rec, &id);
        }
    }
}
