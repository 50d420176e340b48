//! Engine façade.
//!
//! Owns the registry, the record store and the observer channel, and
//! funnels every mutation through one writer lock. The watcher thread only
//! sends paths; all file rewrites happen on whichever caller holds the
//! lock, so no two chains ever touch the same record concurrently.

use crate::dispatch::SelfWriteSet;
use crate::events::{EngineEvent, EventBus};
use crate::propagate::{PropagateError, Propagator};
use crate::record::{RecordError, RecordStore};
use crate::registry::{RegistryError, RegistryStore};
use crate::scan::scan_records;
use crate::validate::{self, Diagnostic};
use crate::atomic::{WriteError, write_atomic_retry};
use cascade_core::domain::hierarchy::is_valid_edge;
use cascade_core::domain::slug::slugify;
use cascade_core::frontmatter::{Frontmatter, FrontmatterError};
use cascade_core::types::{
    AggregateRecord, Complexity, NodeId, NodeKind, Priority, RegistryEntry, Status,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Propagate(#[from] PropagateError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("frontmatter in {path}: {source}")]
    Frontmatter {
        path: PathBuf,
        #[source]
        source: FrontmatterError,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("work item {0} not found")]
    Unknown(NodeId),
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub struct Engine {
    root: PathBuf,
    registry: Mutex<RegistryStore>,
    records: RecordStore,
    events: EventBus,
    self_writes: Arc<SelfWriteSet>,
}

impl Engine {
    /// Open (or initialize) the hierarchy rooted at `root`: load the
    /// registry, run a validation pass, and reconcile every record the
    /// initial scan finds. Unreadable records are reported, not fatal.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let events = EventBus::default();
        let self_writes = Arc::new(SelfWriteSet::new());
        let records = RecordStore::new(events.clone(), self_writes.clone());
        let registry = RegistryStore::open(&root, self_writes.clone(), Utc::now())?;

        let engine = Self {
            root,
            registry: Mutex::new(registry),
            records,
            events,
            self_writes,
        };
        engine.validate();

        let now = Utc::now();
        for path in scan_records(&engine.root) {
            if let Err(e) = engine.records.load(&path, now) {
                tracing::warn!(path = %path.display(), error = %e, "record skipped during startup reconcile");
            }
        }
        Ok(engine)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn self_writes(&self) -> &SelfWriteSet {
        &self.self_writes
    }

    fn lock_registry(&self) -> MutexGuard<'_, RegistryStore> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the structural checks and publish every diagnostic.
    pub fn validate(&self) -> Vec<Diagnostic> {
        let registry = self.lock_registry();
        let diags = validate::validate_hierarchy(&registry, &self.records);
        for diag in &diags {
            self.events.publish(EngineEvent::Diagnostic(diag.clone()));
        }
        diags
    }

    /// Apply the safe repairs and publish what was fixed.
    pub fn repair(&self) -> Vec<Diagnostic> {
        let registry = self.lock_registry();
        let applied = validate::repair_hierarchy(&registry, &self.records, Utc::now());
        for diag in &applied {
            self.events.publish(EngineEvent::Diagnostic(diag.clone()));
        }
        applied
    }

    /// Run a single propagation chain from `path`.
    pub fn propagate(&self, path: &Path) -> Result<()> {
        let registry = self.lock_registry();
        let mut propagator = Propagator::new(&registry, &self.records, &self.events);
        let result = propagator.propagate(path, Utc::now());
        if let Err(e) = &result {
            tracing::warn!(path = %path.display(), error = %e, "propagation chain aborted");
            self.events.publish(EngineEvent::Error {
                kind: e.kind(),
                context: format!("{}: {}", path.display(), e),
            });
        }
        result.map_err(Into::into)
    }

    /// Run one chain per unique path. Failures abort only their own chain.
    pub fn propagate_batch(&self, paths: &[PathBuf]) -> Vec<(PathBuf, PropagateError)> {
        let registry = self.lock_registry();
        let mut propagator = Propagator::new(&registry, &self.records, &self.events);
        propagator.propagate_batch(paths, Utc::now())
    }

    /// Allocate an id, write the markdown, the initial aggregate record
    /// (non-leaf kinds) and the registry entry, then roll the new child up
    /// into its ancestors.
    pub fn create_work_item(
        &self,
        kind: NodeKind,
        title: &str,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let now = Utc::now();
        let today = now.date_naive();

        let (id, md_abs) = {
            let mut registry = self.lock_registry();

            let (parent_kind, parent_dir_rel) = match parent {
                None => (None, PathBuf::new()),
                Some(pid) => {
                    let entry = registry
                        .get(pid)
                        .filter(|e| e.is_live())
                        .ok_or(EngineError::Unknown(pid))?;
                    let dir = Path::new(&entry.path)
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_default();
                    (Some(entry.kind), dir)
                }
            };
            if !is_valid_edge(kind, parent_kind) {
                return Err(RegistryError::InvalidParent {
                    child: kind,
                    parent: parent_kind,
                }
                .into());
            }
            // A second root would land on the same state.json as the
            // first; refuse before touching any file.
            if parent.is_none()
                && registry
                    .registry()
                    .work_items
                    .values()
                    .any(|e| e.parent.is_none() && e.is_live())
            {
                return Err(RegistryError::DuplicateRoot.into());
            }

            let id = registry.next_id(kind, now)?;

            let (md_rel, record_abs) = if kind.is_leaf() {
                (parent_dir_rel.join(format!("{}.md", id)), None)
            } else {
                let slug = slugify(title);
                let dir_name = if slug.is_empty() {
                    id.to_string()
                } else {
                    format!("{}-{}", id, slug)
                };
                // The root project lives directly in the root directory.
                let dir_rel = if kind == NodeKind::Project {
                    parent_dir_rel
                } else {
                    parent_dir_rel.join(dir_name)
                };
                let abs_dir = self.root.join(&dir_rel);
                std::fs::create_dir_all(&abs_dir).map_err(|source| EngineError::Io {
                    path: abs_dir.clone(),
                    source,
                })?;
                (
                    dir_rel.join(format!("{}.md", id)),
                    Some(abs_dir.join(crate::registry::RECORD_FILE)),
                )
            };
            let md_abs = self.root.join(&md_rel);

            let mut fm = Frontmatter::new();
            fm.set_id(id);
            fm.set_kind(kind);
            fm.set_title(title);
            fm.set_status(Status::Planned);
            fm.set_priority(Priority::default());
            fm.set_complexity(Complexity::default());
            fm.set_parent(parent);
            fm.set_created(today);
            fm.set_updated(today);
            let body = format!("\n# {}\n", title);
            let bytes = fm
                .emit(body.as_bytes())
                .map_err(|source| EngineError::Frontmatter {
                    path: md_abs.clone(),
                    source,
                })?;
            self.self_writes.record(&md_abs, &bytes);
            write_atomic_retry(&md_abs, &bytes)?;

            if let Some(record_path) = record_abs {
                let mut record = AggregateRecord::empty(id, now);
                self.records.save(&record_path, &mut record, now)?;
            }

            registry.insert(
                RegistryEntry {
                    id,
                    kind,
                    path: md_rel.to_string_lossy().into_owned(),
                    title: title.to_string(),
                    status: Status::Planned,
                    parent,
                    created: today,
                    updated: today,
                    deleted: false,
                    extra: serde_json::Map::new(),
                },
                now,
            )?;
            (id, md_abs)
        };

        if parent.is_some() {
            self.propagate(&md_abs)?;
        }
        Ok(id)
    }

    /// Rewrite a node's frontmatter status, mirror it into the registry,
    /// and roll the change up.
    pub fn set_status(&self, id: NodeId, status: Status) -> Result<()> {
        let now = Utc::now();
        let today = now.date_naive();

        let md_abs = {
            let mut registry = self.lock_registry();
            let entry = registry
                .get(id)
                .filter(|e| e.is_live())
                .ok_or(EngineError::Unknown(id))?;
            let md_abs = self.root.join(&entry.path);

            let bytes = std::fs::read(&md_abs).map_err(|source| EngineError::Io {
                path: md_abs.clone(),
                source,
            })?;
            let (mut fm, body) =
                Frontmatter::parse(&bytes).map_err(|source| EngineError::Frontmatter {
                    path: md_abs.clone(),
                    source,
                })?;
            fm.set_status(status);
            fm.set_updated(today);
            let out = fm
                .emit(&body)
                .map_err(|source| EngineError::Frontmatter {
                    path: md_abs.clone(),
                    source,
                })?;
            self.self_writes.record(&md_abs, &out);
            write_atomic_retry(&md_abs, &out)?;

            registry.set_status(id, status, today, now)?;
            md_abs
        };

        self.propagate(&md_abs)
    }

    /// Soft delete: mark the registry entry and drop the node from its
    /// parent's aggregate in the same call.
    pub fn soft_delete(&self, id: NodeId) -> Result<()> {
        let now = Utc::now();

        let start_path = {
            let mut registry = self.lock_registry();
            let entry = registry
                .get(id)
                .filter(|e| e.is_live())
                .ok_or(EngineError::Unknown(id))?;
            let start = if entry.kind.is_leaf() {
                self.root.join(&entry.path)
            } else {
                registry
                    .record_path_for(id)
                    .ok_or(EngineError::Unknown(id))?
            };
            registry.soft_delete(id, now)?;
            start
        };

        self.propagate(&start_path)
    }
}
