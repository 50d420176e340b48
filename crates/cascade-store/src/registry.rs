//! Registry persistence and lookups.
//!
//! The registry is an index over file-owned data: it is authoritative for
//! `parent` and `path`, while each node's own file is authoritative for
//! status and progress. Lookups key on ids, never on directory slugs.
//! Every mutating operation ends with one atomic save.

use crate::atomic::{WriteError, write_atomic_retry};
use crate::dispatch::SelfWriteSet;
use cascade_core::domain::hierarchy::is_valid_edge;
use cascade_core::types::{NodeId, NodeKind, Registry, RegistryEntry, Status};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const REGISTRY_FILE: &str = "work-item-registry.json";
pub const RECORD_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt registry {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported registry version '{found}'")]
    UnsupportedVersion { found: String },

    #[error("unknown work item {0}")]
    Unknown(NodeId),

    #[error("duplicate id {0}")]
    Duplicate(NodeId),

    #[error("kind-incompatible parent for a {child}")]
    InvalidParent {
        child: NodeKind,
        parent: Option<NodeKind>,
    },

    #[error("hierarchy already has a root project")]
    DuplicateRoot,

    #[error("failed to serialize registry: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Write(#[from] WriteError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug)]
pub struct RegistryStore {
    root: PathBuf,
    path: PathBuf,
    registry: Registry,
    self_writes: Arc<SelfWriteSet>,
}

impl RegistryStore {
    /// Load the registry under `root`, creating an empty one when the file
    /// does not exist yet. Versions outside the `1.x` line are refused.
    pub fn open(root: &Path, self_writes: Arc<SelfWriteSet>, now: DateTime<Utc>) -> Result<Self> {
        let path = root.join(REGISTRY_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let registry: Registry =
                    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                if !registry.version.starts_with("1.") {
                    return Err(RegistryError::UnsupportedVersion {
                        found: registry.version,
                    });
                }
                Ok(Self {
                    root: root.to_path_buf(),
                    path,
                    registry,
                    self_writes,
                })
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                let mut store = Self {
                    root: root.to_path_buf(),
                    path,
                    registry: Registry::new(now),
                    self_writes,
                };
                store.save(now)?;
                Ok(store)
            }
            Err(source) => Err(RegistryError::Read { path, source }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the underlying registry for read-only passes.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn get(&self, id: NodeId) -> Option<&RegistryEntry> {
        self.registry.work_items.get(&id)
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.get(id).is_some_and(|e| e.is_live())
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|e| e.parent)
    }

    /// Live children of `id`, in id order.
    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.registry
            .work_items
            .values()
            .filter(|e| e.is_live() && e.parent == Some(id))
            .map(|e| e.id)
            .collect()
    }

    pub fn markdown_path_for(&self, id: NodeId) -> Option<PathBuf> {
        self.get(id).map(|e| self.root.join(&e.path))
    }

    /// The aggregate record path for a non-leaf node: `state.json` next to
    /// its markdown file. Leaves carry no record.
    pub fn record_path_for(&self, id: NodeId) -> Option<PathBuf> {
        let entry = self.get(id)?;
        if entry.kind.is_leaf() {
            return None;
        }
        let md = self.root.join(&entry.path);
        Some(md.parent()?.join(RECORD_FILE))
    }

    pub fn find_by_markdown_path(&self, path: &Path) -> Option<&RegistryEntry> {
        self.registry
            .work_items
            .values()
            .find(|e| self.root.join(&e.path) == path)
    }

    /// Allocate the next id of `kind`. Counters are high-water marks: the
    /// scan over existing ids (soft-deleted included) guards against a
    /// counter map that fell behind.
    pub fn next_id(&mut self, kind: NodeKind, now: DateTime<Utc>) -> Result<NodeId> {
        let scanned = self
            .registry
            .work_items
            .keys()
            .filter(|id| id.kind() == kind)
            .map(|id| id.num())
            .max()
            .unwrap_or(0);
        let stored = self
            .registry
            .id_counters
            .get(kind.prefix())
            .copied()
            .unwrap_or(0);
        let next = scanned.max(stored) + 1;
        self.registry
            .id_counters
            .insert(kind.prefix().to_string(), next);
        self.save(now)?;
        Ok(NodeId::new(kind, next))
    }

    /// Insert a new entry. Rejects duplicate ids, invalid kind edges,
    /// unknown parents and a second root.
    pub fn insert(&mut self, entry: RegistryEntry, now: DateTime<Utc>) -> Result<()> {
        if self.registry.work_items.contains_key(&entry.id) {
            return Err(RegistryError::Duplicate(entry.id));
        }
        let parent_kind = match entry.parent {
            None => None,
            Some(pid) => Some(self.get(pid).ok_or(RegistryError::Unknown(pid))?.kind),
        };
        if !is_valid_edge(entry.kind, parent_kind) {
            return Err(RegistryError::InvalidParent {
                child: entry.kind,
                parent: parent_kind,
            });
        }
        if entry.parent.is_none()
            && self
                .registry
                .work_items
                .values()
                .any(|e| e.parent.is_none() && e.is_live())
        {
            return Err(RegistryError::DuplicateRoot);
        }
        self.registry.work_items.insert(entry.id, entry);
        self.save(now)
    }

    /// Replace an existing entry wholesale.
    pub fn update(&mut self, entry: RegistryEntry, now: DateTime<Utc>) -> Result<()> {
        if !self.registry.work_items.contains_key(&entry.id) {
            return Err(RegistryError::Unknown(entry.id));
        }
        self.registry.work_items.insert(entry.id, entry);
        self.save(now)
    }

    /// Mirror a status change into the registry row.
    pub fn set_status(
        &mut self,
        id: NodeId,
        status: Status,
        updated: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = self
            .registry
            .work_items
            .get_mut(&id)
            .ok_or(RegistryError::Unknown(id))?;
        entry.status = status;
        entry.updated = updated;
        self.save(now)
    }

    /// Soft delete: the entry stays so the id remains allocated forever.
    pub fn soft_delete(&mut self, id: NodeId, now: DateTime<Utc>) -> Result<()> {
        let entry = self
            .registry
            .work_items
            .get_mut(&id)
            .ok_or(RegistryError::Unknown(id))?;
        entry.deleted = true;
        entry.updated = now.date_naive();
        self.save(now)
    }

    fn save(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.registry.last_updated = now;
        let mut bytes = serde_json::to_vec_pretty(&self.registry)
            .map_err(|source| RegistryError::Serialize { source })?;
        bytes.push(b'\n');
        self.self_writes.record(&self.path, &bytes);
        write_atomic_retry(&self.path, &bytes)?;
        Ok(())
    }
}
