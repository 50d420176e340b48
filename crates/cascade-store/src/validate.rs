//! Structural integrity checks.
//!
//! `validate_hierarchy` is read-only: it never rewrites a file, so it can
//! run at startup or on demand without generating watcher traffic.
//! `repair_hierarchy` applies the safe subset of fixes: regenerating a
//! missing aggregate record from its children, stripping stale child
//! entries, and re-running the load-time reconciler. Registry entries are
//! never created or deleted by either pass.

use crate::record::RecordStore;
use crate::registry::RegistryStore;
use crate::scan::scan_records;
use cascade_core::domain::hierarchy::is_valid_edge;
use cascade_core::domain::progress::{
    derive_aggregate, derive_parent_status, leaf_percentage, promote_if_complete,
};
use cascade_core::frontmatter::Frontmatter;
use cascade_core::types::{AggregateRecord, ChildSummary, NodeId, NodeKind, Status};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// The eight structural checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    /// V1: entry references a parent that does not exist (or the tree has
    /// extra roots).
    MissingParent,
    /// V2: parent record lists a child the registry does not attribute to
    /// it.
    StaleChild,
    /// V3: an expected file (aggregate record or markdown) is absent.
    MissingRecord,
    /// V4: cycle in the parent-of relation.
    Cycle,
    /// V5: kind-incompatible parent.
    KindMismatch,
    /// V6: stored aggregate diverges from the children-derived value.
    AggregateDivergence,
    /// V7: record file on disk with no live registry entry.
    OrphanRecord,
    /// V8: duplicate or conflicting id.
    DuplicateId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl Check {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingParent => "V1",
            Self::StaleChild => "V2",
            Self::MissingRecord => "V3",
            Self::Cycle => "V4",
            Self::KindMismatch => "V5",
            Self::AggregateDivergence => "V6",
            Self::OrphanRecord => "V7",
            Self::DuplicateId => "V8",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::MissingParent | Self::Cycle | Self::KindMismatch | Self::DuplicateId => {
                Severity::Error
            }
            Self::StaleChild
            | Self::MissingRecord
            | Self::AggregateDivergence
            | Self::OrphanRecord => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub check: Check,
    pub id: Option<NodeId>,
    pub path: Option<PathBuf>,
    pub message: String,
}

impl Diagnostic {
    fn for_id(check: Check, id: NodeId, message: impl Into<String>) -> Self {
        Self {
            check,
            id: Some(id),
            path: None,
            message: message.into(),
        }
    }

    fn for_path(check: Check, path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            check,
            id: None,
            path: Some(path),
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.check.severity()
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.check.code(), self.message)
    }
}

/// Current state of one child as its parent's record should reflect it.
fn child_state(
    registry: &RegistryStore,
    records: &RecordStore,
    id: NodeId,
) -> Option<(Status, u32)> {
    let entry = registry.get(id)?;
    if entry.kind.is_leaf() {
        let md = registry.markdown_path_for(id)?;
        let bytes = std::fs::read(md).ok()?;
        let status = Frontmatter::parse(&bytes)
            .ok()
            .and_then(|(fm, _)| fm.status())
            .unwrap_or(Status::Planned);
        Some((status, leaf_percentage(status)))
    } else {
        let path = registry.record_path_for(id)?;
        let rec = records.load_unchecked(&path).ok()?;
        Some((rec.status, rec.progress.percentage))
    }
}

/// Run all checks. Pure with respect to the filesystem: reads only.
pub fn validate_hierarchy(registry: &RegistryStore, records: &RecordStore) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let reg = registry.registry();

    // V8: the map key is the canonical id; an entry disagreeing with its
    // own key is a conflicting claim on that id.
    for (key, entry) in &reg.work_items {
        if *key != entry.id {
            diags.push(Diagnostic::for_id(
                Check::DuplicateId,
                *key,
                format!("registry key {} holds an entry claiming id {}", key, entry.id),
            ));
        }
    }

    let live: Vec<_> = reg.work_items.values().filter(|e| e.is_live()).collect();

    // V1 and V5: parent references and kind edges.
    let mut roots = 0u32;
    for entry in &live {
        match entry.parent {
            None => {
                roots += 1;
                if entry.kind != NodeKind::Project {
                    diags.push(Diagnostic::for_id(
                        Check::KindMismatch,
                        entry.id,
                        format!("{} {} has no parent but is not a project", entry.kind, entry.id),
                    ));
                } else if roots > 1 {
                    diags.push(Diagnostic::for_id(
                        Check::MissingParent,
                        entry.id,
                        format!("{} is a second root", entry.id),
                    ));
                }
            }
            Some(pid) => match registry.get(pid) {
                None => diags.push(Diagnostic::for_id(
                    Check::MissingParent,
                    entry.id,
                    format!("{} references missing parent {}", entry.id, pid),
                )),
                Some(parent) if parent.deleted => diags.push(Diagnostic::for_id(
                    Check::MissingParent,
                    entry.id,
                    format!("{} references soft-deleted parent {}", entry.id, pid),
                )),
                Some(parent) => {
                    if !is_valid_edge(entry.kind, Some(parent.kind)) {
                        diags.push(Diagnostic::for_id(
                            Check::KindMismatch,
                            entry.id,
                            format!(
                                "{} {} cannot attach to {} {}",
                                entry.kind, entry.id, parent.kind, pid
                            ),
                        ));
                    }
                }
            },
        }
    }

    // V4: cycles in the parent relation.
    let mut on_reported_cycle: HashSet<NodeId> = HashSet::new();
    for entry in &live {
        let mut seen = HashSet::from([entry.id]);
        let mut cursor = entry.id;
        while let Some(pid) = registry.parent_of(cursor) {
            if !seen.insert(pid) {
                if on_reported_cycle.insert(pid) {
                    diags.push(Diagnostic::for_id(
                        Check::Cycle,
                        pid,
                        format!("parent chain through {} loops back to {}", entry.id, pid),
                    ));
                }
                break;
            }
            cursor = pid;
        }
    }

    // Per-node file checks.
    for entry in &live {
        let md = registry.root().join(&entry.path);
        if !md.exists() {
            diags.push(Diagnostic::for_id(
                Check::MissingRecord,
                entry.id,
                format!("{} has no markdown file at {}", entry.id, entry.path),
            ));
        }

        if entry.kind.is_leaf() {
            continue;
        }
        let Some(record_path) = registry.record_path_for(entry.id) else {
            continue;
        };
        let rec = match records.load_unchecked(&record_path) {
            Ok(rec) => rec,
            Err(crate::record::RecordError::Missing { .. }) => {
                diags.push(Diagnostic::for_id(
                    Check::MissingRecord,
                    entry.id,
                    format!("{} has no aggregate record at {}", entry.id, record_path.display()),
                ));
                continue;
            }
            Err(e) => {
                diags.push(Diagnostic::for_path(
                    Check::AggregateDivergence,
                    record_path,
                    format!("unreadable aggregate record: {}", e),
                ));
                continue;
            }
        };

        if rec.id != entry.id {
            diags.push(Diagnostic::for_id(
                Check::DuplicateId,
                entry.id,
                format!("record at {} claims id {}", record_path.display(), rec.id),
            ));
        }

        // V2: children the registry does not attribute to this parent.
        let expected: HashSet<NodeId> = registry.children_of(entry.id).into_iter().collect();
        for child_id in rec.children.keys() {
            if !expected.contains(child_id) {
                diags.push(Diagnostic::for_id(
                    Check::StaleChild,
                    entry.id,
                    format!("record for {} lists stale child {}", entry.id, child_id),
                ));
            }
        }

        // V6: record out of step with its children.
        for child_id in &expected {
            match rec.children.get(child_id) {
                None => diags.push(Diagnostic::for_id(
                    Check::AggregateDivergence,
                    entry.id,
                    format!("record for {} is missing child {}", entry.id, child_id),
                )),
                Some(summary) => {
                    if let Some((status, pct)) = child_state(registry, records, *child_id)
                        && (summary.status != status || summary.progress != pct)
                    {
                        diags.push(Diagnostic::for_id(
                            Check::AggregateDivergence,
                            entry.id,
                            format!("record for {} has a stale summary of {}", entry.id, child_id),
                        ));
                    }
                }
            }
        }

        let derived = derive_aggregate(&rec.children);
        if rec.progress != derived {
            diags.push(Diagnostic::for_id(
                Check::AggregateDivergence,
                entry.id,
                format!(
                    "stored progress for {} is {}%, children derive {}%",
                    entry.id, rec.progress.percentage, derived.percentage
                ),
            ));
        } else if rec.status == Status::Completed && !derived.is_complete() && derived.total_items > 0
        {
            // Forward-only promotion held the status while children
            // regressed. Worth a diagnostic, never an automatic demotion.
            diags.push(Diagnostic::for_id(
                Check::AggregateDivergence,
                entry.id,
                format!(
                    "{} is held completed while children report {}%",
                    entry.id, derived.percentage
                ),
            ));
        }
    }

    // V7: record files nothing points at.
    let expected_records: HashSet<PathBuf> = live
        .iter()
        .filter_map(|e| registry.record_path_for(e.id))
        .collect();
    for found in scan_records(registry.root()) {
        if !expected_records.contains(&found) {
            diags.push(Diagnostic::for_path(
                Check::OrphanRecord,
                found.clone(),
                format!("record {} has no live registry entry", found.display()),
            ));
        }
    }

    diags
}

/// Apply the safe fixes. Returns one diagnostic per repair performed.
pub fn repair_hierarchy(
    registry: &RegistryStore,
    records: &RecordStore,
    now: DateTime<Utc>,
) -> Vec<Diagnostic> {
    let mut applied = Vec::new();
    let reg = registry.registry();
    let live: Vec<_> = reg
        .work_items
        .values()
        .filter(|e| e.is_live() && !e.kind.is_leaf())
        .collect();

    for entry in live {
        let Some(record_path) = registry.record_path_for(entry.id) else {
            continue;
        };

        match records.load_unchecked(&record_path) {
            Err(crate::record::RecordError::Missing { .. }) => {
                // Regenerate from current children.
                let mut children: BTreeMap<NodeId, ChildSummary> = BTreeMap::new();
                for child_id in registry.children_of(entry.id) {
                    let (status, progress) = child_state(registry, records, child_id)
                        .unwrap_or((Status::Planned, 0));
                    children.insert(child_id, ChildSummary { status, progress });
                }
                let progress = derive_aggregate(&children);
                let mut rec = AggregateRecord::empty(entry.id, now);
                rec.status = derive_parent_status(Status::Planned, &progress);
                rec.progress = progress;
                rec.children = children;
                match records.save(&record_path, &mut rec, now) {
                    Ok(()) => applied.push(Diagnostic::for_id(
                        Check::MissingRecord,
                        entry.id,
                        format!("regenerated aggregate record for {}", entry.id),
                    )),
                    Err(e) => {
                        tracing::warn!(id = %entry.id, error = %e, "record regeneration failed");
                    }
                }
            }
            Ok(rec) => {
                // Strip children the registry does not attribute here,
                // then reconcile whatever remains.
                let expected: HashSet<NodeId> =
                    registry.children_of(entry.id).into_iter().collect();
                let mut fixed = rec.clone();
                fixed.children.retain(|id, _| expected.contains(id));
                fixed.progress = derive_aggregate(&fixed.children);
                fixed.status = promote_if_complete(fixed.status, &fixed.progress);
                if fixed != rec {
                    match records.save(&record_path, &mut fixed, now) {
                        Ok(()) => applied.push(Diagnostic::for_id(
                            Check::StaleChild,
                            entry.id,
                            format!("rebuilt child map for {}", entry.id),
                        )),
                        Err(e) => {
                            tracing::warn!(id = %entry.id, error = %e, "record repair failed");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "record unreadable, not repairable");
            }
        }
    }
    applied
}
