//! Aggregate progress arithmetic.
//!
//! Every rollup in the engine goes through `derive_aggregate`, which
//! recomputes the metrics from the full child map rather than patching
//! counts incrementally. Recomputation keeps updates idempotent: applying
//! the same child summary twice yields the same record.

use crate::types::{AggregateRecord, ChildSummary, NodeId, ProgressMetrics, Status};
use std::collections::BTreeMap;

/// Compute the canonical aggregate for a child map.
///
/// `percentage` is `completed * 100 / total`, rounded half away from
/// zero, and 0 for an empty map.
pub fn derive_aggregate(children: &BTreeMap<NodeId, ChildSummary>) -> ProgressMetrics {
    let total = children.len() as u32;
    let mut completed = 0u32;
    let mut in_progress = 0u32;
    let mut planned = 0u32;
    for child in children.values() {
        match child.status {
            Status::Completed => completed += 1,
            Status::InProgress => in_progress += 1,
            Status::Planned => planned += 1,
            Status::Blocked => {}
        }
    }
    ProgressMetrics {
        total_items: total,
        completed,
        in_progress,
        planned,
        percentage: percentage(completed, total),
    }
}

/// Integer percentage with half-away-from-zero rounding. Inputs are counts,
/// so the away-from-zero direction is always up.
pub fn percentage(completed: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let completed = u64::from(completed);
    let total = u64::from(total);
    ((completed * 200 + total) / (total * 2)) as u32
}

/// The percentage a leaf contributes to its parent.
pub fn leaf_percentage(status: Status) -> u32 {
    if status == Status::Completed { 100 } else { 0 }
}

/// Insert or update one child's summary and recompute the aggregate from
/// the full map.
pub fn update_child_summary(
    rec: &mut AggregateRecord,
    child_id: NodeId,
    child_status: Status,
    child_percentage: u32,
) {
    rec.children.insert(
        child_id,
        ChildSummary {
            status: child_status,
            progress: child_percentage,
        },
    );
    rec.progress = derive_aggregate(&rec.children);
}

/// Drop a child (soft-deleted or reparented) and recompute.
pub fn remove_child(rec: &mut AggregateRecord, child_id: &NodeId) {
    if rec.children.remove(child_id).is_some() {
        rec.progress = derive_aggregate(&rec.children);
    }
}

/// Promote to `Completed` when every child is completed. Never demotes:
/// a record already marked `Completed` keeps that status even if the
/// derived metrics regressed.
pub fn promote_if_complete(status: Status, progress: &ProgressMetrics) -> Status {
    if progress.is_complete() && status != Status::Completed {
        Status::Completed
    } else {
        status
    }
}

/// Status a parent takes after its aggregate changed.
///
/// With no children the old status stands. All-complete wins outright.
/// Any completed, in-progress or blocked child makes the parent
/// `InProgress`, except that an already `Completed` parent is not pulled
/// back by partial progress. Only all-planned children reset to `Planned`.
pub fn derive_parent_status(old: Status, progress: &ProgressMetrics) -> Status {
    if progress.total_items == 0 {
        return old;
    }
    if progress.completed == progress.total_items {
        return Status::Completed;
    }
    if progress.completed + progress.in_progress > 0 || progress.blocked() > 0 {
        if old == Status::Completed {
            return Status::Completed;
        }
        return Status::InProgress;
    }
    Status::Planned
}
