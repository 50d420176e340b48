//! Shared fixture: a small hierarchy built through the engine API inside
//! a temp directory.

#![allow(dead_code)] // not every suite touches every helper

use cascade_core::types::{AggregateRecord, NodeId, NodeKind};
use cascade_store::Engine;
use std::path::Path;
use tempfile::TempDir;

pub struct Tree {
    pub dir: TempDir,
    pub engine: Engine,
    pub project: NodeId,
    pub epic: NodeId,
    pub feature: NodeId,
    pub story: NodeId,
    pub task_a: NodeId,
    pub task_b: NodeId,
}

/// `P0001 -> E0001 -> F0001 -> S0001 -> {T0001, T0002}`, everything
/// planned.
pub fn build_tree() -> Tree {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();

    let project = engine
        .create_work_item(NodeKind::Project, "Release planning", None)
        .unwrap();
    let epic = engine
        .create_work_item(NodeKind::Epic, "Core engine", Some(project))
        .unwrap();
    let feature = engine
        .create_work_item(NodeKind::Feature, "Propagation", Some(epic))
        .unwrap();
    let story = engine
        .create_work_item(NodeKind::Story, "Rollup chain", Some(feature))
        .unwrap();
    let task_a = engine
        .create_work_item(NodeKind::Task, "Write the walker", Some(story))
        .unwrap();
    let task_b = engine
        .create_work_item(NodeKind::Task, "Test the walker", Some(story))
        .unwrap();

    Tree {
        dir,
        engine,
        project,
        epic,
        feature,
        story,
        task_a,
        task_b,
    }
}

pub fn read_record(path: &Path) -> AggregateRecord {
    let bytes = std::fs::read(path).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// The story directory that holds `S0001.md`, its tasks and `state.json`.
pub fn story_dir(tree: &Tree) -> std::path::PathBuf {
    tree.dir
        .path()
        .join("E0001-core-engine")
        .join("F0001-propagation")
        .join("S0001-rollup-chain")
}
