//! Load-time reconciliation of diverging aggregate records.

mod common;

use cascade_core::types::Status;
use cascade_store::{EngineEvent, RECORD_FILE};
use common::{build_tree, read_record, story_dir};

/// Rewrite the story record so the stored metrics contradict the child
/// map: children say everything is done, metrics say nothing is.
fn plant_divergence(tree: &common::Tree) {
    let path = story_dir(tree).join(RECORD_FILE);
    let mut rec: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    rec["children"]["T0001"] = serde_json::json!({ "status": "completed", "progress": 100 });
    rec["children"]["T0002"] = serde_json::json!({ "status": "completed", "progress": 100 });
    rec["progress"] = serde_json::json!({
        "total_items": 2,
        "completed": 0,
        "in_progress": 0,
        "planned": 2,
        "percentage": 0
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&rec).unwrap()).unwrap();
}

#[test]
fn divergent_record_is_fixed_on_load_and_reported() {
    let tree = build_tree();
    plant_divergence(&tree);

    let mut rx = tree.engine.subscribe();
    // Any chain that loads the story record triggers the reconciler.
    let story_record = story_dir(&tree).join(RECORD_FILE);
    tree.engine.propagate(&story_record).unwrap();

    let fixed = read_record(&story_record);
    assert_eq!(fixed.progress.completed, 2);
    assert_eq!(fixed.progress.percentage, 100);
    assert_eq!(fixed.status, Status::Completed);

    let mut auto_fixed = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let EngineEvent::AutoFixed { id, before, after } = ev {
            auto_fixed.push((id, before, after));
        }
    }
    assert_eq!(auto_fixed.len(), 1);
    let (id, before, after) = &auto_fixed[0];
    assert_eq!(*id, tree.story);
    assert_eq!(before.percentage, 0);
    assert_eq!(after.percentage, 100);
}

#[test]
fn reconcile_is_idempotent_across_reopens() {
    let tree = build_tree();
    plant_divergence(&tree);
    let story_record = story_dir(&tree).join(RECORD_FILE);

    tree.engine.propagate(&story_record).unwrap();
    let once = std::fs::read(&story_record).unwrap();

    // Startup reconciles every record; the already-fixed record must
    // come through byte-identical.
    drop(tree.engine);
    let _engine = cascade_store::Engine::open(tree.dir.path()).unwrap();

    let twice = std::fs::read(&story_record).unwrap();
    assert_eq!(once, twice, "second reconcile found nothing to fix");
}

#[test]
fn clean_records_never_rewrite_on_load() {
    let tree = build_tree();
    tree.engine.set_status(tree.task_a, Status::InProgress).unwrap();

    let story_record = story_dir(&tree).join(RECORD_FILE);
    let before = std::fs::read(&story_record).unwrap();

    drop(tree.engine);
    let _engine = cascade_store::Engine::open(tree.dir.path()).unwrap();

    let after = std::fs::read(&story_record).unwrap();
    assert_eq!(before, after, "startup reconcile left the clean record alone");
}

#[test]
fn save_then_load_changes_only_the_timestamp() {
    let tree = build_tree();
    let story_record = story_dir(&tree).join(RECORD_FILE);
    let before: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&story_record).unwrap()).unwrap();

    drop(tree.engine);
    let _engine = cascade_store::Engine::open(tree.dir.path()).unwrap();
    let after: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&story_record).unwrap()).unwrap();

    let strip = |mut v: serde_json::Value| {
        v.as_object_mut().unwrap().remove("updated");
        v
    };
    assert_eq!(strip(before), strip(after));
}

#[test]
fn status_is_promoted_but_never_demoted_by_the_reconciler() {
    let tree = build_tree();
    tree.engine.set_status(tree.task_a, Status::Completed).unwrap();
    tree.engine.set_status(tree.task_b, Status::Completed).unwrap();

    let story_record = story_dir(&tree).join(RECORD_FILE);
    assert_eq!(read_record(&story_record).status, Status::Completed);

    // A child regresses behind the engine's back; the stored metrics are
    // stale now, so the reconciler rewrites them, but the completed
    // status holds.
    let mut rec: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&story_record).unwrap()).unwrap();
    rec["children"]["T0002"] = serde_json::json!({ "status": "planned", "progress": 0 });
    std::fs::write(&story_record, serde_json::to_vec_pretty(&rec).unwrap()).unwrap();

    drop(tree.engine);
    let _engine = cascade_store::Engine::open(tree.dir.path()).unwrap();

    let fixed = read_record(&story_record);
    assert_eq!(fixed.progress.percentage, 50, "metrics were corrected");
    assert_eq!(fixed.status, Status::Completed, "status never regresses");
}
