//! Debounce coalescing and self-write suppression, driven through the
//! dispatch loop with injected events.

mod common;

use cascade_store::{ChangeDispatcher, EngineEvent, RECORD_FILE};
use common::{build_tree, story_dir};
use std::sync::Arc;
use std::time::Duration;

const WINDOW: Duration = Duration::from_millis(150);

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

/// Wait out the self-write suppression window, so writes made while
/// building the fixture cannot swallow the first injected event.
async fn settle(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) {
    tokio::time::sleep(Duration::from_millis(2100)).await;
    drain(rx);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_burst_of_events_coalesces_into_one_batch() {
    let tree = build_tree();
    let task_md = story_dir(&tree).join(format!("{}.md", tree.task_a));

    // External edit, then a burst of five change events for the same
    // path inside the window.
    let text = std::fs::read_to_string(&task_md)
        .unwrap()
        .replace("status: planned", "status: completed");
    std::fs::write(&task_md, text).unwrap();

    let engine = Arc::new(tree.engine);
    let mut rx = engine.subscribe();
    let dispatcher = ChangeDispatcher::spawn_with_window(engine.clone(), WINDOW);
    settle(&mut rx).await;

    for _ in 0..5 {
        dispatcher.notify_path(task_md.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(WINDOW * 3).await;

    let propagated = drain(&mut rx)
        .into_iter()
        .filter(|ev| matches!(ev, EngineEvent::Propagated { .. }))
        .count();
    assert_eq!(propagated, 4, "one chain: story, feature, epic, project");
}

#[tokio::test(flavor = "multi_thread")]
async fn each_event_resets_the_window() {
    let tree = build_tree();
    let task_md = story_dir(&tree).join(format!("{}.md", tree.task_a));
    let text = std::fs::read_to_string(&task_md)
        .unwrap()
        .replace("status: planned", "status: in-progress");
    std::fs::write(&task_md, text).unwrap();

    let engine = Arc::new(tree.engine);
    let mut rx = engine.subscribe();
    let dispatcher = ChangeDispatcher::spawn_with_window(engine.clone(), WINDOW);
    settle(&mut rx).await;

    // Keep poking inside the window: no dispatch may happen yet.
    for _ in 0..4 {
        dispatcher.notify_path(task_md.clone());
        tokio::time::sleep(WINDOW / 3).await;
    }
    assert_eq!(
        drain(&mut rx)
            .into_iter()
            .filter(|ev| matches!(ev, EngineEvent::Propagated { .. }))
            .count(),
        0,
        "still debouncing while events keep arriving"
    );

    tokio::time::sleep(WINDOW * 3).await;
    let propagated = drain(&mut rx)
        .into_iter()
        .filter(|ev| matches!(ev, EngineEvent::Propagated { .. }))
        .count();
    assert_eq!(propagated, 4, "exactly one batch after the burst ends");
}

#[tokio::test(flavor = "multi_thread")]
async fn reconcile_writes_do_not_retrigger_a_chain() {
    let tree = build_tree();
    let story_record = story_dir(&tree).join(RECORD_FILE);

    // Plant a divergence so the first dispatch makes the reconciler
    // rewrite the record.
    let mut rec: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&story_record).unwrap()).unwrap();
    rec["children"]["T0001"] = serde_json::json!({ "status": "completed", "progress": 100 });
    rec["children"]["T0002"] = serde_json::json!({ "status": "completed", "progress": 100 });
    std::fs::write(&story_record, serde_json::to_vec_pretty(&rec).unwrap()).unwrap();

    let engine = Arc::new(tree.engine);
    let mut rx = engine.subscribe();
    let dispatcher = ChangeDispatcher::spawn_with_window(engine.clone(), WINDOW);
    settle(&mut rx).await;

    dispatcher.notify_path(story_record.clone());
    tokio::time::sleep(WINDOW * 3).await;

    let first_pass = drain(&mut rx);
    assert_eq!(
        first_pass
            .iter()
            .filter(|ev| matches!(ev, EngineEvent::AutoFixed { .. }))
            .count(),
        1
    );

    // The watcher would now report the engine's own rewrite. Replay it:
    // the dispatcher must swallow it instead of starting a second chain.
    dispatcher.notify_path(story_record.clone());
    tokio::time::sleep(WINDOW * 3).await;

    let second_pass = drain(&mut rx);
    assert!(
        second_pass
            .iter()
            .all(|ev| !matches!(ev, EngineEvent::AutoFixed { .. } | EngineEvent::Propagated { .. })),
        "self-write event replay must be suppressed, got {:?}",
        second_pass
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn distinct_paths_dispatch_as_one_batch_of_two_chains() {
    let tree = build_tree();
    let md_a = story_dir(&tree).join(format!("{}.md", tree.task_a));
    let md_b = story_dir(&tree).join(format!("{}.md", tree.task_b));
    for md in [&md_a, &md_b] {
        let text = std::fs::read_to_string(md)
            .unwrap()
            .replace("status: planned", "status: completed");
        std::fs::write(md, text).unwrap();
    }

    let engine = Arc::new(tree.engine);
    let mut rx = engine.subscribe();
    let dispatcher = ChangeDispatcher::spawn_with_window(engine.clone(), WINDOW);
    settle(&mut rx).await;

    dispatcher.notify_path(md_a);
    dispatcher.notify_path(md_b);
    tokio::time::sleep(WINDOW * 3).await;

    let events = drain(&mut rx);
    let story_updates = events
        .iter()
        .filter(|ev| matches!(ev, EngineEvent::Propagated { id, .. } if *id == tree.story))
        .count();
    // First chain takes the story to 50%, second to 100%. Both chains ran
    // out of one window.
    assert_eq!(story_updates, 2);
    let completed_at_root = events.iter().any(|ev| {
        matches!(ev, EngineEvent::Propagated { id, percentage: 100, .. } if *id == tree.project)
    });
    assert!(completed_at_root);
}
