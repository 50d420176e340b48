//! Debounced change dispatch.
//!
//! Watcher events are coalesced per path inside a 250 ms window; when the
//! window closes, all due paths go out as one propagation batch. Writes
//! performed by the engine itself are registered in a short-lived set and
//! the first matching watcher event is dropped, so a reconcile or a chain
//! write does not re-trigger itself.
//!
//! Per-path lifecycle:
//!
//! ```text
//! Idle --event--> Debouncing
//! Debouncing --event--> Debouncing (timer reset)
//! Debouncing --timeout--> Dispatched
//! Dispatched --completion--> Idle
//! Dispatched --event--> Requeued
//! Requeued --completion--> Debouncing
//! ```

use crate::engine::Engine;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Coalescing window for a burst of events on one path.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

/// How long a recorded self-write stays eligible for suppression.
const SELF_WRITE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct SelfWrite {
    path: PathBuf,
    hash: u64,
    at: std::time::Instant,
}

/// Writes the engine performed recently, keyed by path and content hash.
/// The first watcher event matching either coordinate is suppressed.
#[derive(Debug, Default)]
pub struct SelfWriteSet {
    entries: Mutex<Vec<SelfWrite>>,
}

impl SelfWriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        bytes.hash(&mut hasher);
        hasher.finish()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SelfWrite>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record(&self, path: &Path, bytes: &[u8]) {
        let mut entries = self.lock();
        let now = std::time::Instant::now();
        entries.retain(|e| now.duration_since(e.at) < SELF_WRITE_TTL);
        entries.push(SelfWrite {
            path: path.to_path_buf(),
            hash: Self::hash_bytes(bytes),
            at: now,
        });
    }

    /// True when `path` corresponds to a recorded self-write. The match
    /// is consumed so only the first event is dropped.
    pub(crate) fn consume(&self, path: &Path) -> bool {
        let mut entries = self.lock();
        let now = std::time::Instant::now();
        entries.retain(|e| now.duration_since(e.at) < SELF_WRITE_TTL);

        if let Some(pos) = entries.iter().position(|e| e.path == path) {
            entries.remove(pos);
            return true;
        }
        if let Ok(bytes) = std::fs::read(path) {
            let hash = Self::hash_bytes(&bytes);
            if let Some(pos) = entries.iter().position(|e| e.hash == hash) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathState {
    Debouncing,
    Dispatched,
    Requeued,
}

#[derive(Debug)]
struct PathEntry {
    state: PathState,
    deadline: Instant,
}

/// Handle for feeding change events into the debounce loop.
#[derive(Debug, Clone)]
pub struct ChangeDispatcher {
    tx: mpsc::UnboundedSender<PathBuf>,
}

impl ChangeDispatcher {
    /// Spawn the dispatch loop with the standard window. The loop first
    /// runs a full validation pass, then consumes events until every
    /// handle is dropped; pending debounces are discarded at shutdown
    /// while an in-flight batch always runs to completion.
    pub fn spawn(engine: Arc<Engine>) -> Self {
        Self::spawn_with_window(engine, DEBOUNCE_WINDOW)
    }

    pub fn spawn_with_window(engine: Arc<Engine>, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(engine, rx, window));
        Self { tx }
    }

    /// Feed one path event, from the watcher callback or a test.
    pub fn notify_path(&self, path: PathBuf) {
        let _ = self.tx.send(path);
    }

    /// Attach a recursive filesystem watcher rooted at `root`. The
    /// returned watcher must be kept alive for events to flow.
    pub fn watch(&self, root: &Path) -> notify::Result<RecommendedWatcher> {
        let tx = self.tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in event.paths {
                        if is_tracked(&path) {
                            let _ = tx.send(path);
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "filesystem watch error"),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }
}

/// Record files and work item markdown are tracked; everything else
/// (temp files, editors' scratch) is ignored at the source.
fn is_tracked(path: &Path) -> bool {
    if path.file_name().and_then(|n| n.to_str()) == Some(crate::registry::RECORD_FILE) {
        return true;
    }
    path.extension().and_then(|e| e.to_str()) == Some("md")
}

async fn run_loop(engine: Arc<Engine>, mut rx: mpsc::UnboundedReceiver<PathBuf>, window: Duration) {
    // Fresh start: the dispatcher holds no persistent state, so surface
    // whatever the hierarchy looks like before trusting events.
    engine.validate();

    let mut paths: HashMap<PathBuf, PathEntry> = HashMap::new();

    loop {
        let next_deadline = paths
            .values()
            .filter(|e| e.state == PathState::Debouncing)
            .map(|e| e.deadline)
            .min();

        let received = match next_deadline {
            Some(deadline) => tokio::select! {
                ev = rx.recv() => Some(ev),
                _ = tokio::time::sleep_until(deadline) => None,
            },
            None => Some(rx.recv().await),
        };

        match received {
            Some(Some(path)) => {
                if engine.self_writes().consume(&path) {
                    tracing::debug!(path = %path.display(), "suppressed self-write event");
                    continue;
                }
                accept_event(&mut paths, path, window);
            }
            Some(None) => break, // every handle dropped
            None => {
                let now = Instant::now();
                let due: Vec<PathBuf> = paths
                    .iter()
                    .filter(|(_, e)| e.state == PathState::Debouncing && e.deadline <= now)
                    .map(|(p, _)| p.clone())
                    .collect();
                if due.is_empty() {
                    continue;
                }
                for path in &due {
                    if let Some(entry) = paths.get_mut(path) {
                        entry.state = PathState::Dispatched;
                    }
                }

                engine.propagate_batch(&due);

                // Events that arrived while the batch ran: suppress our
                // own writes, mark externally-touched paths for requeue.
                while let Ok(path) = rx.try_recv() {
                    if engine.self_writes().consume(&path) {
                        continue;
                    }
                    accept_event(&mut paths, path, window);
                }

                for path in &due {
                    match paths.get(path).map(|e| e.state) {
                        Some(PathState::Requeued) => {
                            if let Some(entry) = paths.get_mut(path) {
                                entry.state = PathState::Debouncing;
                                entry.deadline = Instant::now() + window;
                            }
                        }
                        _ => {
                            paths.remove(path);
                        }
                    }
                }
            }
        }
    }
}

fn accept_event(paths: &mut HashMap<PathBuf, PathEntry>, path: PathBuf, window: Duration) {
    let deadline = Instant::now() + window;
    match paths.get_mut(&path) {
        None => {
            paths.insert(
                path,
                PathEntry {
                    state: PathState::Debouncing,
                    deadline,
                },
            );
        }
        Some(entry) => match entry.state {
            PathState::Debouncing => entry.deadline = deadline,
            PathState::Dispatched => entry.state = PathState::Requeued,
            PathState::Requeued => {}
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_writes_match_on_path_once() {
        let set = SelfWriteSet::new();
        let path = Path::new("/tmp/does-not-exist-cascade/state.json");
        set.record(path, b"content");
        assert!(set.consume(path));
        assert!(!set.consume(path), "a match is consumed");
    }

    #[test]
    fn self_writes_match_on_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let recorded = dir.path().join("a").join("state.json");
        let observed = dir.path().join("b").join("state.json");
        std::fs::create_dir_all(recorded.parent().unwrap()).unwrap();
        std::fs::create_dir_all(observed.parent().unwrap()).unwrap();
        std::fs::write(&observed, b"same bytes").unwrap();

        let set = SelfWriteSet::new();
        set.record(&recorded, b"same bytes");
        assert!(set.consume(&observed), "content hash matches");
    }

    #[test]
    fn unknown_events_pass_through() {
        let set = SelfWriteSet::new();
        set.record(Path::new("/x/state.json"), b"one");
        assert!(!set.consume(Path::new("/y/state.json")));
        // The miss must not have consumed the original entry.
        assert!(set.consume(Path::new("/x/state.json")));
    }

    #[test]
    fn tracked_paths_are_records_and_markdown() {
        assert!(is_tracked(Path::new("/root/E0001-x/state.json")));
        assert!(is_tracked(Path::new("/root/E0001-x/T0001.md")));
        assert!(!is_tracked(Path::new("/root/E0001-x/.tmpXYZ")));
        assert!(!is_tracked(Path::new("/root/work-item-registry.json")));
    }
}
