#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use workloom::providers::{FsProvider, InMemoryProvider, Provider};
use workloom::{Event, EventKind};

/// Fresh in-memory store for single-process tests.
pub fn memory_store() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::new())
}

/// Filesystem store rooted in a temp dir. Keep the `TempDir` alive for the
/// duration of the test or the root disappears under the provider.
pub fn fs_store() -> (Arc<dyn Provider>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsProvider::new(dir.path(), true));
    (store, dir)
}

/// Reopen a filesystem store on an existing root, as a restarted process
/// would.
pub fn reopen_fs_store(dir: &TempDir) -> Arc<dyn Provider> {
    Arc::new(FsProvider::new(dir.path(), false))
}

/// Poll the latest run's history until it has at least `min_events` events.
pub async fn wait_for_history(
    store: &Arc<dyn Provider>,
    workflow_id: &str,
    min_events: usize,
    timeout: Duration,
) -> Vec<Event> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let history = store.read(workflow_id).await.unwrap();
        if history.len() >= min_events {
            return history;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "workflow '{workflow_id}' did not reach {min_events} events within {timeout:?}; history: {history:#?}"
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll the latest run's history until some event matches the predicate.
pub async fn wait_for_history_event(
    store: &Arc<dyn Provider>,
    workflow_id: &str,
    timeout: Duration,
    pred: impl Fn(&EventKind) -> bool,
) -> Vec<Event> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let history = store.read(workflow_id).await.unwrap();
        if history.iter().any(|e| pred(&e.kind)) {
            return history;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("workflow '{workflow_id}' never produced the expected event; history: {history:#?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Count events matching a predicate.
pub fn count_events(history: &[Event], pred: impl Fn(&EventKind) -> bool) -> usize {
    history.iter().filter(|e| pred(&e.kind)).count()
}
