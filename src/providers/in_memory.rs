//! In-memory provider: the reference implementation of the storage
//! contract. One mutex over all state makes the atomic ack trivial, which
//! is exactly what the runtime tests need.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;

use super::{Provider, ProviderError, WorkItem, WorkflowItem};
use crate::Event;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Entry {
    item: WorkItem,
    visible_at_ms: u64,
    attempts: u32,
}

#[derive(Debug)]
struct LockedBatch {
    workflow_id: String,
    entries: Vec<Entry>,
    locked_until_ms: u64,
}

#[derive(Debug)]
struct LockedEntry {
    entry: Entry,
    locked_until_ms: u64,
}

#[derive(Default)]
struct Inner {
    /// workflow_id -> runs; run_id N lives at index N-1.
    histories: HashMap<String, Vec<Vec<Event>>>,
    workflow_q: Vec<Entry>,
    worker_q: Vec<Entry>,
    timer_q: Vec<Entry>,
    locked_workflows: HashMap<String, LockedBatch>,
    locked_worker: HashMap<String, LockedEntry>,
    locked_timer: HashMap<String, LockedEntry>,
    responses: HashMap<String, String>,
    token_counter: u64,
}

impl Inner {
    fn next_token(&mut self, prefix: &str) -> String {
        self.token_counter += 1;
        format!("{prefix}-{:08}", self.token_counter)
    }

    /// Move expired workflow locks back onto the queue. Attempt counts were
    /// bumped at delivery, so reclaim does not bump again.
    fn reclaim_expired(&mut self, now: u64) {
        let expired: Vec<String> = self
            .locked_workflows
            .iter()
            .filter(|(_, b)| b.locked_until_ms <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(batch) = self.locked_workflows.remove(&token) {
                for entry in batch.entries {
                    self.workflow_q.insert(0, entry);
                }
            }
        }
        let expired: Vec<String> = self
            .locked_worker
            .iter()
            .filter(|(_, l)| l.locked_until_ms <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(locked) = self.locked_worker.remove(&token) {
                self.worker_q.insert(0, locked.entry);
            }
        }
        let expired: Vec<String> = self
            .locked_timer
            .iter()
            .filter(|(_, l)| l.locked_until_ms <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(locked) = self.locked_timer.remove(&token) {
                self.timer_q.insert(0, locked.entry);
            }
        }
    }

    fn enqueue(queue: &mut Vec<Entry>, item: WorkItem, visible_at_ms: u64) {
        if queue.iter().any(|e| e.item == item) {
            return;
        }
        queue.push(Entry {
            item,
            visible_at_ms,
            attempts: 0,
        });
    }

    fn append_events(&mut self, workflow_id: &str, run_id: u64, events: Vec<Event>) {
        let runs = self.histories.entry(workflow_id.to_string()).or_default();
        while (runs.len() as u64) < run_id {
            runs.push(Vec::new());
        }
        let run = &mut runs[(run_id - 1) as usize];
        // Redelivered deltas re-stage the same ids; event ids are monotonic
        // within a run, so anything at or below the tail is a duplicate.
        let last_id = run.last().map(|e| e.event_id).unwrap_or(0);
        for event in events {
            if event.event_id > last_id {
                run.push(event);
            }
        }
    }
}

/// Provider backed by process memory. State dies with the process; tests
/// that need durability use [`super::FsProvider`].
#[derive(Default)]
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn fetch_workflow_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<WorkflowItem>, ProviderError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        inner.reclaim_expired(now);

        let locked_ids: Vec<String> = inner
            .locked_workflows
            .values()
            .map(|b| b.workflow_id.clone())
            .collect();
        let candidate = inner
            .workflow_q
            .iter()
            .find(|e| e.visible_at_ms <= now && !locked_ids.contains(&e.item.workflow_id().to_string()))
            .map(|e| e.item.workflow_id().to_string());
        let workflow_id = match candidate {
            Some(id) => id,
            None => return Ok(None),
        };

        // Batch every visible message for this workflow under one lock.
        let mut entries = Vec::new();
        let mut rest = Vec::with_capacity(inner.workflow_q.len());
        for entry in inner.workflow_q.drain(..) {
            if entry.item.workflow_id() == workflow_id && entry.visible_at_ms <= now {
                entries.push(entry);
            } else {
                rest.push(entry);
            }
        }
        inner.workflow_q = rest;
        for entry in entries.iter_mut() {
            entry.attempts += 1;
        }

        let attempt_count = entries.iter().map(|e| e.attempts).max().unwrap_or(1);
        let messages: Vec<WorkItem> = entries.iter().map(|e| e.item.clone()).collect();
        let runs = inner.histories.get(&workflow_id);
        let run_id = runs.map(|r| r.len() as u64).unwrap_or(0);
        let history = runs.and_then(|r| r.last().cloned()).unwrap_or_default();

        let token = inner.next_token("wf");
        inner.locked_workflows.insert(
            token.clone(),
            LockedBatch {
                workflow_id: workflow_id.clone(),
                entries,
                locked_until_ms: now + lock_timeout.as_millis() as u64,
            },
        );

        Ok(Some(WorkflowItem {
            workflow_id,
            run_id,
            history,
            messages,
            lock_token: token,
            attempt_count,
        }))
    }

    async fn ack_workflow_item(
        &self,
        lock_token: &str,
        run_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        workflow_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .locked_workflows
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_workflow_item", "unknown lock token"))?;
        if run_id == 0 && !history_delta.is_empty() {
            return Err(ProviderError::permanent(
                "ack_workflow_item",
                "history delta without a run id",
            ));
        }
        if !history_delta.is_empty() {
            inner.append_events(&batch.workflow_id, run_id, history_delta);
        }
        let now = now_ms();
        for item in worker_items {
            let q = &mut inner.worker_q;
            Inner::enqueue(q, item, now);
        }
        for item in timer_items {
            let q = &mut inner.timer_q;
            Inner::enqueue(q, item, now);
        }
        for item in workflow_items {
            let q = &mut inner.workflow_q;
            Inner::enqueue(q, item, now);
        }
        Ok(())
    }

    async fn abandon_workflow_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .locked_workflows
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_workflow_item", "unknown lock token"))?;
        let visible_at = now_ms() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        for mut entry in batch.entries {
            entry.visible_at_ms = visible_at;
            inner.workflow_q.insert(0, entry);
        }
        Ok(())
    }

    async fn enqueue_workflow_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        let visible_at = now_ms() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        let q = &mut inner.workflow_q;
        Inner::enqueue(q, item, visible_at);
        Ok(())
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        inner.reclaim_expired(now);
        let idx = match inner.worker_q.iter().position(|e| e.visible_at_ms <= now) {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let mut entry = inner.worker_q.remove(idx);
        entry.attempts += 1;
        let item = entry.item.clone();
        let token = inner.next_token("act");
        inner.locked_worker.insert(
            token.clone(),
            LockedEntry {
                entry,
                locked_until_ms: now + lock_timeout.as_millis() as u64,
            },
        );
        Ok(Some((item, token)))
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        inner
            .locked_worker
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("ack_work_item", "unknown lock token"))?;
        let now = now_ms();
        let q = &mut inner.workflow_q;
        Inner::enqueue(q, completion, now);
        Ok(())
    }

    async fn renew_work_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        let locked = inner
            .locked_worker
            .get_mut(token)
            .ok_or_else(|| ProviderError::permanent("renew_work_lock", "unknown lock token"))?;
        locked.locked_until_ms = now_ms() + extend_for.as_millis() as u64;
        Ok(())
    }

    async fn fetch_timer_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        inner.reclaim_expired(now);
        let idx = match inner.timer_q.iter().position(|e| e.visible_at_ms <= now) {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let mut entry = inner.timer_q.remove(idx);
        entry.attempts += 1;
        let item = entry.item.clone();
        let token = inner.next_token("tmr");
        inner.locked_timer.insert(
            token.clone(),
            LockedEntry {
                entry,
                locked_until_ms: now + lock_timeout.as_millis() as u64,
            },
        );
        Ok(Some((item, token)))
    }

    async fn ack_timer_item(&self, token: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        inner
            .locked_timer
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("ack_timer_item", "unknown lock token"))?;
        Ok(())
    }

    async fn read(&self, workflow_id: &str) -> Result<Vec<Event>, ProviderError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .histories
            .get(workflow_id)
            .and_then(|runs| runs.last().cloned())
            .unwrap_or_default())
    }

    async fn read_run(&self, workflow_id: &str, run_id: u64) -> Result<Vec<Event>, ProviderError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .histories
            .get(workflow_id)
            .and_then(|runs| runs.get(run_id.saturating_sub(1) as usize).cloned())
            .unwrap_or_default())
    }

    async fn append_run(
        &self,
        workflow_id: &str,
        run_id: u64,
        events: Vec<Event>,
    ) -> Result<(), ProviderError> {
        if run_id == 0 {
            return Err(ProviderError::permanent("append_run", "run ids start at 1"));
        }
        let mut inner = self.inner.lock().await;
        inner.append_events(workflow_id, run_id, events);
        Ok(())
    }

    async fn latest_run(&self, workflow_id: &str) -> Result<Option<u64>, ProviderError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .histories
            .get(workflow_id)
            .filter(|runs| !runs.is_empty())
            .map(|runs| runs.len() as u64))
    }

    async fn list_workflows(&self) -> Result<Vec<String>, ProviderError> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.histories.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn put_response(&self, request_id: &str, payload: String) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        inner.responses.insert(request_id.to_string(), payload);
        Ok(())
    }

    async fn take_response(&self, request_id: &str) -> Result<Option<String>, ProviderError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.responses.remove(request_id))
    }
}
