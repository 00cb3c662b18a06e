//! Filesystem provider: JSONL histories and queues under one root
//! directory. Built for durability and crash-recovery tests, not for
//! production storage.
//!
//! Layout:
//!
//! ```text
//! root/
//!   instances/<workflow_id>/run-0001.jsonl   one event per line, append-only
//!   workflow-queue.jsonl                     one queue record per line
//!   worker-queue.jsonl
//!   timer-queue.jsonl
//!   locks/{workflow,worker,timer}/<token>.json
//!   responses/<request_id>.json
//! ```
//!
//! Queue files are rewritten through a temp file and rename; history files
//! only ever grow. A lock is a file holding the taken records and an
//! expiry; a process that dies mid-item leaves the lock behind, and the
//! next fetch past the expiry moves the records back into the queue. The
//! multi-file ack is not atomic, but it is sequenced (history first, then
//! enqueues, then lock removal) so a torn ack converges under redelivery:
//! the history append skips duplicate event ids and the queues
//! deduplicate by value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{Provider, ProviderError, WorkItem, WorkflowItem};
use crate::Event;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    item: WorkItem,
    visible_at_ms: u64,
    attempts: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    workflow_id: Option<String>,
    records: Vec<QueueRecord>,
    locked_until_ms: u64,
}

#[derive(Clone, Copy)]
enum Queue {
    Workflow,
    Worker,
    Timer,
}

impl Queue {
    fn file_name(self) -> &'static str {
        match self {
            Queue::Workflow => "workflow-queue.jsonl",
            Queue::Worker => "worker-queue.jsonl",
            Queue::Timer => "timer-queue.jsonl",
        }
    }

    fn lock_dir(self) -> &'static str {
        match self {
            Queue::Workflow => "workflow",
            Queue::Worker => "worker",
            Queue::Timer => "timer",
        }
    }

    fn token_prefix(self) -> &'static str {
        match self {
            Queue::Workflow => "wf",
            Queue::Worker => "act",
            Queue::Timer => "tmr",
        }
    }
}

/// Provider rooted at a directory. All state survives process restarts.
pub struct FsProvider {
    root: PathBuf,
    /// Serializes file access within this process; cross-process safety is
    /// out of scope for this provider.
    io: Mutex<()>,
    token_counter: std::sync::atomic::AtomicU64,
}

impl FsProvider {
    /// Open a store rooted at `root`. With `reset_on_create`, existing
    /// data under the root is deleted first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let root = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&root);
        }
        let _ = std::fs::create_dir_all(root.join("instances"));
        let _ = std::fs::create_dir_all(root.join("responses"));
        for queue in [Queue::Workflow, Queue::Worker, Queue::Timer] {
            let _ = std::fs::create_dir_all(root.join("locks").join(queue.lock_dir()));
        }
        Self {
            root,
            io: Mutex::new(()),
            token_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn queue_path(&self, queue: Queue) -> PathBuf {
        self.root.join(queue.file_name())
    }

    fn lock_path(&self, queue: Queue, token: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(queue.lock_dir())
            .join(format!("{token}.json"))
    }

    fn instance_dir(&self, workflow_id: &str) -> PathBuf {
        self.root.join("instances").join(workflow_id)
    }

    fn run_path(&self, workflow_id: &str, run_id: u64) -> PathBuf {
        self.instance_dir(workflow_id).join(format!("run-{run_id:04}.jsonl"))
    }

    fn response_path(&self, request_id: &str) -> PathBuf {
        self.root.join("responses").join(format!("{request_id}.json"))
    }

    fn next_token(&self, queue: Queue) -> String {
        let n = self
            .token_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{}-{nanos:x}-{n:04}", queue.token_prefix())
    }

    fn read_records(&self, queue: Queue) -> Vec<QueueRecord> {
        let content = std::fs::read_to_string(self.queue_path(queue)).unwrap_or_default();
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<QueueRecord>(l).ok())
            .collect()
    }

    fn write_records(&self, queue: Queue, records: &[QueueRecord]) -> Result<(), ProviderError> {
        let path = self.queue_path(queue);
        let tmp = path.with_extension("jsonl.tmp");
        let mut buf = String::new();
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| ProviderError::permanent("write_queue", e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        std::fs::write(&tmp, buf.as_bytes()).map_err(|e| ProviderError::from_io("write_queue", &e))?;
        std::fs::rename(&tmp, &path).map_err(|e| ProviderError::from_io("write_queue", &e))?;
        Ok(())
    }

    fn enqueue_records(
        &self,
        queue: Queue,
        items: Vec<WorkItem>,
        visible_at_ms: u64,
    ) -> Result<(), ProviderError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut records = self.read_records(queue);
        for item in items {
            if records.iter().any(|r| r.item == item) {
                continue;
            }
            records.push(QueueRecord {
                item,
                visible_at_ms,
                attempts: 0,
            });
        }
        self.write_records(queue, &records)
    }

    fn read_lock(&self, queue: Queue, token: &str) -> Option<LockRecord> {
        let content = std::fs::read_to_string(self.lock_path(queue, token)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_lock(&self, queue: Queue, token: &str, lock: &LockRecord) -> Result<(), ProviderError> {
        let content = serde_json::to_string(lock)
            .map_err(|e| ProviderError::permanent("write_lock", e.to_string()))?;
        std::fs::write(self.lock_path(queue, token), content)
            .map_err(|e| ProviderError::from_io("write_lock", &e))
    }

    fn remove_lock(&self, queue: Queue, token: &str) {
        let _ = std::fs::remove_file(self.lock_path(queue, token));
    }

    /// Move records from expired locks back to the front of their queue.
    fn reclaim_expired(&self, queue: Queue, now: u64) -> Result<(), ProviderError> {
        let dir = self.root.join("locks").join(queue.lock_dir());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        let mut reclaimed = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(lock) = serde_json::from_str::<LockRecord>(&content) else {
                continue;
            };
            if lock.locked_until_ms <= now {
                reclaimed.extend(lock.records);
                let _ = std::fs::remove_file(&path);
            }
        }
        if !reclaimed.is_empty() {
            let mut records = self.read_records(queue);
            for record in reclaimed.into_iter().rev() {
                records.insert(0, record);
            }
            self.write_records(queue, &records)?;
        }
        Ok(())
    }

    /// Active (non-expired) workflow locks, by workflow id.
    fn locked_workflow_ids(&self, now: u64) -> Vec<String> {
        let dir = self.root.join("locks").join(Queue::Workflow.lock_dir());
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if let Ok(content) = std::fs::read_to_string(entry.path()) {
                    if let Ok(lock) = serde_json::from_str::<LockRecord>(&content) {
                        if lock.locked_until_ms > now {
                            if let Some(id) = lock.workflow_id {
                                out.push(id);
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn read_run_file(&self, workflow_id: &str, run_id: u64) -> Vec<Event> {
        let content = std::fs::read_to_string(self.run_path(workflow_id, run_id)).unwrap_or_default();
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Event>(l).ok())
            .collect()
    }

    fn latest_run_id(&self, workflow_id: &str) -> Option<u64> {
        let dir = self.instance_dir(workflow_id);
        let entries = std::fs::read_dir(dir).ok()?;
        let mut max = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(num) = name.strip_prefix("run-").and_then(|s| s.strip_suffix(".jsonl")) {
                if let Ok(id) = num.parse::<u64>() {
                    max = Some(max.map_or(id, |m: u64| m.max(id)));
                }
            }
        }
        max
    }

    /// Append events to a run file, skipping event ids at or below the
    /// current tail. Redelivered deltas restage the same ids.
    fn append_run_file(
        &self,
        workflow_id: &str,
        run_id: u64,
        events: Vec<Event>,
    ) -> Result<(), ProviderError> {
        std::fs::create_dir_all(self.instance_dir(workflow_id))
            .map_err(|e| ProviderError::from_io("append_run", &e))?;
        let existing = self.read_run_file(workflow_id, run_id);
        let last_id = existing.last().map(|e| e.event_id).unwrap_or(0);
        let mut buf = String::new();
        for event in events {
            if event.event_id <= last_id {
                continue;
            }
            let line = serde_json::to_string(&event)
                .map_err(|e| ProviderError::permanent("append_run", e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        if buf.is_empty() {
            return Ok(());
        }
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_path(workflow_id, run_id))
            .map_err(|e| ProviderError::from_io("append_run", &e))?;
        file.write_all(buf.as_bytes())
            .map_err(|e| ProviderError::from_io("append_run", &e))?;
        file.flush().map_err(|e| ProviderError::from_io("append_run", &e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Provider for FsProvider {
    async fn fetch_workflow_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<WorkflowItem>, ProviderError> {
        let _guard = self.io.lock().await;
        let now = now_ms();
        self.reclaim_expired(Queue::Workflow, now)?;

        let records = self.read_records(Queue::Workflow);
        let locked = self.locked_workflow_ids(now);
        let candidate = records
            .iter()
            .find(|r| r.visible_at_ms <= now && !locked.contains(&r.item.workflow_id().to_string()))
            .map(|r| r.item.workflow_id().to_string());
        let workflow_id = match candidate {
            Some(id) => id,
            None => return Ok(None),
        };

        let mut taken = Vec::new();
        let mut rest = Vec::new();
        for record in records {
            if record.item.workflow_id() == workflow_id && record.visible_at_ms <= now {
                taken.push(record);
            } else {
                rest.push(record);
            }
        }
        for record in taken.iter_mut() {
            record.attempts += 1;
        }

        let token = self.next_token(Queue::Workflow);
        self.write_lock(
            Queue::Workflow,
            &token,
            &LockRecord {
                workflow_id: Some(workflow_id.clone()),
                records: taken.clone(),
                locked_until_ms: now + lock_timeout.as_millis() as u64,
            },
        )?;
        self.write_records(Queue::Workflow, &rest)?;

        let run_id = self.latest_run_id(&workflow_id).unwrap_or(0);
        let history = if run_id == 0 {
            Vec::new()
        } else {
            self.read_run_file(&workflow_id, run_id)
        };
        let attempt_count = taken.iter().map(|r| r.attempts).max().unwrap_or(1);
        let messages = taken.into_iter().map(|r| r.item).collect();

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
        let _guard = self.io.lock().await;
        let lock = self
            .read_lock(Queue::Workflow, lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_workflow_item", "unknown lock token"))?;
        let workflow_id = lock
            .workflow_id
            .ok_or_else(|| ProviderError::permanent("ack_workflow_item", "lock has no workflow id"))?;
        if !history_delta.is_empty() {
            if run_id == 0 {
                return Err(ProviderError::permanent(
                    "ack_workflow_item",
                    "history delta without a run id",
                ));
            }
            self.append_run_file(&workflow_id, run_id, history_delta)?;
        }
        let now = now_ms();
        self.enqueue_records(Queue::Worker, worker_items, now)?;
        self.enqueue_records(Queue::Timer, timer_items, now)?;
        self.enqueue_records(Queue::Workflow, workflow_items, now)?;
        self.remove_lock(Queue::Workflow, lock_token);
        Ok(())
    }

    async fn abandon_workflow_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let _guard = self.io.lock().await;
        let lock = self
            .read_lock(Queue::Workflow, lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_workflow_item", "unknown lock token"))?;
        let visible_at = now_ms() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        let mut records = self.read_records(Queue::Workflow);
        for mut record in lock.records.into_iter().rev() {
            record.visible_at_ms = visible_at;
            records.insert(0, record);
        }
        self.write_records(Queue::Workflow, &records)?;
        self.remove_lock(Queue::Workflow, lock_token);
        Ok(())
    }

    async fn enqueue_workflow_work(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let _guard = self.io.lock().await;
        let visible_at = now_ms() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.enqueue_records(Queue::Workflow, vec![item], visible_at)
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let _guard = self.io.lock().await;
        let now = now_ms();
        self.reclaim_expired(Queue::Worker, now)?;
        let mut records = self.read_records(Queue::Worker);
        let idx = match records.iter().position(|r| r.visible_at_ms <= now) {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let mut record = records.remove(idx);
        record.attempts += 1;
        let item = record.item.clone();
        let token = self.next_token(Queue::Worker);
        self.write_lock(
            Queue::Worker,
            &token,
            &LockRecord {
                workflow_id: None,
                records: vec![record],
                locked_until_ms: now + lock_timeout.as_millis() as u64,
            },
        )?;
        self.write_records(Queue::Worker, &records)?;
        Ok(Some((item, token)))
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let _guard = self.io.lock().await;
        if self.read_lock(Queue::Worker, token).is_none() {
            return Err(ProviderError::permanent("ack_work_item", "unknown lock token"));
        }
        self.enqueue_records(Queue::Workflow, vec![completion], now_ms())?;
        self.remove_lock(Queue::Worker, token);
        Ok(())
    }

    async fn renew_work_lock(&self, token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let _guard = self.io.lock().await;
        let mut lock = self
            .read_lock(Queue::Worker, token)
            .ok_or_else(|| ProviderError::permanent("renew_work_lock", "unknown lock token"))?;
        lock.locked_until_ms = now_ms() + extend_for.as_millis() as u64;
        self.write_lock(Queue::Worker, token, &lock)
    }

    async fn fetch_timer_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let _guard = self.io.lock().await;
        let now = now_ms();
        self.reclaim_expired(Queue::Timer, now)?;
        let mut records = self.read_records(Queue::Timer);
        let idx = match records.iter().position(|r| r.visible_at_ms <= now) {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let mut record = records.remove(idx);
        record.attempts += 1;
        let item = record.item.clone();
        let token = self.next_token(Queue::Timer);
        self.write_lock(
            Queue::Timer,
            &token,
            &LockRecord {
                workflow_id: None,
                records: vec![record],
                locked_until_ms: now + lock_timeout.as_millis() as u64,
            },
        )?;
        self.write_records(Queue::Timer, &records)?;
        Ok(Some((item, token)))
    }

    async fn ack_timer_item(&self, token: &str) -> Result<(), ProviderError> {
        let _guard = self.io.lock().await;
        if self.read_lock(Queue::Timer, token).is_none() {
            return Err(ProviderError::permanent("ack_timer_item", "unknown lock token"));
        }
        self.remove_lock(Queue::Timer, token);
        Ok(())
    }

    async fn read(&self, workflow_id: &str) -> Result<Vec<Event>, ProviderError> {
        let _guard = self.io.lock().await;
        match self.latest_run_id(workflow_id) {
            Some(run_id) => Ok(self.read_run_file(workflow_id, run_id)),
            None => Ok(Vec::new()),
        }
    }

    async fn read_run(&self, workflow_id: &str, run_id: u64) -> Result<Vec<Event>, ProviderError> {
        let _guard = self.io.lock().await;
        Ok(self.read_run_file(workflow_id, run_id))
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
        let _guard = self.io.lock().await;
        self.append_run_file(workflow_id, run_id, events)
    }

    async fn latest_run(&self, workflow_id: &str) -> Result<Option<u64>, ProviderError> {
        let _guard = self.io.lock().await;
        Ok(self.latest_run_id(workflow_id))
    }

    async fn list_workflows(&self) -> Result<Vec<String>, ProviderError> {
        let _guard = self.io.lock().await;
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.root.join("instances")) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        out.push(name.to_string());
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn put_response(&self, request_id: &str, payload: String) -> Result<(), ProviderError> {
        let _guard = self.io.lock().await;
        std::fs::write(self.response_path(request_id), payload)
            .map_err(|e| ProviderError::from_io("put_response", &e))
    }

    async fn take_response(&self, request_id: &str) -> Result<Option<String>, ProviderError> {
        let _guard = self.io.lock().await;
        let path = self.response_path(request_id);
        match std::fs::read_to_string(&path) {
            Ok(payload) => {
                let _ = std::fs::remove_file(&path);
                Ok(Some(payload))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::from_io("take_response", &e)),
        }
    }
}
