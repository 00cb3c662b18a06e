//! Client for starting, signalling, querying, and observing workflows.
//!
//! The client talks to the runtime exclusively through the shared provider:
//! control operations enqueue workflow messages, request/response operations
//! poll the provider's response slots. It can therefore run in any process
//! that can reach the store, with or without a runtime alongside.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{Provider, ProviderError, WorkItem};
use crate::{Event, UpdateOutcome, WorkflowStatus};

/// Poll cadence for response slots and status waits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Client-side failure. Workflow-level outcomes (a rejected update, a
/// failed run) are values, not errors; this enum covers the request
/// itself going wrong.
#[derive(Debug)]
pub enum ClientError {
    /// The workflow id already has a run; ids are single-use.
    AlreadyExists,
    /// No run exists for the workflow id.
    NotFound,
    /// The deadline elapsed before the runtime answered.
    Timeout,
    /// A handler reported an error for this request.
    Handler(String),
    /// Storage failure.
    Provider(ProviderError),
    /// Payload (de)serialization failure.
    Codec(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "workflow id already has a run"),
            Self::NotFound => write!(f, "workflow not found"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Handler(msg) => write!(f, "handler error: {msg}"),
            Self::Provider(e) => write!(f, "provider error: {e}"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

/// Options for [`WorkflowClient::start_workflow_with`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Exact handler version to pin; `None` resolves by registry policy.
    pub version: Option<String>,
    /// Start-to-close bound for the run, in milliseconds.
    pub execution_timeout_ms: Option<u64>,
}

pub struct WorkflowClient {
    store: Arc<dyn Provider>,
}

impl WorkflowClient {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start a workflow. The id names the history log for the whole chain
    /// of runs and is single-use: an id that already has history fails
    /// with [`ClientError::AlreadyExists`].
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        name: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_workflow_with(workflow_id, name, input, StartOptions::default())
            .await
    }

    /// Start pinned to an exact registered version.
    pub async fn start_workflow_versioned(
        &self,
        workflow_id: &str,
        name: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_workflow_with(
            workflow_id,
            name,
            input,
            StartOptions {
                version: Some(version.into()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn start_workflow_with(
        &self,
        workflow_id: &str,
        name: &str,
        input: impl Into<String>,
        options: StartOptions,
    ) -> Result<(), ClientError> {
        // Best-effort duplicate check; the runtime also drops a late start
        // whose id grew history in the meantime.
        if !self.store.read(workflow_id).await?.is_empty() {
            return Err(ClientError::AlreadyExists);
        }
        let item = WorkItem::StartWorkflow {
            workflow_id: workflow_id.to_string(),
            name: name.to_string(),
            version: options.version,
            input: input.into(),
            timeout_ms: options.execution_timeout_ms,
        };
        self.store.enqueue_workflow_work(item, None).await?;
        Ok(())
    }

    /// Start with JSON-encoded input.
    pub async fn start_workflow_typed<In: Serialize>(
        &self,
        workflow_id: &str,
        name: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.start_workflow(workflow_id, name, payload).await
    }

    /// Deliver a signal. Fire-and-forget; the runtime drops signals for
    /// unknown ids or closed runs with a warning.
    pub async fn signal(
        &self,
        workflow_id: &str,
        name: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        let item = WorkItem::SignalWorkflow {
            workflow_id: workflow_id.to_string(),
            name: name.to_string(),
            input: input.into(),
        };
        self.store.enqueue_workflow_work(item, None).await?;
        Ok(())
    }

    pub async fn signal_typed<In: Serialize>(
        &self,
        workflow_id: &str,
        name: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.signal(workflow_id, name, payload).await
    }

    /// Request cancellation. Cooperative: the run ends Cancelled only when
    /// its code lets the cancellation error propagate out.
    pub async fn cancel(
        &self,
        workflow_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        let item = WorkItem::CancelWorkflow {
            workflow_id: workflow_id.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_workflow_work(item, None).await?;
        Ok(())
    }

    /// Read handler state synchronously. Enqueues the request and polls
    /// the response slot until `timeout`.
    pub async fn query(
        &self,
        workflow_id: &str,
        name: &str,
        input: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, ClientError> {
        let query_id = request_id("q", workflow_id);
        let item = WorkItem::QueryRequest {
            workflow_id: workflow_id.to_string(),
            query_id: query_id.clone(),
            name: name.to_string(),
            input: input.into(),
        };
        self.store.enqueue_workflow_work(item, None).await?;
        let payload = self.await_response(&query_id, timeout).await?;
        let result: Result<String, String> = Json::decode(&payload).map_err(ClientError::Codec)?;
        result.map_err(ClientError::Handler)
    }

    pub async fn query_typed<In: Serialize, Out: DeserializeOwned>(
        &self,
        workflow_id: &str,
        name: &str,
        input: &In,
        timeout: Duration,
    ) -> Result<Out, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        let out = self.query(workflow_id, name, payload, timeout).await?;
        Json::decode(&out).map_err(ClientError::Codec)
    }

    /// Execute an update and wait for its outcome. A rejection is a normal
    /// return, not an `Err`: it proves the run's history was untouched.
    pub async fn update(
        &self,
        workflow_id: &str,
        name: &str,
        input: impl Into<String>,
        timeout: Duration,
    ) -> Result<UpdateOutcome, ClientError> {
        let update_id = request_id("u", workflow_id);
        let item = WorkItem::UpdateRequest {
            workflow_id: workflow_id.to_string(),
            update_id: update_id.clone(),
            name: name.to_string(),
            input: input.into(),
        };
        self.store.enqueue_workflow_work(item, None).await?;
        let payload = self.await_response(&update_id, timeout).await?;
        Json::decode(&payload).map_err(ClientError::Codec)
    }

    /// Typed update: an accepted outcome decodes to `Out`, a rejection
    /// becomes [`ClientError::Handler`].
    pub async fn update_typed<In: Serialize, Out: DeserializeOwned>(
        &self,
        workflow_id: &str,
        name: &str,
        input: &In,
        timeout: Duration,
    ) -> Result<Out, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        match self.update(workflow_id, name, payload, timeout).await? {
            UpdateOutcome::Accepted(out) => Json::decode(&out).map_err(ClientError::Codec),
            UpdateOutcome::Rejected(reason) => Err(ClientError::Handler(reason)),
        }
    }

    /// Status of the latest run.
    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowStatus, ClientError> {
        let history = self.store.read(workflow_id).await?;
        Ok(WorkflowStatus::from_history(&history))
    }

    /// Poll until the latest run reaches a terminal status. Follows
    /// continue-as-new chains, since each successor becomes the latest run.
    pub async fn wait_for_completion(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(workflow_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// The latest run's full history.
    pub async fn read_history(&self, workflow_id: &str) -> Result<Vec<Event>, ClientError> {
        let history = self.store.read(workflow_id).await?;
        if history.is_empty() {
            return Err(ClientError::NotFound);
        }
        Ok(history)
    }

    pub async fn list_workflows(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_workflows().await?)
    }

    async fn await_response(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<String, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(payload) = self.store.take_response(request_id).await? {
                return Ok(payload);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Process-unique id for a response slot.
fn request_id(prefix: &str, workflow_id: &str) -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{prefix}-{workflow_id}-{nanos:x}-{seq}")
}
