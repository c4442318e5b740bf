//! Where a worker gets tasks from and reports results to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::api::types::{ClaimQuery, ErrorBody, SubmitResultRequest, TaskResponse};
use crate::error::{AgentError, Error, TaskError};
use crate::model::{ClaimedTask, TaskId, TaskOutcome, WorkerCapabilities};
use crate::scheduler::Scheduler;

/// Claim/submit boundary as seen by a worker.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Claim the next ready task. `Ok(None)` when nothing is ready.
    async fn claim(&self, worker: &WorkerCapabilities) -> Result<Option<ClaimedTask>, Error>;

    /// Report the outcome of a claimed task.
    ///
    /// Protocol rejections come back as `Error::Task`.
    async fn submit(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<(), Error>;
}

// ── HTTP ────────────────────────────────────────────────────────────────

/// Talks to a remote orchestrator over its `/internal/task` endpoints.
pub struct HttpTaskSource {
    client: reqwest::Client,
    task_url: String,
}

impl HttpTaskSource {
    pub fn new(client: reqwest::Client, orchestrator_url: &str) -> Self {
        Self {
            client,
            task_url: format!("{}/internal/task", orchestrator_url.trim_end_matches('/')),
        }
    }

    /// Build a client with request timeouts suitable for polling.
    pub fn client() -> Result<reqwest::Client, AgentError> {
        Ok(reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?)
    }
}

/// Read an error body, falling back to the raw text.
async fn error_body(response: reqwest::Response) -> ErrorBody {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str(&text).unwrap_or(ErrorBody {
        error: text,
        code: None,
    })
}

#[async_trait]
impl TaskSource for HttpTaskSource {
    async fn claim(&self, worker: &WorkerCapabilities) -> Result<Option<ClaimedTask>, Error> {
        let operators = (!worker.operators.is_empty()).then(|| {
            worker
                .operators
                .iter()
                .map(|op| op.name())
                .collect::<Vec<_>>()
                .join(",")
        });
        let query = ClaimQuery {
            worker_id: Some(worker.worker_id.clone()),
            operators,
        };

        let response = self
            .client
            .get(&self.task_url)
            .query(&query)
            .send()
            .await
            .map_err(AgentError::from)?;

        match response.status() {
            StatusCode::OK => {
                let body: TaskResponse = response.json().await.map_err(AgentError::from)?;
                Ok(Some(body.task))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = error_body(response).await;
                Err(AgentError::UnexpectedStatus {
                    status: status.as_u16(),
                    body: body.error,
                }
                .into())
            }
        }
    }

    async fn submit(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<(), Error> {
        let response = self
            .client
            .post(&self.task_url)
            .json(&SubmitResultRequest::from_outcome(task_id, outcome))
            .send()
            .await
            .map_err(AgentError::from)?;

        let status = response.status();
        if status.is_success() {
            debug!(task_id, "Result delivered");
            return Ok(());
        }

        let body = error_body(response).await;
        if let Some(rejection) = body
            .code
            .as_deref()
            .and_then(|code| TaskError::from_code(code, task_id))
        {
            return Err(rejection.into());
        }
        Err(AgentError::UnexpectedStatus {
            status: status.as_u16(),
            body: body.error,
        }
        .into())
    }
}

// ── In-process ──────────────────────────────────────────────────────────

/// Calls a [`Scheduler`] directly, for single-process deployments and tests.
pub struct LocalTaskSource {
    scheduler: Arc<Scheduler>,
}

impl LocalTaskSource {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl TaskSource for LocalTaskSource {
    async fn claim(&self, worker: &WorkerCapabilities) -> Result<Option<ClaimedTask>, Error> {
        self.scheduler.claim_next(worker).await
    }

    async fn submit(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<(), Error> {
        self.scheduler.submit_result(task_id, outcome).await?;
        Ok(())
    }
}
