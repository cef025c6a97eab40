//! Status polling for agent APIs that acknowledge a request with a job handle.

use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{RelayError, RemoteFailure};
use crate::event::extract_failure;
use crate::extract::first_assistant_content;

/// Lifecycle status of a queued job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
    /// Status string this crate does not recognize; polling continues.
    Other(String),
}

impl JobStatus {
    pub fn from_wire(status: &str) -> Self {
        match status {
            "created" | "in_progress" | "pending" | "queued" | "running" => Self::Pending,
            "completed" | "succeeded" => Self::Completed,
            "failed" | "canceled" | "cancelled" | "requires_action" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A single message attached to a completed job.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobMessage {
    pub role: String,
    pub content: String,
}

/// One status observation returned by a [`JobStatusSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    /// Explicit error attached to the status, if any.
    pub error: Option<RemoteFailure>,
    /// Messages in order; only meaningful once completed.
    pub messages: Vec<serde_json::Value>,
}

impl JobSnapshot {
    /// Reads a snapshot from a status response body (`data.status`,
    /// `data.messages`, and a non-zero top-level `code` or `data.last_error`
    /// as an explicit error).
    pub fn from_body(body: &serde_json::Value) -> Result<Self, RelayError> {
        let data = body.get("data").unwrap_or(body);
        let status = data
            .get("status")
            .and_then(|v| v.as_str())
            .map(JobStatus::from_wire)
            .ok_or_else(|| RelayError::Decode("status response has no data.status".into()))?;

        let top_level_error = body
            .get("code")
            .and_then(|v| v.as_i64())
            .is_some_and(|code| code != 0);
        let has_last_error = data
            .get("last_error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_i64())
            .is_some_and(|code| code != 0);
        let error = (top_level_error || has_last_error).then(|| extract_failure(body, data));

        let messages = data
            .get("messages")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            status,
            error,
            messages,
        })
    }
}

/// Source of job status observations.
#[async_trait::async_trait]
pub trait JobStatusSource: Send + Sync {
    /// Fetches the current status of `job_id`.
    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, RelayError>;
}

/// Attempt budget and fixed delay for polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(2),
        }
    }
}

/// Polling state for one acknowledged request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollJob {
    pub job_id: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub messages: Vec<JobMessage>,
}

impl PollJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            attempt_count: 0,
            messages: Vec::new(),
        }
    }

    /// Polls until the job completes, fails, or the attempt budget runs out.
    ///
    /// Fetch failures count as attempts but do not stop the loop.
    pub async fn run<S>(&mut self, source: &S, policy: PollPolicy) -> Result<String, RelayError>
    where
        S: JobStatusSource + ?Sized,
    {
        while self.attempt_count < policy.max_attempts {
            self.attempt_count += 1;
            match source.fetch_status(&self.job_id).await {
                Ok(snapshot) => {
                    debug!(job_id = %self.job_id, attempt = self.attempt_count, status = ?snapshot.status, "polled job status");
                    self.status = snapshot.status.clone();
                    if let Some(failure) = snapshot.error {
                        return Err(RelayError::Remote(failure));
                    }
                    match snapshot.status {
                        JobStatus::Completed => {
                            self.messages = snapshot
                                .messages
                                .iter()
                                .filter_map(|m| serde_json::from_value(m.clone()).ok())
                                .collect();
                            return first_assistant_content(&snapshot.messages)
                                .map(ToOwned::to_owned)
                                .ok_or(RelayError::EmptyReply);
                        }
                        JobStatus::Failed => {
                            return Err(RelayError::remote(
                                None,
                                format!("job {} failed", self.job_id),
                            ));
                        }
                        JobStatus::Pending | JobStatus::Other(_) => {}
                    }
                }
                Err(err) => {
                    warn!(job_id = %self.job_id, attempt = self.attempt_count, error = %err, "job status fetch failed");
                }
            }
            if self.attempt_count < policy.max_attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }
        Err(RelayError::PollTimeout {
            attempts: self.attempt_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<serde_json::Value, RelayError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<serde_json::Value, RelayError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("lock")
        }
    }

    #[async_trait::async_trait]
    impl JobStatusSource for ScriptedSource {
        async fn fetch_status(&self, _job_id: &str) -> Result<JobSnapshot, RelayError> {
            *self.calls.lock().expect("lock") += 1;
            let next = self
                .responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"data": {"status": "in_progress"}})));
            JobSnapshot::from_body(&next?)
        }
    }

    fn fast_policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    fn pending() -> Result<serde_json::Value, RelayError> {
        Ok(json!({"code": 0, "data": {"status": "in_progress"}}))
    }

    fn completed(content: &str) -> Result<serde_json::Value, RelayError> {
        Ok(json!({"code": 0, "data": {"status": "completed", "messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "type": "answer", "content": content},
            {"role": "assistant", "type": "answer", "content": "second"}
        ]}}))
    }

    #[tokio::test]
    async fn completes_on_attempt_k_with_first_assistant_message() {
        let source = ScriptedSource::new(vec![pending(), pending(), completed("done")]);
        let mut job = PollJob::new("job-1");
        let reply = job.run(&source, fast_policy(10)).await.expect("reply");
        assert_eq!(reply, "done");
        assert_eq!(job.attempt_count, 3);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.messages.len(), 3);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn never_completing_job_times_out_after_budget() {
        let source = ScriptedSource::new(vec![]);
        let mut job = PollJob::new("job-2");
        let err = job.run(&source, fast_policy(4)).await.expect_err("timeout");
        assert_eq!(err, RelayError::PollTimeout { attempts: 4 });
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn failed_status_stops_immediately() {
        let source = ScriptedSource::new(vec![
            pending(),
            Ok(json!({"data": {"status": "failed", "last_error": {"code": 0, "msg": ""}}})),
            completed("never reached"),
        ]);
        let mut job = PollJob::new("job-3");
        let err = job.run(&source, fast_policy(10)).await.expect_err("failure");
        assert!(matches!(err, RelayError::Remote(_)));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn explicit_error_code_stops_immediately() {
        let source = ScriptedSource::new(vec![Ok(json!({
            "code": 4100,
            "msg": "token expired",
            "data": {"status": "in_progress"}
        }))]);
        let mut job = PollJob::new("job-4");
        let err = job.run(&source, fast_policy(10)).await.expect_err("failure");
        assert_eq!(
            err,
            RelayError::Remote(RemoteFailure::new(Some(4100), "token expired"))
        );
        assert_eq!(job.attempt_count, 1);
    }

    #[tokio::test]
    async fn transient_fetch_failures_count_toward_budget() {
        let source = ScriptedSource::new(vec![
            Err(RelayError::Network("connection refused".into())),
            Ok(json!({"unexpected": true})),
            completed("recovered"),
        ]);
        let mut job = PollJob::new("job-5");
        assert_eq!(
            job.run(&source, fast_policy(3)).await.expect("reply"),
            "recovered"
        );

        let failing = ScriptedSource::new(vec![
            Err(RelayError::Network("down".into())),
            Err(RelayError::Network("down".into())),
        ]);
        let mut job = PollJob::new("job-6");
        assert_eq!(
            job.run(&failing, fast_policy(2)).await,
            Err(RelayError::PollTimeout { attempts: 2 })
        );
    }

    #[tokio::test]
    async fn completed_without_assistant_content_is_empty_reply() {
        let source = ScriptedSource::new(vec![Ok(json!({"data": {
            "status": "completed",
            "messages": [{"role": "assistant", "content": ""}]
        }}))]);
        let mut job = PollJob::new("job-7");
        assert_eq!(
            job.run(&source, fast_policy(3)).await,
            Err(RelayError::EmptyReply)
        );
    }

    #[test]
    fn status_strings_map_to_job_status() {
        assert_eq!(JobStatus::from_wire("in_progress"), JobStatus::Pending);
        assert_eq!(JobStatus::from_wire("completed"), JobStatus::Completed);
        assert_eq!(JobStatus::from_wire("canceled"), JobStatus::Failed);
        assert_eq!(
            JobStatus::from_wire("paused"),
            JobStatus::Other("paused".into())
        );
    }
}
