//! Job Store: the authoritative read/write path for [`Job`] records, backed
//! by the broker's hash + TTL primitives.
//!
//! Every field of a job lives in a single broker hash keyed `job:<id>`. The
//! store itself does not enforce the lifecycle invariant — that's
//! [`JobStatus::can_transition_to`]'s job — callers decide whether a
//! transition is legal before calling [`JobStore::transition`].

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::broker::{Broker, BrokerError};
use crate::domain::{ExecutionResult, Job, JobStatus};

const JOB_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("job record is corrupt: {0}")]
    Corrupt(String),
}

fn job_key(id: Uuid) -> String {
    format!("job:{id}")
}

pub struct JobStore {
    broker: Arc<dyn Broker>,
}

impl JobStore {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Exposes the underlying broker so collaborators that share the same
    /// keyspace connection (e.g. the result cache) don't need their own
    /// handle threaded through separately.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Writes a freshly-created job record with a one-hour TTL.
    pub async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let fields = [
            ("id", job.id.to_string()),
            ("code", job.code.clone()),
            ("language", job.language.to_string()),
            ("filename", job.filename.clone()),
            ("status", job.status.to_string()),
            ("created_at", job.created_at.to_string()),
        ];
        let borrowed: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        self.broker
            .hash_set_fields(&job_key(job.id), &borrowed, Some(JOB_TTL))
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let Some(map) = self.broker.hash_get_all(&job_key(id)).await? else {
            return Ok(None);
        };

        let field = |name: &str| -> Result<String, StoreError> {
            map.get(name)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("missing field {name}")))
        };

        let language = field("language")?
            .parse()
            .map_err(StoreError::Corrupt)?;
        let status = field("status")?.parse().map_err(StoreError::Corrupt)?;
        let created_at = field("created_at")?
            .parse::<i64>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let completed_at = map
            .get("completed_at")
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let (result, raw_result) = match map.get("result") {
            Some(raw) => decode_result_field(raw),
            None => (None, None),
        };

        Ok(Some(Job {
            id,
            code: field("code")?,
            language,
            filename: field("filename")?,
            status,
            created_at,
            completed_at,
            result,
            raw_result,
            error: map.get("error").cloned(),
        }))
    }

    /// Moves a job to `status`, optionally attaching a result/error and a
    /// completion timestamp. Refreshes the job's TTL on every write so an
    /// in-progress job never expires mid-execution.
    pub async fn transition(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<&ExecutionResult>,
        error: Option<&str>,
        completed_at: Option<i64>,
    ) -> Result<(), StoreError> {
        let result_json;
        let mut fields: Vec<(&str, &str)> = vec![("status", status_str(status))];

        let completed_at_str;
        if let Some(ts) = completed_at {
            completed_at_str = ts.to_string();
            fields.push(("completed_at", &completed_at_str));
        }

        if let Some(result) = result {
            result_json = serde_json::to_string(result)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            fields.push(("result", &result_json));
        }

        if let Some(error) = error {
            fields.push(("error", error));
        }

        self.broker
            .hash_set_fields(&job_key(id), &fields, Some(JOB_TTL))
            .await?;
        Ok(())
    }
}

/// Decodes a stored `result` field through at most two layers of JSON: the
/// value itself, then — for a legacy value that was JSON-encoded twice —
/// the string obtained by decoding it once more. Never errors: a value that
/// survives neither layer is handed back verbatim as `raw_result` rather
/// than failing the whole job read (spec §4.5).
fn decode_result_field(raw: &str) -> (Option<ExecutionResult>, Option<String>) {
    if let Ok(result) = serde_json::from_str::<ExecutionResult>(raw) {
        return (Some(result), None);
    }
    if let Ok(inner) = serde_json::from_str::<String>(raw) {
        if let Ok(result) = serde_json::from_str::<ExecutionResult>(&inner) {
            return (Some(result), None);
        }
    }
    (None, Some(raw.to_string()))
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;
    use crate::domain::{CodeSubmission, Language};

    fn sample_job() -> Job {
        Job::new(
            Uuid::new_v4(),
            CodeSubmission {
                code: "print('hi')".into(),
                language: Language::Python,
                filename: "main.py".into(),
            },
            1_700_000_000,
        )
    }

    #[tokio::test]
    async fn round_trips_a_freshly_created_job() {
        let store = JobStore::new(Arc::new(FakeBroker::new()));
        let job = sample_job();
        store.create(&job).await.unwrap();

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.code, job.code);
    }

    #[tokio::test]
    async fn missing_job_reads_back_as_none() {
        let store = JobStore::new(Arc::new(FakeBroker::new()));
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_to_completed_attaches_result() {
        let store = JobStore::new(Arc::new(FakeBroker::new()));
        let job = sample_job();
        store.create(&job).await.unwrap();

        let result = ExecutionResult {
            success: true,
            stdout: "hi\n".into(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: Some(0.02),
        };
        store
            .transition(job.id, JobStatus::Processing, None, None, None)
            .await
            .unwrap();
        store
            .transition(
                job.id,
                JobStatus::Completed,
                Some(&result),
                None,
                Some(1_700_000_005),
            )
            .await
            .unwrap();

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.completed_at, Some(1_700_000_005));
        assert_eq!(fetched.result.unwrap().stdout, "hi\n");
    }

    #[tokio::test]
    async fn decodes_a_legacy_double_encoded_result() {
        let store = JobStore::new(Arc::new(FakeBroker::new()));
        let job = sample_job();
        store.create(&job).await.unwrap();

        let result = ExecutionResult {
            success: true,
            stdout: "hi\n".into(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: Some(0.02),
        };
        let once_encoded = serde_json::to_string(&result).unwrap();
        let twice_encoded = serde_json::to_string(&once_encoded).unwrap();
        store
            .broker()
            .hash_set_fields(
                &job_key(job.id),
                &[("status", "completed"), ("result", &twice_encoded)],
                None,
            )
            .await
            .unwrap();

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.result.unwrap().stdout, "hi\n");
        assert!(fetched.raw_result.is_none());
    }

    #[tokio::test]
    async fn passes_through_an_undecodable_result_instead_of_failing_the_read() {
        let store = JobStore::new(Arc::new(FakeBroker::new()));
        let job = sample_job();
        store.create(&job).await.unwrap();

        store
            .broker()
            .hash_set_fields(
                &job_key(job.id),
                &[("status", "completed"), ("result", "not json at all")],
                None,
            )
            .await
            .unwrap();

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert!(fetched.result.is_none());
        assert_eq!(fetched.raw_result.as_deref(), Some("not json at all"));
    }
}
