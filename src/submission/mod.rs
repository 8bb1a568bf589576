//! Submission Service: turns an admitted [`CodeSubmission`] into a queued
//! [`Job`] — writes the authoritative record, then hands the job id to the
//! language-specific worker queue.

use std::sync::Arc;

use uuid::Uuid;

use crate::admission::AdmissionGateway;
use crate::broker::Broker;
use crate::domain::{CodeSubmission, Job, new_job_id};
use crate::store::{JobStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Admission(#[from] crate::admission::AdmissionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SubmissionService {
    broker: Arc<dyn Broker>,
    store: Arc<JobStore>,
    admission: Arc<AdmissionGateway>,
}

const NOTIFICATIONS_CHANNEL: &str = "job_notifications";

impl SubmissionService {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<JobStore>,
        admission: Arc<AdmissionGateway>,
    ) -> Self {
        Self {
            broker,
            store,
            admission,
        }
    }

    /// Runs admission, then creates and queues the job. Returns the new job
    /// id on success. Notifying the autoscaler's push path is best-effort —
    /// a dropped publish just means the autoscaler's periodic pull-path
    /// sweep picks up the new queue depth a little later.
    pub async fn submit(
        &self,
        ip: &str,
        api_key: Option<&str>,
        submission: CodeSubmission,
        now: i64,
    ) -> Result<Uuid, SubmissionError> {
        self.admission
            .admit(ip, api_key, &submission, now)
            .await?;

        let job_id = new_job_id();
        let language = submission.language;
        let job = Job::new(job_id, submission, now);

        self.store.create(&job).await?;

        let queue_key = format!("queue:{language}");
        if let Err(e) = self.broker.left_push(&queue_key, &job_id.to_string()).await {
            tracing::error!(job_id = %job_id, error = %e, "failed to enqueue job after creating its record");
            return Err(SubmissionError::Store(StoreError::Broker(e)));
        }

        if let Err(e) = self
            .broker
            .publish(NOTIFICATIONS_CHANNEL, language.tag())
            .await
        {
            tracing::debug!(job_id = %job_id, error = %e, "job_notifications publish failed, relying on autoscaler pull path");
        }

        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;
    use crate::domain::Language;
    use std::collections::HashSet;

    fn service() -> SubmissionService {
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
        let store = Arc::new(JobStore::new(broker.clone()));
        let mut keys = HashSet::new();
        keys.insert("k".to_string());
        let admission = Arc::new(AdmissionGateway::new(
            broker.clone(),
            keys,
            b"test-hmac-key".to_vec(),
        ));
        SubmissionService::new(broker, store, admission)
    }

    #[tokio::test]
    async fn submit_creates_and_enqueues_a_job() {
        let svc = service();
        let submission = CodeSubmission {
            code: "print(1)".into(),
            language: Language::Python,
            filename: "a.py".into(),
        };
        let job_id = svc
            .submit("1.1.1.1", Some("k"), submission, 1000)
            .await
            .unwrap();

        let job = svc.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.id, job_id);

        let lens = svc
            .broker
            .llen_many(&["queue:python".to_string()])
            .await
            .unwrap();
        assert_eq!(lens[0], 1);
    }

    #[tokio::test]
    async fn submit_rejects_on_bad_api_key_without_creating_a_job() {
        let svc = service();
        let submission = CodeSubmission {
            code: "print(1)".into(),
            language: Language::Python,
            filename: "a.py".into(),
        };
        let err = svc
            .submit("1.1.1.1", Some("wrong"), submission, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Admission(_)));
    }
}
