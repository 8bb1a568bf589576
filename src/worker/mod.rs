//! Worker Loop: a language-specific long-running process that blocking-pops
//! job ids from its queue, invokes the sandbox, and writes the result back
//! through the store, publishing a status update at every transition.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::Broker;
use crate::domain::{ExecutionResult, JobStatus, Language};
use crate::sandbox::Sandbox;
use crate::store::JobStore;

const POP_TIMEOUT: Duration = Duration::from_secs(30);
/// Total idle time with nothing to pop before the loop exits on its own,
/// letting the host be reclaimed instead of idling forever.
const MAX_IDLE: Duration = Duration::from_secs(120);
const UPDATES_CHANNEL_PREFIX: &str = "job:";
const UPDATES_CHANNEL_SUFFIX: &str = ":updates";

fn updates_channel(job_id: Uuid) -> String {
    format!("{UPDATES_CHANNEL_PREFIX}{job_id}{UPDATES_CHANNEL_SUFFIX}")
}

#[derive(Debug, Clone, serde::Serialize)]
struct StatusUpdate {
    job_id: Uuid,
    status: JobStatus,
    result: Option<ExecutionResult>,
    error: Option<String>,
    timestamp: i64,
}

pub struct WorkerLoop {
    broker: Arc<dyn Broker>,
    store: Arc<JobStore>,
    sandbox: Arc<dyn Sandbox>,
    language: Language,
}

impl WorkerLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<JobStore>,
        sandbox: Arc<dyn Sandbox>,
        language: Language,
    ) -> Self {
        Self {
            broker,
            store,
            sandbox,
            language,
        }
    }

    /// Runs until `shutdown` is triggered, or until the queue has sat empty
    /// for `MAX_IDLE` straight, at which point the loop exits so its host
    /// can be reclaimed. A job already claimed always runs to completion
    /// before the loop exits either way.
    pub async fn run(&self, shutdown: CancellationToken, now: impl Fn() -> i64) {
        let queue_key = format!("queue:{}", self.language);
        let mut idle_for = Duration::ZERO;

        loop {
            if idle_for >= MAX_IDLE {
                tracing::info!(language = %self.language, "worker loop idle timeout, exiting");
                return;
            }

            let popped = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!(language = %self.language, "worker loop shutting down");
                    return;
                }
                popped = self.broker.blocking_right_pop(&queue_key, POP_TIMEOUT) => popped,
            };

            let job_id = match popped {
                Ok(Some(raw)) => match raw.parse::<Uuid>() {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::error!(raw, error = %e, "queue entry is not a valid job id, dropping");
                        continue;
                    }
                },
                Ok(None) => {
                    idle_for += POP_TIMEOUT;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker pop failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            idle_for = Duration::ZERO;
            self.process_one(job_id, &now).await;
        }
    }

    async fn process_one(&self, job_id: Uuid, now: &impl Fn() -> i64) {
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) if job.language == self.language => job,
            Ok(Some(job)) => {
                tracing::warn!(job_id = %job_id, expected = %self.language, found = %job.language, "job queued on the wrong language queue, skipping");
                return;
            }
            Ok(None) => {
                tracing::error!(job_id = %job_id, "popped a job id with no matching record");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "failed to load job record");
                return;
            }
        };

        if let Err(e) = self
            .store
            .transition(job_id, JobStatus::Processing, None, None, None)
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "failed to mark job processing");
            return;
        }
        self.publish_update(job_id, JobStatus::Processing, None, None, now()).await;

        // Any sandbox failure, including a panic unwound into an error by
        // the trait object boundary, maps to a failed terminal transition;
        // the loop always continues to the next job afterward.
        let outcome = self
            .sandbox
            .execute(&job.code, &job.filename, job.language)
            .await;

        match outcome {
            Ok(result) => {
                let completed_at = now();
                // Commit the terminal transition before any further
                // bookkeeping: a failure past this point must never turn an
                // already-successful run back into `failed`.
                if let Err(e) = self
                    .store
                    .transition(
                        job_id,
                        JobStatus::Completed,
                        Some(&result),
                        None,
                        Some(completed_at),
                    )
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "failed to persist completed result");
                    return;
                }
                self.publish_update(
                    job_id,
                    JobStatus::Completed,
                    Some(result),
                    None,
                    completed_at,
                )
                .await;
            }
            Err(e) => {
                let completed_at = now();
                let message = e.to_string();
                if let Err(store_err) = self
                    .store
                    .transition(
                        job_id,
                        JobStatus::Failed,
                        None,
                        Some(&message),
                        Some(completed_at),
                    )
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %store_err, "failed to persist failed status");
                    return;
                }
                self.publish_update(
                    job_id,
                    JobStatus::Failed,
                    None,
                    Some(message),
                    completed_at,
                )
                .await;
            }
        }
    }

    async fn publish_update(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<ExecutionResult>,
        error: Option<String>,
        timestamp: i64,
    ) {
        let update = StatusUpdate {
            job_id,
            status,
            result,
            error,
            timestamp,
        };
        let Ok(payload) = serde_json::to_string(&update) else {
            tracing::error!(job_id = %job_id, "failed to serialize status update");
            return;
        };
        if let Err(e) = self.broker.publish(&updates_channel(job_id), &payload).await {
            tracing::debug!(job_id = %job_id, error = %e, "status update publish failed, late pollers still see the store write");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;
    use crate::domain::{CodeSubmission, Job};
    use crate::sandbox::ScriptedSandbox;

    fn components(result: ExecutionResult) -> (Arc<dyn Broker>, Arc<JobStore>, WorkerLoop) {
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
        let store = Arc::new(JobStore::new(broker.clone()));
        let sandbox: Arc<dyn Sandbox> = Arc::new(ScriptedSandbox { result });
        let worker = WorkerLoop::new(broker.clone(), store.clone(), sandbox, Language::Python);
        (broker, store, worker)
    }

    #[tokio::test]
    async fn successful_execution_transitions_to_completed() {
        let result = ExecutionResult {
            success: true,
            stdout: "hi\n".into(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: Some(0.01),
        };
        let (_broker, store, worker) = components(result.clone());

        let job = Job::new(
            Uuid::new_v4(),
            CodeSubmission {
                code: "print('hi')".into(),
                language: Language::Python,
                filename: "a.py".into(),
            },
            0,
        );
        store.create(&job).await.unwrap();

        worker.process_one(job.id, &|| 10).await;

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.result.unwrap().stdout, "hi\n");
        assert_eq!(fetched.completed_at, Some(10));
    }

    #[tokio::test]
    async fn missing_job_record_is_skipped_without_panicking() {
        let (_broker, _store, worker) = components(ExecutionResult {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: None,
        });
        worker.process_one(Uuid::new_v4(), &|| 0).await;
    }

    #[tokio::test]
    async fn run_exits_promptly_on_shutdown_with_an_empty_queue() {
        let (_broker, _store, worker) = components(ExecutionResult {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: None,
        });
        let token = CancellationToken::new();
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), worker.run(token, || 0)).await;
        assert!(result.is_ok());
    }
}
