//! Result Service: the read path for a job's current status/result, with a
//! short read-through cache in front of the job store so a poll-happy client
//! doesn't turn into store load, and the "self-heal" policy that papers over
//! a worker crashing after committing a result but before marking the job
//! failed-then-recovered.
//!
//! The cache itself lives in the broker, not in process memory — any gateway
//! instance can serve a cached read for a job another instance populated,
//! and the cache survives a gateway restart the way the job records it
//! shadows already do.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Job, JobStatus};
use crate::store::{JobStore, StoreError};

const TERMINAL_CACHE_TTL_SECS: u64 = 300;
const IN_PROGRESS_CACHE_TTL_SECS: u64 = 30;
const CACHE_PREFIX: &str = "cache:";

fn cache_key(id: Uuid) -> String {
    format!("{CACHE_PREFIX}{id}")
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("corrupt cache entry for job {0}: {1}")]
    CorruptEntry(Uuid, String),
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    timestamp: i64,
    data: Job,
}

pub struct ResultService {
    store: Arc<JobStore>,
}

impl ResultService {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    /// Reads a job, preferring a fresh cache entry over a store round-trip.
    /// Applies the self-heal rule before returning: a job that somehow sits
    /// at `failed` but carries a result with `success: true` is reported —
    /// and re-cached — as `completed`. This only ever papers over a status
    /// write that lost a race with a result write; it never invents a
    /// result that isn't there.
    pub async fn get_result(&self, id: Uuid) -> Result<Option<Job>, ResultError> {
        if let Some(job) = self.cached(id).await? {
            return Ok(Some(job));
        }

        let Some(mut job) = self.store.get(id).await? else {
            return Ok(None);
        };

        if self.needs_self_heal(&job) {
            job.status = JobStatus::Completed;
            self.store
                .transition(job.id, JobStatus::Completed, job.result.as_ref(), None, job.completed_at)
                .await?;
        }
        self.insert_cache(&job).await;
        Ok(Some(job))
    }

    fn needs_self_heal(&self, job: &Job) -> bool {
        job.status == JobStatus::Failed
            && job.result.as_ref().is_some_and(|result| result.success)
    }

    async fn cached(&self, id: Uuid) -> Result<Option<Job>, ResultError> {
        let Some(raw) = self.store.broker().get(&cache_key(id)).await.unwrap_or(None) else {
            return Ok(None);
        };
        let record: CacheRecord = serde_json::from_str(&raw)
            .map_err(|e| ResultError::CorruptEntry(id, e.to_string()))?;
        Ok(Some(record.data))
    }

    async fn insert_cache(&self, job: &Job) {
        let ttl_secs = if job.status.is_terminal() {
            TERMINAL_CACHE_TTL_SECS
        } else {
            IN_PROGRESS_CACHE_TTL_SECS
        };
        let record = CacheRecord {
            timestamp: now_unix(),
            data: job.clone(),
        };
        let Ok(json) = serde_json::to_string(&record) else {
            return;
        };
        if let Err(e) = self
            .store
            .broker()
            .set_with_ttl(&cache_key(job.id), &json, std::time::Duration::from_secs(ttl_secs))
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "failed to populate result cache");
        }
    }

    /// Scans every cached entry to report how many are cached and at which
    /// stage. Diagnostic only — never called on a request hot path.
    pub async fn cache_stats(&self) -> CacheStats {
        let keys = self
            .store
            .broker()
            .keys_by_prefix(CACHE_PREFIX)
            .await
            .unwrap_or_default();

        let mut terminal = 0;
        let mut in_progress = 0;
        for key in &keys {
            let Ok(Some(raw)) = self.store.broker().get(key).await else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<CacheRecord>(&raw) else {
                continue;
            };
            if record.data.status.is_terminal() {
                terminal += 1;
            } else {
                in_progress += 1;
            }
        }

        CacheStats {
            total: keys.len(),
            terminal,
            in_progress,
        }
    }

    /// Evicts a single job's cache entry, used when a worker reports a
    /// transition and wants the next read to hit the store.
    pub async fn invalidate(&self, id: Uuid) {
        let _ = self.store.broker().delete(&cache_key(id)).await;
    }

    pub async fn clear(&self) {
        let keys = self
            .store
            .broker()
            .keys_by_prefix(CACHE_PREFIX)
            .await
            .unwrap_or_default();
        for key in keys {
            let _ = self.store.broker().delete(&key).await;
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub terminal: usize,
    pub in_progress: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;
    use crate::domain::{CodeSubmission, ExecutionResult, Language};

    fn store() -> Arc<JobStore> {
        Arc::new(JobStore::new(Arc::new(FakeBroker::new())))
    }

    fn submission() -> CodeSubmission {
        CodeSubmission {
            code: "print(1)".into(),
            language: Language::Python,
            filename: "a.py".into(),
        }
    }

    #[tokio::test]
    async fn missing_job_returns_none() {
        let svc = ResultService::new(store());
        assert!(svc.get_result(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_a_queued_job_through_to_the_store() {
        let store = store();
        let job = Job::new(Uuid::new_v4(), submission(), 0);
        store.create(&job).await.unwrap();

        let svc = ResultService::new(store);
        let fetched = svc.get_result(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn second_read_is_served_from_the_cache() {
        let store = store();
        let job = Job::new(Uuid::new_v4(), submission(), 0);
        store.create(&job).await.unwrap();

        let svc = ResultService::new(store.clone());
        svc.get_result(job.id).await.unwrap();

        // Mutate the store directly; a cached read must not see this yet.
        store
            .transition(job.id, JobStatus::Processing, None, None, None)
            .await
            .unwrap();

        let fetched = svc.get_result(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn self_heal_promotes_failed_with_successful_result_to_completed() {
        let store = store();
        let job = Job::new(Uuid::new_v4(), submission(), 0);
        store.create(&job).await.unwrap();
        let result = ExecutionResult {
            success: true,
            stdout: "1\n".into(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: Some(0.01),
        };
        store
            .transition(job.id, JobStatus::Failed, Some(&result), None, Some(5))
            .await
            .unwrap();

        let svc = ResultService::new(store.clone());
        let fetched = svc.get_result(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);

        // The correction must be durable, not just reflected in the
        // returned value or the read-through cache.
        let persisted = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn self_heal_does_not_touch_a_genuine_failure() {
        let store = store();
        let job = Job::new(Uuid::new_v4(), submission(), 0);
        store.create(&job).await.unwrap();
        store
            .transition(
                job.id,
                JobStatus::Failed,
                None,
                Some("compile error"),
                Some(5),
            )
            .await
            .unwrap();

        let svc = ResultService::new(store);
        let fetched = svc.get_result(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn cache_stats_tracks_terminal_vs_in_progress() {
        let store = store();
        let queued = Job::new(Uuid::new_v4(), submission(), 0);
        store.create(&queued).await.unwrap();
        let done = Job::new(Uuid::new_v4(), submission(), 0);
        store.create(&done).await.unwrap();
        store
            .transition(done.id, JobStatus::Processing, None, None, None)
            .await
            .unwrap();
        store
            .transition(done.id, JobStatus::Completed, None, None, Some(1))
            .await
            .unwrap();

        let svc = ResultService::new(store);
        svc.get_result(queued.id).await.unwrap();
        svc.get_result(done.id).await.unwrap();

        let stats = svc.cache_stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.terminal, 1);
        assert_eq!(stats.in_progress, 1);
    }

    #[tokio::test]
    async fn invalidate_forces_the_next_read_to_the_store() {
        let store = store();
        let job = Job::new(Uuid::new_v4(), submission(), 0);
        store.create(&job).await.unwrap();
        let svc = ResultService::new(store.clone());
        svc.get_result(job.id).await.unwrap();

        store
            .transition(job.id, JobStatus::Processing, None, None, None)
            .await
            .unwrap();
        svc.invalidate(job.id).await;

        let fetched = svc.get_result(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let store = store();
        let job = Job::new(Uuid::new_v4(), submission(), 0);
        store.create(&job).await.unwrap();
        let svc = ResultService::new(store);
        svc.get_result(job.id).await.unwrap();
        svc.clear().await;
        assert_eq!(svc.cache_stats().await.total, 0);
    }
}
