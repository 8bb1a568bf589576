//! Autoscaler: demand-starts worker machines when a language's queue goes
//! non-empty. Two concurrent inputs feed the same decision path — a
//! pub/sub push for low latency, and a periodic queue-depth sweep as the
//! safety net for any push path drops.

mod control_plane;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::domain::Language;

pub use control_plane::{ControlPlane, ControlPlaneError, HttpControlPlane, Machine};

const NOTIFICATIONS_CHANNEL: &str = "job_notifications";
const PULL_INTERVAL: Duration = Duration::from_secs(10);
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(30);
const DEBOUNCE_SWEEP_INTERVAL: Duration = Duration::from_secs(120);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Maps a language to the control-plane app name hosting its workers.
pub type AppNameMap = HashMap<Language, String>;

struct Debounce {
    last_request: HashMap<String, Instant>,
}

impl Debounce {
    fn new() -> Self {
        Self {
            last_request: HashMap::new(),
        }
    }

    fn should_skip(&self, app: &str, at: Instant) -> bool {
        self.last_request
            .get(app)
            .is_some_and(|last| at.duration_since(*last) < DEBOUNCE_WINDOW)
    }

    fn record(&mut self, app: &str, at: Instant) {
        self.last_request.insert(app.to_string(), at);
    }

    fn sweep(&mut self, at: Instant) {
        self.last_request
            .retain(|_, last| at.duration_since(*last) < DEBOUNCE_SWEEP_INTERVAL);
    }
}

pub struct Autoscaler {
    broker: Arc<dyn Broker>,
    control_plane: Arc<dyn ControlPlane>,
    apps: AppNameMap,
    debounce: Mutex<Debounce>,
}

impl Autoscaler {
    pub fn new(broker: Arc<dyn Broker>, control_plane: Arc<dyn ControlPlane>, apps: AppNameMap) -> Self {
        Self {
            broker,
            control_plane,
            apps,
            debounce: Mutex::new(Debounce::new()),
        }
    }

    /// Runs the push subscription, the pull-path ticker, the debounce
    /// sweeper, and the broker health check concurrently until `shutdown`
    /// fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tokio::join!(
            self.run_push_path(shutdown.clone()),
            self.run_pull_path(shutdown.clone()),
            self.run_debounce_sweeper(shutdown.clone()),
            self.run_health_check(shutdown.clone()),
        );
    }

    async fn run_push_path(&self, shutdown: CancellationToken) {
        loop {
            let mut sub = match self.broker.subscribe(NOTIFICATIONS_CHANNEL).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(error = %e, "autoscaler push-path subscribe failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    next = sub.next() => {
                        match next {
                            // The payload is a language tag, treated as a hint only —
                            // we always recheck every queue's depth rather than trust it.
                            Some(_language_tag) => self.evaluate_all().await,
                            None => break,
                        }
                    }
                }
            }
        }
    }

    async fn run_pull_path(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(PULL_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.evaluate_all().await,
            }
        }
    }

    async fn run_debounce_sweeper(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(DEBOUNCE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    self.debounce.lock().await.sweep(Instant::now());
                }
            }
        }
    }

    async fn run_health_check(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.broker.ping().await {
                        tracing::warn!(error = %e, "broker health check failed");
                    }
                }
            }
        }
    }

    /// Checks queue depth for every configured language and requests a
    /// machine start where work is pending. A single failed request is
    /// logged and left for the next pull-path tick to retry; this never
    /// blocks or fails the caller.
    async fn evaluate_all(&self) {
        let languages: Vec<Language> = self.apps.keys().copied().collect();
        let keys: Vec<String> = languages.iter().map(|l| format!("queue:{l}")).collect();

        let lens = match self.broker.llen_many(&keys).await {
            Ok(lens) => lens,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read queue depths");
                return;
            }
        };

        for (language, len) in languages.into_iter().zip(lens) {
            if len > 0 {
                self.maybe_start(language).await;
            }
        }
    }

    async fn maybe_start(&self, language: Language) {
        let Some(app) = self.apps.get(&language) else {
            return;
        };

        let now = Instant::now();
        {
            let debounce = self.debounce.lock().await;
            if debounce.should_skip(app, now) {
                return;
            }
        }

        let machines = match self.control_plane.list_machines(app).await {
            Ok(machines) => machines,
            Err(e) => {
                tracing::warn!(app, error = %e, "list_machines failed");
                return;
            }
        };

        if machines.iter().any(|m| m.state == "started") {
            return;
        }
        let Some(stopped) = machines.iter().find(|m| m.state == "stopped") else {
            return;
        };

        self.debounce.lock().await.record(app, now);

        if let Err(e) = self.control_plane.start_machine(app, &stopped.id).await {
            tracing::warn!(app, error = %e, "start_machine failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaler::control_plane::fake::FakeControlPlane;
    use crate::broker::FakeBroker;

    fn apps() -> AppNameMap {
        let mut m = HashMap::new();
        m.insert(Language::Python, "worker-python".to_string());
        m
    }

    #[tokio::test]
    async fn starts_a_machine_when_queue_is_non_empty() {
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
        broker.left_push("queue:python", "job-1").await.unwrap();
        let cp = Arc::new(FakeControlPlane::default());
        let autoscaler = Autoscaler::new(broker, cp.clone(), apps());

        autoscaler.evaluate_all().await;

        assert_eq!(cp.starts.lock().unwrap().as_slice(), &["worker-python"]);
    }

    #[tokio::test]
    async fn does_not_start_when_queue_is_empty() {
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
        let cp = Arc::new(FakeControlPlane::default());
        let autoscaler = Autoscaler::new(broker, cp.clone(), apps());

        autoscaler.evaluate_all().await;

        assert!(cp.starts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn debounce_skips_a_second_request_within_the_window() {
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
        broker.left_push("queue:python", "job-1").await.unwrap();
        let cp = Arc::new(FakeControlPlane::default());
        let autoscaler = Autoscaler::new(broker, cp.clone(), apps());

        autoscaler.evaluate_all().await;
        autoscaler.evaluate_all().await;

        assert_eq!(cp.starts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn debounce_sweep_clears_old_entries() {
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
        let cp = Arc::new(FakeControlPlane::default());
        let autoscaler = Autoscaler::new(broker, cp, apps());

        autoscaler
            .debounce
            .lock()
            .await
            .record("worker-python", Instant::now() - Duration::from_secs(200));
        autoscaler.debounce.lock().await.sweep(Instant::now());

        assert!(
            !autoscaler
                .debounce
                .lock()
                .await
                .should_skip("worker-python", Instant::now())
        );
    }
}
