//! Entrypoint hosting the three cooperating roles described in spec §2: the
//! HTTP/WebSocket gateway (`serve`), one long-running worker loop per
//! language (`worker --language <L>`), and the queue-depth autoscaler
//! (`autoscale`). Each role is independently deployable onto its own host
//! class even though they share one binary, the way the teacher's CLI hosts
//! several cooperating subcommands behind one entrypoint.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crucible::admission::AdmissionGateway;
use crucible::api::{self, ApiState};
use crucible::autoscaler::{Autoscaler, HttpControlPlane};
use crucible::broker::{Broker, RedisBroker};
use crucible::config::Config;
use crucible::domain::Language;
use crucible::result_service::ResultService;
use crucible::sandbox::{HostSandbox, Sandbox};
use crucible::store::JobStore;
use crucible::stream::StreamService;
use crucible::submission::SubmissionService;
use crucible::token::TokenService;
use crucible::worker::WorkerLoop;

#[derive(Parser)]
#[command(name = "crucible", about = "Multi-tenant remote code execution service")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run the HTTP/WebSocket gateway: admission, submission, results, streaming.
    Serve,
    /// Run the blocking-pop worker loop for one language.
    Worker {
        #[arg(long, value_enum)]
        language: CliLanguage,
    },
    /// Run the queue-depth autoscaler.
    Autoscale,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliLanguage {
    Python,
    Javascript,
    Typescript,
    Java,
    Cpp,
    C,
    Go,
    Rust,
}

impl From<CliLanguage> for Language {
    fn from(l: CliLanguage) -> Self {
        match l {
            CliLanguage::Python => Language::Python,
            CliLanguage::Javascript => Language::Javascript,
            CliLanguage::Typescript => Language::Typescript,
            CliLanguage::Java => Language::Java,
            CliLanguage::Cpp => Language::Cpp,
            CliLanguage::C => Language::C,
            CliLanguage::Go => Language::Go,
            CliLanguage::Rust => Language::Rust,
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.role {
        Role::Serve => serve(config).await,
        Role::Worker { language } => run_worker(config, language.into()).await,
        Role::Autoscale => run_autoscaler(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.broker_url()).await?);
    let store = Arc::new(JobStore::new(broker.clone()));
    let admission = Arc::new(AdmissionGateway::new(
        broker.clone(),
        config.api_keys.clone(),
        config.ratelimit_hmac_key.clone(),
    ));
    let submission = Arc::new(SubmissionService::new(
        broker.clone(),
        store.clone(),
        admission.clone(),
    ));
    let results = Arc::new(ResultService::new(store.clone()));
    let tokens = Arc::new(TokenService::new(config.jwt_key.clone()));
    let stream = Arc::new(StreamService::new(broker.clone(), store.clone(), tokens.clone()));

    let shutdown = CancellationToken::new();
    tokio::spawn(stream.clone().run_sweeper(shutdown.clone(), now_unix));

    let state = ApiState {
        submission,
        results,
        tokens,
        stream,
        admission,
        broker,
    };
    let app = api::router(state, config.allowed_origins.clone())
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    tracing::info!(addr = %config.bind_addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    Ok(())
}

async fn run_worker(config: Config, language: Language) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.broker_url()).await?);
    let store = Arc::new(JobStore::new(broker.clone()));
    let sandbox: Arc<dyn Sandbox> = Arc::new(HostSandbox::default());
    let worker = WorkerLoop::new(broker, store, sandbox, language);

    let shutdown = CancellationToken::new();
    let watcher = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        watcher.cancel();
    });

    tracing::info!(%language, "worker loop starting");
    worker.run(shutdown, now_unix).await;
    Ok(())
}

async fn run_autoscaler(config: Config) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.broker_url()).await?);
    let control_plane = Arc::new(HttpControlPlane::new(
        config.control_plane_url.clone(),
        config.control_plane_token.clone(),
    ));
    let apps = config
        .app_names
        .iter()
        .map(|(lang, app)| (*lang, app.clone()))
        .collect();
    let autoscaler = Autoscaler::new(broker, control_plane, apps);

    let shutdown = CancellationToken::new();
    let watcher = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        watcher.cancel();
    });

    tracing::info!("autoscaler starting");
    autoscaler.run(shutdown).await;
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining connections");
    token.cancel();
}
