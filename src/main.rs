//! `gatewire` binary: runs the gateway or one of the workers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use gatewire::config::{AiConfig, ChatBackendKind, GatewayConfig, Settings, WorkerConfig};
use gatewire::http::{self, AppState};
use gatewire::logging::{self, LogFormat};
use gatewire::router::Router;
use gatewire::services::{
    ai_worker, note_worker, resource_worker, ChatBackend, EchoBackend, NoteStore, OllamaBackend,
    ResourceStore,
};
use gatewire::transport::EndpointListener;
use gatewire::worker::WorkerBuilder;

#[derive(Debug, Parser)]
#[command(name = "gatewire", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short, global = true, env = "GATEWIRE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "GATEWIRE_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// HTTP gateway.
    Gateway,
    /// Note worker.
    NoteWorker,
    /// Resource (upload) worker.
    ResourceWorker,
    /// AI chat worker.
    AiWorker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;

    let settings = Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            shutdown.cancel();
        }
    });

    match cli.command {
        Command::Gateway => run_gateway(settings.gateway, shutdown).await,
        Command::NoteWorker => {
            let store = NoteStore::open(&settings.note.dir).await?;
            run_worker(note_worker(store), &settings.note.worker, shutdown).await
        }
        Command::ResourceWorker => {
            let resource = settings.resource;
            let store = ResourceStore::open(&resource.dir, &resource.public_base_url).await?;
            run_worker(resource_worker(store), &resource.worker, shutdown).await
        }
        Command::AiWorker => {
            let backend = chat_backend(&settings.ai);
            run_worker(ai_worker(backend), &settings.ai.worker, shutdown).await
        }
    }
}

async fn run_gateway(config: GatewayConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut builder = Router::builder()
        .request_timeout(config.request_timeout())
        .sweep_interval(config.sweep_interval())
        .reconnect_delay(config.reconnect_delay())
        .channel_capacity(config.channel_capacity)
        .max_payload_size(config.max_payload_size);
    for (name, service) in &config.services {
        builder = builder.service(name, service.codec, service.endpoint.clone());
    }
    let router = builder.start().await?;

    let mut state = AppState::new(router.clone(), &config.static_dir);
    state.max_body_size = config.max_body_size;

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    let result = http::serve(listener, http::app(state), shutdown).await;
    router.shutdown();
    result?;
    Ok(())
}

async fn run_worker(
    builder: WorkerBuilder,
    config: &WorkerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let worker = builder
        .max_concurrent_handlers(config.max_concurrent_handlers)
        .channel_capacity(config.channel_capacity)
        .max_payload_size(config.max_payload_size)
        .build();

    let listener = EndpointListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(service = %worker.service(), endpoint = %config.listen, "Worker starting");

    worker.serve(listener, shutdown).await?;
    Ok(())
}

fn chat_backend(config: &AiConfig) -> Arc<dyn ChatBackend> {
    match config.backend {
        ChatBackendKind::Echo => Arc::new(EchoBackend::with_delay(Duration::from_millis(config.echo_delay_ms))),
        ChatBackendKind::Ollama => {
            let api_key = config
                .ollama
                .api_key
                .clone()
                .or_else(|| std::env::var("OLLAMA_API_KEY").ok());
            Arc::new(OllamaBackend::new(&config.ollama.base_url, &config.ollama.model, api_key))
        }
    }
}
