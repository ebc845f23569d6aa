use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use atelier_core::{DeviceMap, Engine, FluxLoader};
use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod handlers;
mod history;
mod types;

use handlers::AppState;
use history::HistoryStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "Atelier image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model repo holding the pipeline weights
    #[arg(long, default_value = "black-forest-labs/FLUX.1-schnell")]
    model: String,

    /// LoRA adapter file (.safetensors)
    #[arg(long, default_value = "adapter.safetensors")]
    lora_path: PathBuf,

    /// Apply the LoRA adapter at startup
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    lora_default: bool,

    /// LoRA strength used at startup
    #[arg(long, default_value_t = 1.3)]
    lora_scale: f64,

    /// Directory for generated images
    #[arg(long, default_value = "outputs")]
    output_dir: PathBuf,

    /// SQLite database holding the generation history
    #[arg(long, default_value = "history.db")]
    database: PathBuf,

    /// Directory with the static front end
    #[arg(long, default_value = "web")]
    web_dir: PathBuf,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8888)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.output_dir)?;

    let history = HistoryStore::connect(&args.database).await?;

    let device_map = if args.cpu { DeviceMap::ForceCpu } else { DeviceMap::default() };
    let loader = FluxLoader::new(args.model.clone());
    let mut engine = Engine::new(Box::new(loader), device_map, args.lora_path.clone());

    // A failed load is non-fatal: the API stays up, reports unloaded, and
    // a later load attempt can still succeed.
    match engine.load() {
        Ok(status) => {
            info!(%status, "model loaded");
            if args.lora_default {
                if let Err(e) = engine.set_lora(true, args.lora_scale) {
                    warn!(error = %e, "default lora not applied");
                }
            }
        }
        Err(e) => warn!(error = %e, "model load failed, serving without a pipeline"),
    }

    let state = Arc::new(AppState {
        engine: Mutex::new(engine),
        history,
        output_dir: args.output_dir,
        web_dir: args.web_dir,
    });

    let app = Router::new()
        .route("/api/generate", post(handlers::generate))
        .route("/api/status", get(handlers::status))
        .route("/api/history", get(handlers::history_list))
        .route("/api/history/{id}", delete(handlers::history_delete))
        .route("/outputs/{filename}", get(handlers::serve_output))
        .fallback(handlers::serve_web)
        .with_state(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
