//! HTTP front end for protocol generation and simulation.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use labscript::io::config::load_config;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::state::AppState;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "warn,labscript=info,labscript_server=info";

#[derive(Parser)]
#[command(name = "labscript-server")]
#[command(about = "HTTP API for generating and simulating lab protocols")]
struct Args {
    /// Interface to listen on
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Path to labscript.toml; defaults apply when the file is missing
    #[arg(long, default_value = labscript::io::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Static UI bundle served for paths outside /api and /events
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

/// Assemble the router: JSON API, SSE stream, optional static UI.
fn build_app(state: AppState, ui_dir: Option<&Path>) -> Router {
    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    match ui_dir {
        Some(dir) if dir.is_dir() => {
            info!(ui_dir = %dir.display(), "serving static UI");
            app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true))
        }
        Some(dir) => {
            info!(ui_dir = %dir.display(), "UI directory missing; serving API only");
            app
        }
        None => app,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    labscript::logging::init_with(DEFAULT_FILTER);
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let state = AppState::new(config).context("initialize server state")?;
    let app = build_app(state, args.ui_dir.as_deref());

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.bind, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, config = %args.config.display(), "labscript-server listening");

    axum::serve(listener, app).await.context("serve HTTP")?;
    Ok(())
}
