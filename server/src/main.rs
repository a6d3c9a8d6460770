use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::Router;
use clap::Parser;
use error_stack::{Report, ResultExt};
use tower::ServiceBuilder;
use tower_http::trace::{DefaultOnFailure, DefaultOnRequest, TraceLayer};
use tracing::{Level, Span};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{effective_api_key, load_config},
    proxy::ServerState,
};

mod admin;
mod config;
mod error;
mod proxy;

use error::Error;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// The path to the configuration file. If omitted, built-in defaults
    /// apply.
    #[clap(long, short = 'c')]
    config: Option<String>,

    /// Do not read the .env file
    #[clap(long)]
    no_dotenv: bool,

    /// The SQLite database for request metrics. When unset, metrics live in
    /// memory only.
    #[clap(long = "db", env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// The IP host to bind to
    #[clap(long, env = "HOST")]
    host: Option<String>,

    /// The TCP port to listen on
    #[clap(long, env = "PORT")]
    port: Option<u16>,

    /// Bearer token required on every endpoint. "1" disables authentication.
    #[clap(long, env = "API_MASTER_KEY")]
    api_master_key: Option<String>,
}

async fn serve(cmd: Cli) -> Result<(), Report<Error>> {
    error_stack::Report::set_color_mode(error_stack::fmt::ColorMode::None);

    if !cmd.no_dotenv {
        dotenvy::dotenv().ok();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
        .init();

    let config = load_config(&cmd)?;
    let api_key = effective_api_key(&config.server);
    if api_key.is_none() {
        tracing::warn!("API authentication is disabled");
    }

    smithery_proxy::tokens::preload_encodings();

    let proxy = smithery_proxy::Proxy::builder()
        .with_config(config.proxy)
        .with_credentials_from_env()
        .build()
        .await
        .change_context(Error::BuildingProxy)?;

    let state = Arc::new(ServerState { proxy, api_key });

    let app = Router::new()
        .merge(proxy::create_routes())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            proxy::require_api_key,
        ))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|req: &axum::extract::Request| {
                            let method = req.method();
                            let uri = req.uri();

                            let route = req
                                .extensions()
                                .get::<axum::extract::MatchedPath>()
                                .map(|matched_path| matched_path.as_str());

                            tracing::info_span!("request",
                                http.method=%method,
                                http.uri=%uri,
                                http.route=route,
                                http.status_code = tracing::field::Empty,
                                error = tracing::field::Empty
                            )
                        })
                        .on_response(|res: &http::Response<_>, latency: Duration, span: &Span| {
                            let status = res.status();
                            span.record("http.status_code", status.as_u16());
                            if status.is_client_error() || status.is_server_error() {
                                span.record("error", "true");
                            }

                            tracing::info!(
                                latency = %format!("{} ms", latency.as_millis()),
                                http.status_code = status.as_u16(),
                                "finished processing request"
                            );
                        })
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
                )
                .into_inner(),
        );

    let bind_ip = config
        .server
        .host
        .as_deref()
        .unwrap_or("0.0.0.0")
        .parse::<IpAddr>()
        .change_context(Error::ServerStart)?;
    let port = config.server.port.unwrap_or(8000);
    let bind_addr = SocketAddr::from((bind_ip, port));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .change_context(Error::ServerStart)?;
    let actual_addr = listener.local_addr().change_context(Error::ServerStart)?;
    tracing::info!("Listening on {}:{}", actual_addr.ip(), actual_addr.port());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .change_context(Error::ServerStart)?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown handler");
    }
    tracing::info!("Shutting down");
}

fn main() -> Result<(), Report<Error>> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(actual_main())
}

pub async fn actual_main() -> Result<(), Report<Error>> {
    let cli = Cli::parse();
    serve(cli).await?;
    Ok(())
}
