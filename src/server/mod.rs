//! HTTP surface (spec §6): the hyper dispatcher and its supporting
//! request/response plumbing.
//!
//! Grounded on `main_web.rs`'s `match (&method, path.as_str())` dispatch
//! table and `make_service_fn`/`service_fn`/`Server::bind` wiring.

pub mod request_parsing;
pub mod response_helpers;
pub mod routes;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use log::info;

use crate::server::response_helpers::{cors_preflight, not_found};
use crate::state::AppState;

async fn dispatch(req: Request<Body>, state: Arc<AppState>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => cors_preflight(),

        (&Method::GET, "/health") => routes::health::handle().await,

        (&Method::GET, "/v1/models") | (&Method::GET, "/models") => routes::models::handle_list(&state).await,
        (&Method::POST, "/v1/models/load") | (&Method::POST, "/models/load") => routes::models::handle_load(req).await,
        (&Method::POST, "/v1/models/unload") | (&Method::POST, "/models/unload") => {
            routes::models::handle_unload(req).await
        }

        (&Method::GET, "/props") => routes::props::handle(&req, &state).await,

        (&Method::POST, "/v1/chat/completions") | (&Method::POST, "/chat/completions") => {
            routes::chat::handle(req, state.clone()).await
        }

        _ => not_found(),
    };

    Ok(response)
}

/// Bind and serve (spec §6.1's `serve` subcommand). Runs until the process
/// is killed; there is no graceful-shutdown endpoint.
pub async fn run(state: Arc<AppState>) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.hostname, state.config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid bind address: {e}")))?;

    if state.config.gateway_enabled {
        state.discovery.spawn_periodic();
    }

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| dispatch(req, state.clone()))) }
    });

    info!("afm listening on http://{addr}");
    info!("  GET  /health                - health check");
    info!("  GET  /v1/models             - list foundation/mlx/proxied models");
    info!("  POST /v1/models/load        - load stub");
    info!("  POST /v1/models/unload      - unload stub");
    info!("  GET  /props                 - llama.cpp-webui-compatible capability snapshot");
    info!("  POST /v1/chat/completions   - OpenAI-compatible chat completions");

    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}
