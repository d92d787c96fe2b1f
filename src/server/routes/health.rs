//! `GET /health` (spec §6).

use hyper::{Body, Response};
use serde::Serialize;

use crate::server::response_helpers::json_response;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: i64,
    version: &'static str,
}

pub async fn handle() -> Response<Body> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    json_response(
        hyper::StatusCode::OK,
        &HealthBody {
            status: "ok",
            timestamp,
            version: env!("CARGO_PKG_VERSION"),
        },
    )
}
