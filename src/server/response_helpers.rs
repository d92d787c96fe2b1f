//! HTTP response helpers (spec §6), mirroring the teacher's
//! `web/response_helpers.rs` CORS-wrapped builder functions almost
//! verbatim — this is ambient HTTP plumbing, not inference-orchestration
//! logic, so it stays close to the original shape.

use hyper::{Body, Response, StatusCode};
use serde::Serialize;

const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

fn with_cors(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string());
    with_cors(Response::builder().status(status))
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

/// OpenAI-shaped error response (spec §7).
pub fn openai_error(status: u16, body: serde_json::Value) -> Response<Body> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &body)
}

pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    let json = serde_json::json!({"error": {"message": message, "type": "invalid_request_error"}});
    json_response(status, &json)
}

pub fn empty_response(status: StatusCode) -> Response<Body> {
    with_cors(Response::builder().status(status)).body(Body::empty()).unwrap()
}

pub fn cors_preflight() -> Response<Body> {
    empty_response(StatusCode::OK)
}

pub fn not_found() -> Response<Body> {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// SSE response headers (spec §6): `Content-Type: text/event-stream`,
/// `Cache-Control: no-cache`, `X-Accel-Buffering: no`.
pub fn sse_response(body: Body) -> Response<Body> {
    with_cors(Response::builder().status(StatusCode::OK))
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_sets_status() {
        let response = json_error(StatusCode::BAD_REQUEST, "bad");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
