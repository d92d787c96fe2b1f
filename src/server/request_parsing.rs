//! Request parsing helpers (spec §6), mirroring the teacher's
//! `web/request_parsing.rs::parse_json_body`/`get_query_param`.

use hyper::{Body, Response, StatusCode, Uri};
use serde::de::DeserializeOwned;

use crate::server::response_helpers::json_error;

/// Cap enforcing spec §7's "payload too large" middleware contract.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub async fn parse_json_body<T: DeserializeOwned>(body: Body) -> Result<T, Response<Body>> {
    let body_bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Err(json_error(StatusCode::BAD_REQUEST, "failed to read request body"));
        }
    };

    if body_bytes.len() > MAX_BODY_BYTES {
        return Err(json_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
    }

    serde_json::from_slice(&body_bytes).map_err(|e| {
        json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}"))
    })
}

pub fn get_query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            Some(urlencoding::decode(v).unwrap_or_default().into_owned())
        } else {
            None
        }
    })
}
