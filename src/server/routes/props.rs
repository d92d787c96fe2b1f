//! `GET /props?model=<id>` (spec §6): llama.cpp-webui-compatible capability
//! snapshot.

use std::sync::Arc;

use hyper::{Body, Request, Response, StatusCode};
use serde_json::json;

use crate::server::request_parsing::get_query_param;
use crate::server::response_helpers::json_response;
use crate::state::AppState;

pub async fn handle(req: &Request<Body>, state: &Arc<AppState>) -> Response<Body> {
    let model = get_query_param(req.uri(), "model").unwrap_or_else(|| "foundation".to_string());

    if model == "foundation" {
        return json_response(
            StatusCode::OK,
            &json!({
                "default_generation_settings": { "n_ctx": 4096, "params": {} },
                "total_slots": 1,
                "model_path": "apple-foundation-model",
                "role": "router",
                "modalities": { "vision": false, "audio": false },
                "chat_template": null,
                "bos_token": null,
                "eos_token": null,
                "build_info": env!("CARGO_PKG_VERSION"),
            }),
        );
    }

    if state.mlx_service.current_model_id().as_deref() == Some(model.as_str()) {
        if let Ok(caps) = state.mlx_service.capabilities().await {
            let model_path = state.mlx_service.current_model_id().unwrap_or_default();
            return json_response(
                StatusCode::OK,
                &json!({
                    "default_generation_settings": {
                        "n_ctx": caps.context_length.unwrap_or(4096),
                        "params": {},
                    },
                    "total_slots": 1,
                    "model_path": model_path,
                    "role": "mlx",
                    "modalities": { "vision": caps.vision, "audio": false },
                    "chat_template": null,
                    "bos_token": null,
                    "eos_token": null,
                    "build_info": env!("CARGO_PKG_VERSION"),
                }),
            );
        }
    }

    let discovery_snapshot = state.discovery.snapshot();
    if let Some((discovered, _)) = discovery_snapshot.backend_for(&model) {
        let caps = discovery_snapshot.capabilities(&model);
        return json_response(
            StatusCode::OK,
            &json!({
                "default_generation_settings": {
                    "n_ctx": caps.context_length.unwrap_or(4096),
                    "params": {},
                },
                "total_slots": 1,
                "model_path": discovered.base_url.clone(),
                "role": "router",
                "modalities": { "vision": caps.vision, "audio": false },
                "chat_template": null,
                "bos_token": null,
                "eos_token": null,
                "build_info": env!("CARGO_PKG_VERSION"),
            }),
        );
    }

    json_response(
        StatusCode::NOT_FOUND,
        &json!({ "error": { "message": "unknown model", "type": "invalid_request_error" } }),
    )
}
