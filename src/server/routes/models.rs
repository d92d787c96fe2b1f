//! `/v1/models`, `/v1/models/load`, `/v1/models/unload` (spec §6).

use std::sync::Arc;

use hyper::{Body, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use crate::server::request_parsing::parse_json_body;
use crate::server::response_helpers::json_response;
use crate::state::AppState;

#[derive(Serialize)]
struct ModelListEntry {
    name: String,
    model: String,
    capabilities: Vec<&'static str>,
}

#[derive(Serialize)]
struct DataEntry {
    id: String,
    object: &'static str,
    owned_by: String,
    created: i64,
}

pub async fn handle_list(state: &Arc<AppState>) -> Response<Body> {
    if state.config.gateway_enabled {
        state.discovery.refresh_if_stale().await;
    }
    let snapshot = state.discovery.snapshot();

    let mut data = vec![DataEntry {
        id: "foundation".to_string(),
        object: "model",
        owned_by: "afm".to_string(),
        created: 0,
    }];
    let mut models = vec![ModelListEntry {
        name: "foundation (apple_foundation)".to_string(),
        model: "foundation".to_string(),
        capabilities: vec!["completion"],
    }];

    if let Some(current) = state.mlx_service.current_model_id() {
        data.push(DataEntry {
            id: current.clone(),
            object: "model",
            owned_by: "mlx".to_string(),
            created: 0,
        });
        let capabilities = state
            .mlx_service
            .capabilities()
            .await
            .map(|caps| caps.capability_tags())
            .unwrap_or_else(|_| vec!["completion"]);
        models.push(ModelListEntry {
            name: format!("{current} (mlx)"),
            model: current,
            capabilities,
        });
    }

    for discovered in &snapshot.models {
        data.push(DataEntry {
            id: discovered.display_id.clone(),
            object: "model",
            owned_by: discovered.owned_by.clone(),
            created: discovered.created_epoch,
        });
        let caps = snapshot.capabilities(&discovered.display_id);
        models.push(ModelListEntry {
            name: format!("{} ({})", discovered.original_id, discovered.backend_name),
            model: discovered.display_id.clone(),
            capabilities: caps.capability_tags(),
        });
    }

    json_response(
        StatusCode::OK,
        &json!({ "object": "list", "data": data, "models": models }),
    )
}

pub async fn handle_load(req: Request<Body>) -> Response<Body> {
    let body: serde_json::Value = match parse_json_body(req.into_body()).await {
        Ok(v) => v,
        Err(response) => return response,
    };
    let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
    json_response(StatusCode::OK, &json!({ "success": true, "model": model }))
}

pub async fn handle_unload(req: Request<Body>) -> Response<Body> {
    let body: serde_json::Value = match parse_json_body(req.into_body()).await {
        Ok(v) => v,
        Err(response) => return response,
    };
    let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
    json_response(StatusCode::OK, &json!({ "success": true, "model": model }))
}
