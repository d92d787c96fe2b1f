//! Backend Discovery Service (spec §4.5): a single-owner concurrent actor
//! that periodically refreshes a snapshot of local OpenAI-compatible
//! backends.
//!
//! Grounded on `zhubby-moltis/crates/gateway`'s reqwest-based multi-backend
//! probing and snapshot-swap routing, and on `web/routes/hub.rs`'s
//! lenient multi-shape JSON deserialization idiom (optional fields decoded
//! with `#[serde(default)]` rather than failing the whole probe on a
//! missing key).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::gateway::backends::{scan_ports, FIXED_BEARER_TOKEN, KNOWN_BACKENDS};
use crate::types::{Backend, DiscoveredModel, ModelCapabilities};

const KNOWN_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const CAPABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PORT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const PORT_SCAN_CONCURRENCY: usize = 100;
const RESCAN_INTERVAL: Duration = Duration::from_secs(30);
const STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Default)]
struct ModelsListResponse {
    #[serde(default)]
    data: Vec<ModelsListEntry>,
    #[serde(default)]
    models: Vec<ModelsListEntry>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct ModelsListEntry {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// A snapshot of everything discovery currently knows. Readers clone the
/// `Arc`; writers build a new snapshot and swap it in — atomic from the
/// reader's perspective (spec §5 ordering guarantees).
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    pub models: Vec<DiscoveredModel>,
    pub capabilities: HashMap<String, ModelCapabilities>,
}

impl DiscoverySnapshot {
    pub fn backend_for(&self, display_id: &str) -> Option<(&DiscoveredModel, String)> {
        self.models.iter().find_map(|m| {
            if m.display_id == display_id {
                Some((m, m.original_id.clone()))
            } else {
                None
            }
        })
    }

    pub fn capabilities(&self, display_id: &str) -> ModelCapabilities {
        self.capabilities.get(display_id).cloned().unwrap_or_default()
    }
}

pub struct DiscoveryService {
    self_port: u16,
    client: reqwest::Client,
    snapshot: RwLock<Arc<DiscoverySnapshot>>,
    last_rescan: RwLock<Option<Instant>>,
}

impl DiscoveryService {
    pub fn new(self_port: u16) -> Arc<Self> {
        Arc::new(DiscoveryService {
            self_port,
            client: reqwest::Client::new(),
            snapshot: RwLock::new(Arc::new(DiscoverySnapshot::default())),
            last_rescan: RwLock::new(None),
        })
    }

    pub fn snapshot(&self) -> Arc<DiscoverySnapshot> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    fn mark_rescanned(&self) {
        *self.last_rescan.write().expect("rescan lock poisoned") = Some(Instant::now());
    }

    /// Spawn the 30 s periodic full rescan loop (spec §4.5 phase 3).
    pub fn spawn_periodic(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                this.rescan().await;
                tokio::time::sleep(RESCAN_INTERVAL).await;
            }
        });
    }

    /// Triggered by `/v1/models`: rescan if the last full rescan is older
    /// than 10 s (spec §4.5 staleness rule).
    pub async fn refresh_if_stale(&self) {
        let elapsed = self.elapsed_since_last_rescan();
        if elapsed.map(|e| e > STALE_AFTER).unwrap_or(true) {
            self.rescan().await;
        }
    }

    fn elapsed_since_last_rescan(&self) -> Option<Duration> {
        self.last_rescan
            .read()
            .expect("rescan lock poisoned")
            .map(|instant| instant.elapsed())
    }

    /// Run both discovery phases and swap in the merged snapshot.
    pub async fn rescan(&self) {
        let known = self.probe_known_backends().await;
        let scanned = self.port_scan().await;

        let mut models = known;
        models.extend(scanned);

        let mut capabilities = HashMap::new();
        for model in &models {
            let mut caps = ModelCapabilities {
                vision: false,
                tools: false,
                context_length: None,
            };
            let enriched = self.enrich_capabilities(model).await;
            caps = caps.merge_or(&enriched);
            capabilities.insert(model.display_id.clone(), caps);
        }

        *self.snapshot.write().expect("snapshot lock poisoned") =
            Arc::new(DiscoverySnapshot { models, capabilities });
        self.mark_rescanned();
    }

    async fn probe_known_backends(&self) -> Vec<DiscoveredModel> {
        let mut out = Vec::new();
        for backend in KNOWN_BACKENDS {
            if backend.port == self.self_port {
                continue;
            }
            if let Some(models) = self.probe_models_endpoint(backend).await {
                out.extend(models);
            }
        }
        out
    }

    async fn port_scan(&self) -> Vec<DiscoveredModel> {
        let ports: Vec<u16> = scan_ports(self.self_port).collect();
        let results: Vec<Option<Vec<DiscoveredModel>>> = stream::iter(ports)
            .map(|port| async move {
                let open = timeout(PORT_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                if !open {
                    return None;
                }
                let backend = Backend {
                    name: "localhost",
                    hostname: "127.0.0.1",
                    port,
                };
                self.probe_models_endpoint(&backend).await
            })
            .buffer_unordered(PORT_SCAN_CONCURRENCY)
            .collect()
            .await;

        results.into_iter().flatten().flatten().collect()
    }

    async fn probe_models_endpoint(&self, backend: &Backend) -> Option<Vec<DiscoveredModel>> {
        let url = format!("{}/v1/models", backend.base_url());
        let backend_name = if backend.name == "localhost" {
            format!("localhost:{}", backend.port)
        } else {
            backend.name.to_string()
        };

        let response = timeout(
            KNOWN_PROBE_TIMEOUT,
            self.client
                .get(&url)
                .bearer_auth(FIXED_BEARER_TOKEN)
                .send(),
        )
        .await
        .ok()?
        .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let parsed: ModelsListResponse = response.json().await.ok()?;
        let entries: Vec<ModelsListEntry> = if !parsed.data.is_empty() {
            parsed.data
        } else {
            parsed.models
        };

        debug!("{} ({}) exposes {} models", backend_name, url, entries.len());

        Some(
            entries
                .into_iter()
                .map(|entry| {
                    let display_id = DiscoveredModel::display_id_for(&entry.id, &backend_name);
                    DiscoveredModel {
                        display_id,
                        original_id: entry.id,
                        owned_by: entry.owned_by.unwrap_or_else(|| backend_name.clone()),
                        backend_name: backend_name.clone(),
                        base_url: backend.base_url(),
                        created_epoch: entry.created.unwrap_or(0),
                        loaded: true,
                    }
                })
                .collect(),
        )
    }

    async fn enrich_capabilities(&self, model: &DiscoveredModel) -> ModelCapabilities {
        if model.backend_name == "Ollama" {
            return self.probe_ollama_capabilities(model).await;
        }
        if model.backend_name == "LM Studio" {
            return self.probe_lmstudio_capabilities(model).await;
        }
        ModelCapabilities::default()
    }

    async fn probe_ollama_capabilities(&self, model: &DiscoveredModel) -> ModelCapabilities {
        let url = format!("{}/api/show", model.base_url);
        let body = serde_json::json!({ "model": model.original_id });
        let result = timeout(
            CAPABILITY_PROBE_TIMEOUT,
            self.client.post(&url).json(&body).send(),
        )
        .await;

        let Ok(Ok(response)) = result else {
            warn!("ollama capability probe failed for {}", model.display_id);
            return ModelCapabilities::default();
        };
        let Ok(value) = response.json::<serde_json::Value>().await else {
            return ModelCapabilities::default();
        };

        let capabilities_list: Vec<String> = value
            .get("capabilities")
            .and_then(|c| c.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        ModelCapabilities {
            vision: capabilities_list.iter().any(|c| c == "vision"),
            tools: capabilities_list.iter().any(|c| c == "tools"),
            context_length: find_context_length(&value),
        }
    }

    async fn probe_lmstudio_capabilities(&self, model: &DiscoveredModel) -> ModelCapabilities {
        let url = format!(
            "{}/api/v0/models/{}",
            model.base_url,
            urlencoding::encode(&model.original_id)
        );
        let result = timeout(CAPABILITY_PROBE_TIMEOUT, self.client.get(&url).send()).await;

        let Ok(Ok(response)) = result else {
            warn!("lm studio capability probe failed for {}", model.display_id);
            return ModelCapabilities::default();
        };
        let Ok(value) = response.json::<serde_json::Value>().await else {
            return ModelCapabilities::default();
        };

        let capabilities_list: Vec<String> = value
            .get("capabilities")
            .and_then(|c| c.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        ModelCapabilities {
            vision: value.get("type").and_then(|t| t.as_str()) == Some("vlm")
                || capabilities_list.iter().any(|c| c == "vision"),
            tools: capabilities_list.iter().any(|c| c == "tools"),
            context_length: value.get("max_context_length").and_then(|v| v.as_u64()),
        }
    }
}

/// Scan an arbitrary JSON map for any key containing `"context_length"`
/// (spec §4.5 Ollama enrichment: "scan the map for any key containing
/// `context_length`").
fn find_context_length(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                if key.contains("context_length") {
                    if let Some(n) = v.as_u64() {
                        return Some(n);
                    }
                }
                if let Some(found) = find_context_length(v) {
                    return Some(found);
                }
            }
            None
        }
        serde_json::Value::Array(items) => items.iter().find_map(find_context_length),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_starts_empty() {
        let snapshot = DiscoverySnapshot::default();
        assert!(snapshot.models.is_empty());
        assert_eq!(snapshot.capabilities("nope"), ModelCapabilities::default());
    }

    #[test]
    fn find_context_length_scans_nested_keys() {
        let value = serde_json::json!({
            "model_info": { "llama.context_length": 8192 }
        });
        assert_eq!(find_context_length(&value), Some(8192));
    }

    #[test]
    fn find_context_length_absent_returns_none() {
        let value = serde_json::json!({ "model_info": { "other": 1 } });
        assert_eq!(find_context_length(&value), None);
    }

    #[tokio::test]
    async fn refresh_if_stale_triggers_before_any_rescan() {
        let service = DiscoveryService::new(9999);
        assert!(service.elapsed_since_last_rescan().is_none());
    }
}
