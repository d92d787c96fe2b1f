//! `AppState`: the one object the HTTP layer closes over, tying the
//! foundation session, the MLX service, backend discovery, and the proxy
//! together (spec §4, §6).
//!
//! Grounded on `web/models.rs`'s `SharedLlamaState` being threaded through
//! every route handler in `main_web.rs`, generalized from "one model
//! handle" to "one handle per execution path" (spec §1's three routes:
//! foundation / MLX / proxy).

use std::sync::Arc;

use crate::foundation::session::SharedFoundationSession;
use crate::gateway::discovery::DiscoveryService;
use crate::gateway::proxy::BackendProxy;
use crate::mlx::service::MlxService;
use crate::mlx::templates::ToolCallParser;

/// Process-wide configuration threaded in from the CLI (spec §6.1).
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub hostname: String,
    pub port: u16,
    pub streaming_default: bool,
    pub gateway_enabled: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            hostname: "127.0.0.1".to_string(),
            port: 8008,
            streaming_default: true,
            gateway_enabled: true,
        }
    }
}

pub struct AppState {
    pub config: ServeConfig,
    pub foundation_session: SharedFoundationSession,
    pub mlx_service: Arc<MlxService>,
    pub discovery: Arc<DiscoveryService>,
    pub proxy: BackendProxy,
    /// `--tool-call-parser` (spec §6.1): swaps in one of the four named
    /// chat templates when the request carries tools.
    pub tool_call_parser_override: Option<ToolCallParser>,
    /// `--fix-tool-args` (spec §6.1): run `mlx::arg_remap` over extracted
    /// tool-call arguments before returning them.
    pub fix_tool_args: bool,
}

impl AppState {
    pub fn new(config: ServeConfig, mlx_service: Arc<MlxService>) -> Self {
        let discovery = DiscoveryService::new(config.port);
        AppState {
            foundation_session: crate::foundation::session::shared_slot(),
            mlx_service,
            discovery,
            proxy: BackendProxy::new(),
            config,
            tool_call_parser_override: None,
            fix_tool_args: false,
        }
    }

    /// `system_fingerprint` for a response served off the MLX path (spec
    /// §6): `"afm_mlx__<sanitized-id>"`.
    pub fn mlx_fingerprint(model_id: &str) -> String {
        let sanitized: String = model_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("afm_mlx__{sanitized}")
    }

    pub const FOUNDATION_FINGERPRINT: &'static str = "afm_apple_foundation";
}
