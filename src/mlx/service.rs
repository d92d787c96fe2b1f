//! MLX Model Service (spec §4.3): the core of the core. Owns the current
//! model container and the prompt-cache box behind a single mutex, counts
//! in-flight operations, and serializes `ensure_loaded` against shutdown.
//!
//! Grounded on `web/model_manager.rs::load_model`'s
//! lock-guard/already-loaded-shortcut/atomic-swap shape, generalized from a
//! GGUF-file load to the resolve/download/detect/swap pipeline spec §4.3.1
//! describes, and on `web/models.rs`'s `SharedLlamaState` for the
//! `Arc<Mutex<..>>` sharing pattern.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{AfmError, AfmResult};
use crate::mlx::cache_resolver::{normalize, CacheResolver};
use crate::mlx::container::Container;
use crate::mlx::gpu_tiers::{self, GpuMemoryPlan};
use crate::mlx::kv_cache::PromptCacheBox;
use crate::mlx::registry::ModelRegistry;
use crate::types::{ModelCapabilities, ModelLoadProgress};

/// Detected on-the-wire convention a model uses to emit tool calls (spec
/// GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallFormat {
    XmlFunction,
    Json,
    Gemma,
    None,
}

/// A blob fetcher is an external collaborator (spec §1 out-of-scope); the
/// service depends on this trait instead of a concrete downloader so tests
/// can stub it out.
pub trait WeightFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        model_id: &'a str,
        progress: ProgressSink,
    ) -> Pin<Box<dyn Future<Output = AfmResult<()>> + Send + 'a>>;
}

pub type ProgressSink = Arc<dyn Fn(ModelLoadProgress) + Send + Sync>;

/// Builds a loaded `Container` from a resolved weight directory; the real
/// Apple MLX binding implements this (see `DESIGN.md`).
pub trait ContainerLoader: Send + Sync {
    fn load(&self, weight_dir: &std::path::Path, model_id: &str) -> AfmResult<Box<dyn Container>>;
}

struct Inner {
    current_model_id: Option<String>,
    current_container: Option<Box<dyn Container>>,
    active_operation_count: u32,
    shutting_down: bool,
    gpu_configured: bool,
    prompt_cache_box: PromptCacheBox,
    tool_call_format: Option<ToolCallFormat>,
    /// `config.json`-detected vision support, merged into the loaded
    /// container's reported `ModelCapabilities` (the container itself is
    /// config-independent, since no real MLX binding exists to probe the
    /// weights directly).
    vision_detected: bool,
}

/// `Send`: the only non-`Send` piece would be `current_container`, and
/// `Container: Send` is a supertrait bound, so this holds structurally.
pub struct MlxService {
    inner: Mutex<Inner>,
    resolver: CacheResolver,
    registry: ModelRegistry,
    fetcher: Box<dyn WeightFetcher>,
    loader: Box<dyn ContainerLoader>,
    tool_call_override: Option<ToolCallFormat>,
}

impl MlxService {
    pub fn new(
        resolver: CacheResolver,
        registry: ModelRegistry,
        fetcher: Box<dyn WeightFetcher>,
        loader: Box<dyn ContainerLoader>,
        tool_call_override: Option<ToolCallFormat>,
    ) -> Self {
        MlxService {
            inner: Mutex::new(Inner {
                current_model_id: None,
                current_container: None,
                active_operation_count: 0,
                shutting_down: false,
                gpu_configured: false,
                prompt_cache_box: PromptCacheBox::default(),
                tool_call_format: None,
                vision_detected: false,
            }),
            resolver,
            registry,
            fetcher,
            loader,
            tool_call_override,
        }
    }

    pub fn current_model_id(&self) -> Option<String> {
        self.inner.try_lock().ok().and_then(|g| g.current_model_id.clone())
    }

    /// Resolve, download if missing, load, and swap in `raw_id` as the
    /// current model. No-op if it's already current. See spec §4.3.1.
    pub async fn ensure_loaded(
        &self,
        raw_id: &str,
        progress: Option<ProgressSink>,
    ) -> AfmResult<()> {
        {
            let mut guard = self.inner.lock().await;
            if guard.shutting_down {
                return Err(AfmError::ServiceShuttingDown);
            }
            guard.active_operation_count += 1;
        }
        let result = self.ensure_loaded_inner(raw_id, progress).await;
        let mut guard = self.inner.lock().await;
        guard.active_operation_count = guard.active_operation_count.saturating_sub(1);
        result
    }

    async fn ensure_loaded_inner(
        &self,
        raw_id: &str,
        progress: Option<ProgressSink>,
    ) -> AfmResult<()> {
        let normalized = normalize(raw_id);
        if normalized.trim().is_empty() {
            return Err(AfmError::InvalidRequest("empty model id".into()));
        }

        {
            let guard = self.inner.lock().await;
            if guard.current_model_id.as_deref() == Some(normalized.as_str()) {
                return Ok(());
            }
        }

        emit(&progress, "checking cache", None);
        self.configure_gpu_once().await;

        let weight_dir = match self.resolver.resolve(&normalized) {
            Some(dir) => dir,
            None => {
                emit(&progress, "downloading", Some(normalized.clone()));
                self.fetcher
                    .fetch(&normalized, progress.clone().unwrap_or_else(noop_sink))
                    .await?;
                self.resolver
                    .resolve(&normalized)
                    .ok_or_else(|| AfmError::DownloadFailed(normalized.clone()))?
            }
        };

        let config_path = weight_dir.join("config.json");
        let config: serde_json::Value = std::fs::read_to_string(&config_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null);

        let is_vision = detect_vision_model(&config);
        let tool_format = self
            .tool_call_override
            .unwrap_or_else(|| detect_tool_call_format(&config));

        emit(&progress, "loading model", None);
        let container = self
            .loader
            .load(&weight_dir, &normalized)
            .map_err(|_| AfmError::LoadFailed(normalized.clone()))?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.registry
            .register(&normalized, now)
            .map_err(|e| AfmError::LoadFailed(format!("registry write failed: {e}")))?;

        let mut guard = self.inner.lock().await;
        guard.current_container = Some(container);
        guard.current_model_id = Some(normalized);
        guard.prompt_cache_box.invalidate();
        guard.tool_call_format = Some(tool_format);
        guard.vision_detected = is_vision;

        Ok(())
    }

    async fn configure_gpu_once(&self) {
        let mut guard = self.inner.lock().await;
        if guard.gpu_configured {
            return;
        }
        let ram_gb = gpu_tiers::detect_physical_ram_gb();
        let plan: GpuMemoryPlan = gpu_tiers::plan_for(ram_gb, 4096);
        info!("configuring GPU memory limits: {plan:?}");
        guard.gpu_configured = true;
    }

    /// Wait until no operation is in flight (or 30s elapse), then mark the
    /// service as shutting down so future `ensure_loaded`/`generate` calls
    /// fail fast.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.shutting_down = true;
        }
        let deadline = timeout(Duration::from_secs(30), async {
            loop {
                {
                    let guard = self.inner.lock().await;
                    if guard.active_operation_count == 0 {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        let _ = deadline.await;
    }

    pub async fn tool_call_format(&self) -> Option<ToolCallFormat> {
        self.inner.lock().await.tool_call_format
    }

    /// The current container's capabilities, with `vision` OR'd against
    /// the `config.json`-detected flag from load time (spec §4.3.1):
    /// `Container::capabilities()` alone is config-independent, since no
    /// real MLX binding exists to probe the loaded weights for modality.
    pub async fn capabilities(&self) -> AfmResult<ModelCapabilities> {
        let guard = self.inner.lock().await;
        if guard.shutting_down {
            return Err(AfmError::ServiceShuttingDown);
        }
        let container = guard.current_container.as_deref().ok_or(AfmError::NoModelLoaded)?;
        let mut caps = container.capabilities();
        caps.vision = caps.vision || guard.vision_detected;
        Ok(caps)
    }

    pub(crate) async fn with_inner<R>(&self, f: impl FnOnce(&mut InnerView) -> R) -> AfmResult<R> {
        let mut guard = self.inner.lock().await;
        if guard.shutting_down {
            return Err(AfmError::ServiceShuttingDown);
        }
        if guard.current_container.is_none() {
            return Err(AfmError::NoModelLoaded);
        }
        let Inner {
            current_container,
            current_model_id,
            prompt_cache_box,
            ..
        } = &mut *guard;
        let mut view = InnerView {
            container: current_container.as_deref().unwrap(),
            prompt_cache_box,
            model_id: current_model_id.as_deref().unwrap(),
        };
        Ok(f(&mut view))
    }
}

/// Narrow, borrow-checker-friendly view of `Inner` handed to the generation
/// pipeline so it never needs to know about operation counting or shutdown.
pub struct InnerView<'a> {
    pub container: &'a dyn Container,
    pub prompt_cache_box: &'a mut PromptCacheBox,
    pub model_id: &'a str,
}

fn emit(sink: &Option<ProgressSink>, stage: &'static str, detail: Option<String>) {
    if let Some(sink) = sink {
        sink(ModelLoadProgress { stage, detail });
    }
}

fn noop_sink() -> ProgressSink {
    Arc::new(|_| {})
}

fn detect_vision_model(config: &serde_json::Value) -> bool {
    let model_type = config
        .get("model_type")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if model_type.contains("vl") || model_type.contains("vision") {
        return true;
    }
    if config.get("text_config").is_some() && config.get("vision_config").is_some() {
        return true;
    }
    ["vision_start_token_id", "vision_token_id", "image_token_id"]
        .iter()
        .any(|key| config.get(*key).is_some())
}

fn detect_tool_call_format(config: &serde_json::Value) -> ToolCallFormat {
    let model_type = config
        .get("model_type")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    if model_type.contains("gemma") {
        ToolCallFormat::Gemma
    } else if model_type.contains("qwen") || model_type.contains("hermes") {
        ToolCallFormat::Json
    } else if model_type.contains("llama") || model_type.contains("mistral") {
        ToolCallFormat::XmlFunction
    } else {
        ToolCallFormat::None
    }
}
