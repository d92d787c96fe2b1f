//! CLI entry point (spec §6.1): `serve` starts the HTTP gateway, `mlx`
//! starts it with a model preloaded, `prompt` runs one generation against
//! stdout and exits.
//!
//! Grounded on the teacher's `main_web.rs`: `#[tokio::main] async fn main`
//! dispatching into a `run_server`-shaped function, plus `setup_logging()`
//! called first thing. Unlike the teacher (a single fixed binary mode),
//! this binary wraps that bootstrap in `clap` subcommands per spec §6.1.

use std::path::PathBuf;
use std::pin::Pin;
use std::future::Future;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, warn};

use afm::error::{AfmError, AfmResult};
use afm::foundation::session::{FoundationSession, PlatformBackend};
use afm::mlx::cache_resolver::CacheResolver;
use afm::mlx::container::Container;
use afm::mlx::registry::ModelRegistry;
use afm::mlx::service::{ContainerLoader, MlxService, ProgressSink, WeightFetcher};
use afm::mlx::templates::ToolCallParser;
use afm::state::{AppState, ServeConfig};
use afm::types::{ChatCompletionRequest, Message, MessageContent, RandomnessConfig, Role};

#[derive(Parser)]
#[command(name = "afm", about = "Local OpenAI-compatible inference gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway (spec §6).
    Serve(ServeArgs),
    /// Start the HTTP gateway with an MLX model preloaded.
    Mlx(MlxArgs),
    /// Run a single prompt against stdout and exit, without starting a server.
    Prompt(PromptArgs),
}

#[derive(Parser)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,
    #[arg(long, default_value_t = 8008)]
    port: u16,
    #[arg(long, default_value_t = true)]
    streaming: bool,
    #[arg(long, default_value_t = true)]
    gateway: bool,
    #[arg(long)]
    prewarm: bool,
    #[arg(long)]
    adapter: Option<PathBuf>,
    #[arg(long, default_value = "You are a helpful assistant.")]
    instructions: String,
    #[arg(long)]
    permissive_guardrails: bool,
    #[arg(long)]
    tool_call_parser: Option<String>,
    #[arg(long)]
    fix_tool_args: bool,
}

#[derive(Parser)]
struct MlxArgs {
    #[command(flatten)]
    serve: ServeArgs,
    /// Model id to preload before accepting requests.
    #[arg(long)]
    model: String,
}

#[derive(Parser)]
struct PromptArgs {
    text: String,
    /// `"foundation"` routes through the on-device platform session;
    /// anything else is resolved as an MLX model id.
    #[arg(long, default_value = "foundation")]
    model: String,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    tool_call_parser: Option<String>,
}

#[tokio::main]
async fn main() {
    afm::logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => run_serve(args, None).await,
        Command::Mlx(args) => {
            let model = args.model.clone();
            run_serve(args.serve, Some(model)).await
        }
        Command::Prompt(args) => run_prompt(args).await,
    };

    if let Err(e) = result {
        error!("afm exited with an error: {e}");
        std::process::exit(1);
    }
}

fn parse_tool_call_parser(name: &Option<String>) -> Option<ToolCallParser> {
    name.as_deref().and_then(|n| {
        let parsed = ToolCallParser::parse(n);
        if parsed.is_none() {
            warn!("unknown --tool-call-parser \"{n}\"; ignoring");
        }
        parsed
    })
}

fn build_mlx_service() -> Arc<MlxService> {
    Arc::new(MlxService::new(
        CacheResolver::from_env(),
        ModelRegistry::from_default_path(),
        Box::new(UnimplementedWeightFetcher),
        Box::new(UnimplementedContainerLoader),
        None,
    ))
}

async fn run_serve(args: ServeArgs, preload_model: Option<String>) -> AfmResult<()> {
    let config = ServeConfig {
        hostname: args.hostname,
        port: args.port,
        streaming_default: args.streaming,
        gateway_enabled: args.gateway,
    };

    let mlx_service = build_mlx_service();
    let mut state = AppState::new(config, mlx_service);
    state.tool_call_parser_override = parse_tool_call_parser(&args.tool_call_parser);
    state.fix_tool_args = args.fix_tool_args;

    let session = FoundationSession::new(
        args.instructions,
        args.adapter,
        args.permissive_guardrails,
        Box::new(UnimplementedPlatformBackend),
    );
    afm::foundation::session::initialize(&state.foundation_session, session, args.prewarm).await;

    let state = Arc::new(state);

    if let Some(model) = preload_model {
        if let Err(e) = state.mlx_service.ensure_loaded(&model, None).await {
            warn!("could not preload model \"{model}\" at startup: {e}");
        }
    }

    afm::server::run(state)
        .await
        .map_err(|e| AfmError::InvalidRequest(format!("server error: {e}")))
}

async fn run_prompt(args: PromptArgs) -> AfmResult<()> {
    let message = Message {
        role: Role::User,
        content: Some(MessageContent::Text(args.text.clone())),
        tool_calls: None,
        tool_call_id: None,
        name: None,
    };

    if args.model == "foundation" {
        let session = FoundationSession::new(
            "You are a helpful assistant.".to_string(),
            None,
            false,
            Box::new(UnimplementedPlatformBackend),
        );
        let reply = session.respond(&args.text, &RandomnessConfig::default())?;
        println!("{reply}");
        return Ok(());
    }

    let mlx_service = build_mlx_service();
    let tool_call_parser_override = parse_tool_call_parser(&args.tool_call_parser);
    mlx_service.ensure_loaded(&args.model, None).await?;

    let chat_request = ChatCompletionRequest {
        model: args.model,
        messages: vec![message],
        temperature: args.temperature,
        top_p: None,
        top_k: None,
        min_p: None,
        max_tokens: None,
        max_completion_tokens: None,
        frequency_penalty: None,
        presence_penalty: None,
        repetition_penalty: None,
        stop: None,
        stream: false,
        tools: None,
        tool_choice: None,
        response_format: None,
        logprobs: None,
        top_logprobs: None,
        seed: None,
    };

    let request = afm::mlx::generation::GenerationRequest {
        chat_request: &chat_request,
        tool_call_parser_override,
        fix_tool_args: false,
        schema_properties: Vec::new(),
        want_logprobs: false,
    };

    afm::mlx::generation::generate(&mlx_service, request, |event| {
        if let afm::mlx::generation::GenerationEvent::Delta { text, .. } = event {
            print!("{text}");
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
        true
    })
    .await?;
    println!();
    Ok(())
}

/// Stands in for the real weight-download transport (spec §1 out-of-scope):
/// always reports that weights must be placed in the cache directory by
/// hand, rather than silently pretending to fetch them.
struct UnimplementedWeightFetcher;

impl WeightFetcher for UnimplementedWeightFetcher {
    fn fetch<'a>(
        &'a self,
        model_id: &'a str,
        _progress: ProgressSink,
    ) -> Pin<Box<dyn Future<Output = AfmResult<()>> + Send + 'a>> {
        Box::pin(async move {
            Err(AfmError::NotAvailable(format!(
                "no weight-download transport in this build; place \"{model_id}\"'s files in the model cache directory directly"
            )))
        })
    }
}

/// Stands in for the real Apple MLX binding (spec §1 out-of-scope): always
/// reports that loading is unavailable rather than fabricating a container.
struct UnimplementedContainerLoader;

impl ContainerLoader for UnimplementedContainerLoader {
    fn load(&self, _weight_dir: &std::path::Path, model_id: &str) -> AfmResult<Box<dyn Container>> {
        Err(AfmError::NotAvailable(format!(
            "no MLX container binding in this build; cannot load \"{model_id}\""
        )))
    }
}

/// Stands in for the real on-device FoundationModels binding (spec §1
/// out-of-scope): always reports unavailability through the same error
/// path a real guardrail/session failure would use.
struct UnimplementedPlatformBackend;

impl PlatformBackend for UnimplementedPlatformBackend {
    fn respond(&self, _instructions: &str, _prompt: &str, _randomness: &RandomnessConfig) -> Result<String, String> {
        Err("no platform FoundationModels binding in this build".to_string())
    }

    fn stream_response(
        &self,
        _instructions: &str,
        _prompt: &str,
        _randomness: &RandomnessConfig,
        _on_chunk: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), String> {
        Err("no platform FoundationModels binding in this build".to_string())
    }

    fn respond_guided(
        &self,
        _instructions: &str,
        _prompt: &str,
        _schema: &serde_json::Value,
        _randomness: &RandomnessConfig,
    ) -> Result<Vec<String>, String> {
        Err("no platform FoundationModels binding in this build".to_string())
    }

    fn stream_response_guided(
        &self,
        _instructions: &str,
        _prompt: &str,
        _schema: &serde_json::Value,
        _randomness: &RandomnessConfig,
        _on_chunk: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), String> {
        Err("no platform FoundationModels binding in this build".to_string())
    }
}
