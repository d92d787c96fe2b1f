//! The MLX Model Service and everything it's built from (spec §4.1–§4.3.5):
//! cache resolution, the persisted model registry, the container
//! abstraction, prefix KV-cache reuse, streaming stop sequences, the
//! fallback tool-call extractor, argument remapping, prompt templates, GPU
//! memory tiering, and the generation pipeline that wires them together.

pub mod arg_remap;
pub mod cache_resolver;
pub mod container;
pub mod generation;
pub mod gpu_tiers;
pub mod kv_cache;
pub mod registry;
pub mod service;
pub mod stop_machine;
pub mod templates;
pub mod tool_extract;
