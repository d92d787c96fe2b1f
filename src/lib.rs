//! Core of the `afm` local inference gateway: MLX model lifecycle, prefix
//! KV-cache reuse, tool-call extraction, the streaming stop-sequence state
//! machine, and backend discovery/proxy. HTTP framing and CLI parsing are
//! thin wrappers around these modules.

pub mod error;
pub mod logging;
pub mod types;

pub mod foundation;
pub mod gateway;
pub mod mlx;
pub mod server;

pub mod state;

pub use error::AfmError;
