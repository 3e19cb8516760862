//! Model provider infrastructure adapter.
//!
//! Implements [`packet::LlmGateway`] for OpenAI-compatible chat-completions
//! endpoints and [`packet::CapabilityResolver`] as a static table with
//! configurable overrides. Other providers are added as new adapters in this
//! crate without any changes to the `packet` or `compiler` crates.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting, response parsing
//! and back-off on rate limits live here. The compiler sees only the port
//! traits.

use thiserror::Error;

pub mod capabilities;
pub mod openai;

pub use capabilities::{CapabilityOverride, CapabilityTable};
pub use openai::{OpenAiGateway, ProviderConfig};

/// The adapter could not be constructed.
#[derive(Debug, Error)]
pub enum LlmConfigError {
    #[error("no model configured")]
    MissingModel,

    #[error("environment variable '{0}' with the API key is not set")]
    MissingApiKey(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}
