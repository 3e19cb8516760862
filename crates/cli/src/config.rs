//! The CLI's TOML configuration file.
//!
//! ```toml
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [compiler]
//! window_size = 50
//! min_call_gap_ms = 1000
//! max_retries = 3
//!
//! [observability]
//! log_level = "info"
//! format = "json"
//! otlp_endpoint = "http://localhost:4317"
//!
//! [storage]
//! dictionary = "data/dictionary.json"
//! durations = ".studypack/durations.json"
//! ```
//!
//! Every table and field is optional. API keys are never read from the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use compiler::CompilerConfig;
use llm::{CapabilityOverride, ProviderConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub compiler: CompilerConfig,
    pub observability: ObservabilityConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    #[serde(flatten)]
    pub provider: ProviderConfig,
    /// Forces structured output on or off regardless of the capability table.
    pub structured_output: Option<bool>,
    pub capabilities: Vec<CapabilityOverride>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub log_level: String,
    pub format: LogFormat,
    /// OTLP/gRPC collector; spans are exported only when set.
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            format: LogFormat::default(),
            otlp_endpoint: None,
            service_name: "studypack".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON map from surface form to dictionary entry.
    pub dictionary: Option<PathBuf>,
    /// JSON file persisting per-work phase durations between runs.
    pub durations: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.compiler.validate()?;
        Ok(config)
    }
}
