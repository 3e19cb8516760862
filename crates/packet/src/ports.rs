//! Port traits for everything the compiler talks to.
//!
//! ## Architectural Layer
//!
//! **Port definitions.** These traits say *what* the compiler needs: a
//! schema-capable chat endpoint, a capability oracle, a dictionary, a segment
//! source and key-value caches. Infrastructure crates say *how*. Tests swap in
//! fakes; [`InMemoryStore`] is both the process-scoped default and the fake.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CanonicalSegment, GatewayError, LookupError, SourceError, WorkId};

// ---------------------------------------------------------------------------
// LLM call gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// How the provider is asked to shape its answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    /// Any JSON object.
    JsonObject,
    /// A JSON object conforming to `schema` (strict structured output).
    JsonSchema { name: String, schema: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub response_format: ResponseFormat,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    /// The completion text.
    pub text: String,
    /// Provider payload, kept for debugging.
    pub raw: Option<Value>,
}

/// Schema-constrained chat completion.
///
/// Implementations make a single attempt and own transport and authentication.
/// Retry of transient failures belongs to the caller, which also paces calls.
/// Cancellation is handled by the caller dropping the returned future.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn chat_json(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// Tells the compiler whether a provider/model pair supports strict
/// structured output.
pub trait CapabilityResolver: Send + Sync {
    fn supports_structured_output(&self, provider: &str, model: &str) -> bool;
}

/// Resolver with a fixed answer; useful for tests and explicit overrides.
#[derive(Debug, Clone, Copy)]
pub struct FixedCapabilities(pub bool);

impl CapabilityResolver for FixedCapabilities {
    fn supports_structured_output(&self, _provider: &str, _model: &str) -> bool {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Dictionary
// ---------------------------------------------------------------------------

/// A dictionary entry for one surface form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryEntry {
    pub headword: String,
    #[serde(default)]
    pub definitions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
}

/// Idempotent lookup of a surface form. `Ok(None)` means "no entry".
#[async_trait]
pub trait DictionaryLookup: Send + Sync {
    async fn lookup(&self, surface: &str) -> Result<Option<DictionaryEntry>, LookupError>;
}

// ---------------------------------------------------------------------------
// Segment source
// ---------------------------------------------------------------------------

/// What to fetch from a segment source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub work_id: WorkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
}

/// Supplies the ordered canonical segments of a work.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch(&self, work: &WorkRequest) -> Result<Vec<CanonicalSegment>, SourceError>;

    /// Provider label written into every [`crate::SourceRef`].
    fn provider(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Key-value stores
// ---------------------------------------------------------------------------

/// Injected key-value store backing the process-scoped caches.
///
/// Reads are synchronous so cache hits resolve without suspension.
pub trait KeyValueStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V);

    /// Writes several entries at once.
    fn set_many(&self, entries: Vec<(String, V)>) {
        for (key, value) in entries {
            self.set(&key, value);
        }
    }
}

/// `HashMap`-backed store.
#[derive(Debug, Default)]
pub struct InMemoryStore<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> InMemoryStore<V> {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Creates a store pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = (String, V)>) -> Self {
        Self { entries: RwLock::new(entries.into_iter().collect()) }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or_else(|p| p.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> InMemoryStore<V> {
    /// Copies every entry out of the store.
    pub fn snapshot(&self) -> HashMap<String, V> {
        match self.entries.read() {
            Ok(map) => map.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl<V: Clone + Send + Sync> KeyValueStore<V> for InMemoryStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        match self.entries.read() {
            Ok(map) => map.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn set(&self, key: &str, value: V) {
        let mut map = self.entries.write().unwrap_or_else(|p| p.into_inner());
        map.insert(key.to_string(), value);
    }

    fn set_many(&self, entries: Vec<(String, V)>) {
        let mut map = self.entries.write().unwrap_or_else(|p| p.into_inner());
        map.extend(entries);
    }
}
