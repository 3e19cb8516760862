//! Single path for every model call.
//!
//! The call gateway wraps an [`LlmGateway`] adapter with the shared throttle,
//! cancellation and the two-attempt JSON strategy:
//!
//! 1. **Structured** (only when the provider/model supports it): the request
//!    carries the JSON schema and the reply must parse strictly.
//! 2. **Free-form**: one retry asking for any JSON object, parsed with
//!    bracket-balancing recovery.
//!
//! The typed parse runs inside each attempt, so a reply that is valid JSON but
//! the wrong shape also earns the free-form retry.
//!
//! Transient provider failures (transport, 429, 5xx) are retried here with
//! exponential back-off. Every retry re-enters the shared throttle.

use std::sync::Arc;
use std::time::Duration;

use packet::json::parse_lenient;
use packet::{
    ChatMessage, ChatRequest, GatewayError, LlmGateway, PayloadError, ResponseFormat, StageError,
    StageKind,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::throttle::Throttle;

/// One model call, described independently of the attempt strategy.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub stage: StageKind,
    pub system: String,
    pub user: String,
    pub schema: Value,
    pub max_tokens: u32,
}

/// Result of the structured attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Parsed(T),
    /// The provider refused the schema-constrained request.
    SchemaRejected(GatewayError),
    /// The reply could not be turned into `T`.
    Unparseable(PayloadError),
}

/// Back-off for transient provider failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

pub struct CallGateway {
    llm: Arc<dyn LlmGateway>,
    throttle: Arc<Throttle>,
    structured: bool,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl CallGateway {
    pub fn new(
        llm: Arc<dyn LlmGateway>,
        throttle: Arc<Throttle>,
        structured: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self { llm, throttle, structured, retry: RetryPolicy::default(), cancel }
    }

    /// Retries transient failures according to `retry`. Without this the
    /// gateway makes one attempt per request.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn structured(&self) -> bool {
        self.structured
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs `spec` and turns the reply into `T` with `parse`.
    pub async fn call<T, F>(&self, spec: &CallSpec, parse: F) -> Result<T, StageError>
    where
        F: Fn(Value) -> Result<T, PayloadError>,
    {
        if self.structured {
            match self.attempt_structured(spec, &parse).await? {
                Attempt::Parsed(value) => return Ok(value),
                Attempt::SchemaRejected(err) => {
                    debug!(stage = %spec.stage, error = %err, "schema rejected, retrying free-form");
                }
                Attempt::Unparseable(err) => {
                    warn!(stage = %spec.stage, error = %err, "structured reply unusable, retrying free-form");
                }
            }
        }
        self.attempt_freeform(spec, &parse).await
    }

    /// Schema-constrained attempt. Transport failures end the call; schema
    /// refusals and unusable replies are returned for the free-form retry.
    pub async fn attempt_structured<T, F>(
        &self,
        spec: &CallSpec,
        parse: &F,
    ) -> Result<Attempt<T>, StageError>
    where
        F: Fn(Value) -> Result<T, PayloadError>,
    {
        let format = ResponseFormat::JsonSchema {
            name: format!("{}_response", spec.stage.as_str()),
            schema: spec.schema.clone(),
        };
        let text = match self.send(spec, format).await {
            Ok(text) => text,
            Err(StageError::Gateway { source: err @ GatewayError::SchemaUnsupported(_), .. }) => {
                return Ok(Attempt::SchemaRejected(err));
            }
            Err(other) => return Err(other),
        };
        let parsed = serde_json::from_str::<Value>(text.trim())
            .map_err(|e| PayloadError::Shape(e.to_string()))
            .and_then(parse);
        Ok(match parsed {
            Ok(value) => Attempt::Parsed(value),
            Err(err) => Attempt::Unparseable(err),
        })
    }

    /// Unconstrained attempt with tolerant extraction.
    pub async fn attempt_freeform<T, F>(&self, spec: &CallSpec, parse: &F) -> Result<T, StageError>
    where
        F: Fn(Value) -> Result<T, PayloadError>,
    {
        let text = self.send(spec, ResponseFormat::JsonObject).await?;
        parse_lenient(&text)
            .and_then(parse)
            .map_err(|source| StageError::Payload { stage: spec.stage, source })
    }

    async fn send(&self, spec: &CallSpec, response_format: ResponseFormat) -> Result<String, StageError> {
        let request = ChatRequest {
            messages: vec![ChatMessage::system(&spec.system), ChatMessage::user(&spec.user)],
            response_format,
            max_tokens: spec.max_tokens,
        };
        let mut attempt = 0;
        loop {
            self.throttle.acquire(&self.cancel).await?;
            debug!(stage = %spec.stage, provider = self.llm.provider_name(), attempt, "model call");
            let reply = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StageError::Cancelled),
                reply = self.llm.chat_json(request.clone()) => reply,
            };
            match reply {
                Ok(response) if response.text.trim().is_empty() => {
                    return Err(StageError::Gateway {
                        stage: spec.stage,
                        source: GatewayError::EmptyResponse,
                    });
                }
                Ok(response) => return Ok(response.text),
                Err(source) if source.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        stage = %spec.stage,
                        error = %source,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider failure, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(StageError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(source) => return Err(StageError::Gateway { stage: spec.stage, source }),
            }
        }
    }
}

impl std::fmt::Debug for CallGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGateway")
            .field("provider", &self.llm.provider_name())
            .field("model", &self.llm.model_name())
            .field("structured", &self.structured)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
