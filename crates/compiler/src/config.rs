//! Compiler configuration.

use std::time::Duration;

use packet::planning::{DEFAULT_FALLBACK_PHASE_SIZE, DEFAULT_WINDOW_SIZE};
use packet::{CompileError, StageKind};

use crate::gateway::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Tunables for one [`crate::PacketCompiler`]. Every field has a default so
/// a partial TOML table deserialises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Segments sent to the planner per request.
    pub window_size: usize,
    /// Segments per phase when a window falls back to deterministic chunking.
    pub fallback_phase_size: usize,
    /// Minimum gap between any two model calls, process-wide.
    pub min_call_gap_ms: u64,
    /// Further attempts after a transient provider failure.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff_ms: u64,
    /// When false every window uses deterministic chunking.
    pub use_llm_planner: bool,
    /// Whether a phase may span a work boundary.
    pub allow_cross_boundary: bool,
    /// Splits a single-segment phase into word-range slices above this many words.
    pub split_segments_over_words: Option<usize>,
    /// Stops after this many phases; the packet ends up `incomplete`.
    pub max_phases: Option<usize>,
    /// Preceding segments included in prompts as retrieval context.
    pub context_segments: usize,
    /// Missing words quoted per content-coverage warning.
    pub coverage_sample_cap: usize,
    pub stages: StageToggles,
    pub max_tokens: TokenLimits,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            fallback_phase_size: DEFAULT_FALLBACK_PHASE_SIZE,
            min_call_gap_ms: 1000,
            max_retries: 3,
            retry_backoff_ms: 2000,
            use_llm_planner: true,
            allow_cross_boundary: false,
            split_segments_over_words: None,
            max_phases: None,
            context_segments: 2,
            coverage_sample_cap: 5,
            stages: StageToggles::default(),
            max_tokens: TokenLimits::default(),
        }
    }
}

impl CompilerConfig {
    /// Rejects settings the compiler cannot run with.
    pub fn validate(&self) -> Result<(), CompileError> {
        if self.window_size == 0 {
            return Err(CompileError::Configuration("window_size must be at least 1".into()));
        }
        if self.fallback_phase_size == 0 {
            return Err(CompileError::Configuration(
                "fallback_phase_size must be at least 1".into(),
            ));
        }
        if self.split_segments_over_words == Some(0) {
            return Err(CompileError::Configuration(
                "split_segments_over_words must be at least 1 when set".into(),
            ));
        }
        if self.max_phases == Some(0) {
            return Err(CompileError::Configuration("max_phases must be at least 1 when set".into()));
        }
        Ok(())
    }

    pub fn min_call_gap(&self) -> Duration {
        Duration::from_millis(self.min_call_gap_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Per-stage on/off switches. A disabled stage counts as skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageToggles {
    pub decomposition: bool,
    pub sense_assignment: bool,
    pub alignment: bool,
    pub layout: bool,
    pub monolithic_fallback: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            decomposition: true,
            sense_assignment: true,
            alignment: true,
            layout: true,
            monolithic_fallback: true,
        }
    }
}

impl StageToggles {
    pub fn enabled(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Planning => true,
            StageKind::Decomposition => self.decomposition,
            StageKind::SenseAssignment => self.sense_assignment,
            StageKind::Alignment => self.alignment,
            StageKind::Layout => self.layout,
            StageKind::Monolithic => self.monolithic_fallback,
        }
    }
}

/// Completion token limits per call kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLimits {
    pub planning: u32,
    pub decomposition: u32,
    pub sense_assignment: u32,
    pub alignment: u32,
    pub layout: u32,
    pub monolithic: u32,
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            planning: 4096,
            decomposition: 4096,
            sense_assignment: 4096,
            alignment: 2048,
            layout: 1024,
            monolithic: 8192,
        }
    }
}

impl TokenLimits {
    pub fn for_stage(&self, stage: StageKind) -> u32 {
        match stage {
            StageKind::Planning => self.planning,
            StageKind::Decomposition => self.decomposition,
            StageKind::SenseAssignment => self.sense_assignment,
            StageKind::Alignment => self.alignment,
            StageKind::Layout => self.layout,
            StageKind::Monolithic => self.monolithic,
        }
    }
}
