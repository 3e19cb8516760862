//! Core domain for the study-packet compiler.
//!
//! This crate holds every domain concept the compiler works with: canonical
//! segments, skeleton phases, the four specialist pass payloads, assembled
//! phase views and the packet itself, plus the deterministic algorithms that
//! need no model (planning fallback, rehydration, validation, progress math).
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; the `compiler` crate drives it and the `llm`
//! and `cli` crates supply the adapters.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`SegmentId`, `PhaseId`, `WordId`, ...) |
//! | [`types`] | Shared value types (`Confidence`, `WordRange`, `Timestamp`) |
//! | [`errors`] | Port, payload, stage and compile errors |
//! | [`source`] | Canonical segments and boundary notes |
//! | [`text`] | Normalisation and translation tokenisation |
//! | [`json`] | Tolerant JSON extraction for free-form model replies |
//! | [`passes`] | Specialist pass payloads and their parse-boundary checks |
//! | [`planning`] | Windowing, proposal checks and fallback chunking |
//! | [`rehydrate`] | Deterministic phase assembly |
//! | [`validate`] | Per-phase repair and per-packet validation |
//! | [`progress`] | Rolling phase durations and ETA |
//! | [`view`] | Skeleton phases, phase views and the packet |
//! | [`issues`] | Validation findings |
//! | [`ports`] | Traits for model, dictionary, source and cache adapters |

pub mod errors;
pub mod identifiers;
pub mod issues;
pub mod json;
pub mod passes;
pub mod planning;
pub mod ports;
pub mod progress;
pub mod rehydrate;
pub mod source;
pub mod text;
pub mod types;
pub mod validate;
pub mod view;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{
    CompileError, GatewayError, LookupError, PayloadError, SourceError, StageError,
};
pub use identifiers::{
    PacketId, PhaseId, RelationId, SegmentId, WordId, WordSegmentId, WorkId,
};
pub use issues::{IssueCode, Severity, ValidationIssue};
pub use passes::{
    AlignedToken, AlignmentPass, CheckContext, DecomposedWord, DecompositionPass, GhostKind,
    LayoutPass, Morphology, PhaseText, Relation, RelationStatus, RelationTarget, SegmentKind,
    SegmentSenses, Sense, SenseAssignmentPass, StageKind, StagePass, StagePayload, TokenLink,
    WordClass, WordSegment, WordSenses,
};
pub use ports::{
    CapabilityResolver, ChatMessage, ChatRequest, ChatResponse, DictionaryEntry,
    DictionaryLookup, FixedCapabilities, InMemoryStore, KeyValueStore, LlmGateway,
    ResponseFormat, Role, SegmentSource, WorkRequest,
};
pub use progress::{DurationStat, ProgressTracker};
pub use rehydrate::{Assembled, AssemblyInput, MonolithicPass};
pub use source::{BoundaryNote, CanonicalSegment, PacketSource, SourceRef};
pub use types::{Confidence, Timestamp, WordRange};
pub use validate::PacketChecks;
pub use view::{
    CompilerMeta, EnglishToken, Handoff, Packet, PacketState, PhaseView, PhaseWord, Progress,
    SkeletonPhase, ViewSegment,
};
