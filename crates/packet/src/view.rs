//! The compiled artefacts: skeleton phases, assembled phase views and the packet.

use serde::{Deserialize, Serialize};

use crate::{
    CanonicalSegment, Confidence, GhostKind, Morphology, PacketId, PacketSource, PhaseId,
    Relation, SegmentId, SegmentKind, Sense, SourceRef, StageKind, Timestamp, ValidationIssue,
    WordClass, WordId, WordRange, WordSegmentId,
};

// ---------------------------------------------------------------------------
// Planning output
// ---------------------------------------------------------------------------

/// A study-sized group of canonical segments, produced once by planning and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkeletonPhase {
    pub id: PhaseId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub segment_ids: Vec<SegmentId>,
    /// Set only when the phase holds a slice of a single long segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_range: Option<WordRange>,
}

// ---------------------------------------------------------------------------
// Assembled phase
// ---------------------------------------------------------------------------

/// One morphological piece of a word as shown in the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSegment {
    pub id: WordSegmentId,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    #[serde(default)]
    pub tooltips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub morph: Option<Morphology>,
    /// Segment-level senses (compounds).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub senses: Vec<Sense>,
    /// Relations whose grammatical marker sits on this segment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Relation>,
}

impl ViewSegment {
    /// The ellipsis `stem` inserted into a word that has no segments.
    pub fn placeholder(id: WordSegmentId) -> Self {
        Self {
            id,
            text: "…".into(),
            kind: SegmentKind::Stem,
            tooltips: Vec::new(),
            morph: None,
            senses: Vec::new(),
            relations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseWord {
    pub id: WordId,
    pub surface: String,
    #[serde(default)]
    pub class: WordClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_segment_id: Option<SegmentId>,
    pub segments: Vec<ViewSegment>,
    pub senses: Vec<Sense>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_anchor: Option<bool>,
}

impl PhaseWord {
    /// Concatenated segment texts.
    pub fn spelled(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }
}

/// One entry of the English reading line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnglishToken {
    pub id: String,
    /// Index into the tokenised reference translation; absent for synthesized lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_index: Option<u32>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_word_id: Option<WordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_segment_id: Option<WordSegmentId>,
    #[serde(default)]
    pub is_ghost: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ghost_kind: Option<GhostKind>,
}

impl EnglishToken {
    /// The id a non-ghost token is aligned with, if any.
    pub fn target(&self) -> Option<&str> {
        if self.is_ghost {
            return None;
        }
        self.linked_segment_id
            .as_ref()
            .map(|s| s.as_str())
            .or_else(|| self.linked_word_id.as_ref().map(|w| w.as_str()))
    }
}

/// How the phase was produced and how far to trust it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub confidence: Confidence,
    /// Share of looked-up surface forms that had a dictionary entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary_coverage: Option<f64>,
    pub completed_stages: Vec<StageKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Handoff {
    pub fn new() -> Self {
        Self {
            confidence: Confidence::full(),
            dictionary_coverage: None,
            completed_stages: Vec::new(),
            notes: Vec::new(),
        }
    }
}

impl Default for Handoff {
    fn default() -> Self {
        Self::new()
    }
}

/// The durable per-phase unit appended to the packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseView {
    pub id: PhaseId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub source_span: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_range: Option<WordRange>,
    pub words: Vec<PhaseWord>,
    pub english_structure: Vec<EnglishToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_blocks: Option<Vec<Vec<WordId>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<Handoff>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

impl PhaseView {
    /// Canonical segment ids covered by the phase.
    pub fn segment_ids(&self) -> impl Iterator<Item = &SegmentId> {
        self.source_span.iter().map(|r| &r.segment_id)
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// Lifecycle of a packet's compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PacketState {
    #[default]
    Planning,
    Compiling,
    /// Every planned phase was processed.
    Complete,
    /// A configured phase limit stopped processing early.
    Incomplete,
    /// Nothing usable was produced.
    Error,
}

impl PacketState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Incomplete | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_phases: usize,
    pub ready_phases: usize,
    pub total_segments: usize,
    pub ready_segments: usize,
    pub state: PacketState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase_id: Option<PhaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_phase_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerMeta {
    pub compiler_version: String,
    pub provider: String,
    pub model: String,
    pub structured_output: bool,
    pub started_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    pub planner_windows: usize,
    pub planner_fallback_windows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_limit: Option<usize>,
}

/// The complete, phase-ordered annotation artefact for one work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub packet_id: PacketId,
    pub source: PacketSource,
    pub canonical_segments: Vec<CanonicalSegment>,
    pub phases: Vec<PhaseView>,
    pub progress: Progress,
    pub compiler_meta: CompilerMeta,
    #[serde(default)]
    pub validation_issues: Vec<ValidationIssue>,
}

impl Packet {
    /// Returns `true` if any issue is an error.
    pub fn has_errors(&self) -> bool {
        self.validation_issues.iter().any(ValidationIssue::is_error)
    }

    /// Ids of phases that an error issue points at, in packet order.
    pub fn phases_needing_recompilation(&self) -> Vec<&PhaseId> {
        self.phases
            .iter()
            .map(|p| &p.id)
            .filter(|id| {
                self.validation_issues
                    .iter()
                    .any(|i| i.is_error() && i.phase_id.as_ref() == Some(*id))
            })
            .collect()
    }
}
