//! Specialist pass payloads and their parse-boundary checks.
//!
//! Each pass arrives as loosely-shaped model JSON. It is deserialised into a
//! typed struct here and immediately checked against the phase it belongs to
//! ([`StagePass::check`]); later stages only ever see checked data. Repairs
//! made at the boundary are reported as [`ValidationIssue`]s so they remain
//! visible in the packet.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::text::{normalize, TokenKind, TranslationToken};
use crate::{
    IssueCode, PayloadError, PhaseId, RelationId, SegmentId, ValidationIssue, WordId,
    WordSegmentId,
};

// ---------------------------------------------------------------------------
// Stage identity
// ---------------------------------------------------------------------------

/// Every LLM-backed step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Planning,
    Decomposition,
    SenseAssignment,
    Alignment,
    Layout,
    Monolithic,
}

impl StageKind {
    /// The four specialist passes, in execution order.
    pub const SPECIALISTS: [StageKind; 4] = [
        StageKind::Decomposition,
        StageKind::SenseAssignment,
        StageKind::Alignment,
        StageKind::Layout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Decomposition => "decomposition",
            Self::SenseAssignment => "sense_assignment",
            Self::Alignment => "alignment",
            Self::Layout => "layout",
            Self::Monolithic => "monolithic",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Shared vocabulary
// ---------------------------------------------------------------------------

/// Content words carry exactly three senses; function words one or two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WordClass {
    #[default]
    Content,
    Function,
}

impl WordClass {
    /// Maximum number of senses allowed for the class.
    pub fn max_senses(self) -> usize {
        match self {
            Self::Content => 3,
            Self::Function => 2,
        }
    }

    /// Minimum number of senses required for the class.
    pub fn min_senses(self) -> usize {
        match self {
            Self::Content => 3,
            Self::Function => 1,
        }
    }
}

/// Morphological role of a word segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Root,
    Prefix,
    Suffix,
    #[default]
    Stem,
}

/// Optional grammatical analysis of a word segment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Morphology {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tense: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lemma: Option<String>,
}

/// One English rendering of a word or word segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sense {
    pub english: String,
    #[serde(default)]
    pub nuance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Sense {
    /// The sense inserted when a word ends up with none.
    pub fn placeholder() -> Self {
        Self {
            english: "…".into(),
            nuance: "no sense available".into(),
            notes: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Phase input the checks run against
// ---------------------------------------------------------------------------

/// The source text a phase covers, one entry per canonical segment, already
/// restricted to the phase's word range.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseText {
    pub segment_id: SegmentId,
    pub text: String,
    pub translation: Option<String>,
}

impl PhaseText {
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.text.split_whitespace()
    }
}

/// Total whitespace tokens across the phase's texts.
pub fn phase_word_count(texts: &[PhaseText]) -> usize {
    texts.iter().map(|t| t.words().count()).sum()
}

/// Implemented by every specialist payload.
pub trait StagePass: Sized + for<'de> Deserialize<'de> {
    const KIND: StageKind;

    /// Validates the payload against the phase and repairs what can be
    /// repaired, returning the issues describing each repair.
    fn check(
        self,
        phase: &PhaseId,
        ctx: &CheckContext<'_>,
    ) -> Result<(Self, Vec<ValidationIssue>), PayloadError>;

    /// Deserialises and checks in one step.
    fn from_value(
        value: Value,
        phase: &PhaseId,
        ctx: &CheckContext<'_>,
    ) -> Result<(Self, Vec<ValidationIssue>), PayloadError> {
        let pass: Self =
            serde_json::from_value(value).map_err(|e| PayloadError::Shape(e.to_string()))?;
        pass.check(phase, ctx)
    }
}

/// What a payload is checked against: the phase text plus whichever earlier
/// passes have already been accepted.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub texts: &'a [PhaseText],
    pub decomposition: Option<&'a DecompositionPass>,
    pub tokens: &'a [TranslationToken],
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecomposedWord {
    pub id: WordId,
    pub surface: String,
    #[serde(default)]
    pub class: WordClass,
    /// The word's segments, in surface order.
    #[serde(default)]
    pub segment_ids: Vec<WordSegmentId>,
    /// Canonical segment the word belongs to, when the model states it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_segment_id: Option<SegmentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_anchor: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordSegment {
    pub id: WordSegmentId,
    pub word_id: WordId,
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: SegmentKind,
    #[serde(default)]
    pub tooltips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub morph: Option<Morphology>,
}

/// What a relation points at: a whole word or one of its segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationTarget {
    Word(WordId),
    Segment(WordSegmentId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationStatus {
    #[default]
    Confirmed,
    Tentative,
}

/// A cross-word grammatical link, attached to the segment carrying the marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawRelation", into = "RawRelation")]
pub struct Relation {
    pub id: RelationId,
    pub from_segment_id: WordSegmentId,
    pub target: RelationTarget,
    pub kind: String,
    pub label: String,
    pub status: RelationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRelation {
    id: String,
    from_segment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_word_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_segment_id: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    status: RelationStatus,
}

impl TryFrom<RawRelation> for Relation {
    type Error = String;

    fn try_from(raw: RawRelation) -> Result<Self, Self::Error> {
        let target = match (raw.target_word_id, raw.target_segment_id) {
            (_, Some(seg)) if !seg.trim().is_empty() => RelationTarget::Segment(
                WordSegmentId::new(seg).ok_or("blank relation target")?,
            ),
            (Some(word), _) => {
                RelationTarget::Word(WordId::new(word).ok_or("blank relation target")?)
            }
            _ => return Err(format!("relation '{}' has no target", raw.id)),
        };
        Ok(Self {
            id: RelationId::new(raw.id).ok_or("blank relation id")?,
            from_segment_id: WordSegmentId::new(raw.from_segment_id)
                .ok_or("blank relation source")?,
            target,
            kind: raw.kind,
            label: raw.label,
            status: raw.status,
        })
    }
}

impl From<Relation> for RawRelation {
    fn from(rel: Relation) -> Self {
        let (target_word_id, target_segment_id) = match rel.target {
            RelationTarget::Word(w) => (Some(w.to_string()), None),
            RelationTarget::Segment(s) => (None, Some(s.to_string())),
        };
        Self {
            id: rel.id.to_string(),
            from_segment_id: rel.from_segment_id.to_string(),
            target_word_id,
            target_segment_id,
            kind: rel.kind,
            label: rel.label,
            status: rel.status,
        }
    }
}

/// Output of the decomposition stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompositionPass {
    pub words: Vec<DecomposedWord>,
    #[serde(default)]
    pub segments: Vec<WordSegment>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl DecompositionPass {
    /// Deterministic decomposition: one word per whitespace token, each with a
    /// single `stem` segment carrying the full surface.
    ///
    /// Used when the decomposition stage fails so later stages still have a
    /// word list to work with.
    pub fn from_whitespace(texts: &[PhaseText]) -> Self {
        let mut pass = Self::default();
        for text in texts {
            for surface in text.words() {
                let n = pass.words.len() + 1;
                let (Some(word_id), Some(seg_id)) =
                    (WordId::new(format!("w{n}")), WordSegmentId::new(format!("w{n}s1")))
                else {
                    continue;
                };
                pass.segments.push(WordSegment {
                    id: seg_id.clone(),
                    word_id: word_id.clone(),
                    text: surface.to_string(),
                    kind: SegmentKind::Stem,
                    tooltips: Vec::new(),
                    morph: None,
                });
                pass.words.push(DecomposedWord {
                    id: word_id,
                    surface: surface.to_string(),
                    class: WordClass::Content,
                    segment_ids: vec![seg_id],
                    source_segment_id: Some(text.segment_id.clone()),
                    is_anchor: None,
                });
            }
        }
        pass
    }

    /// Segments of `word`, in the word's declared order.
    pub fn segments_of<'a>(&'a self, word: &DecomposedWord) -> Vec<&'a WordSegment> {
        let by_id: HashMap<&WordSegmentId, &WordSegment> =
            self.segments.iter().map(|s| (&s.id, s)).collect();
        word.segment_ids.iter().filter_map(|id| by_id.get(id).copied()).collect()
    }

    pub fn word(&self, id: &WordId) -> Option<&DecomposedWord> {
        self.words.iter().find(|w| &w.id == id)
    }

    pub fn has_segment(&self, id: &WordSegmentId) -> bool {
        self.segments.iter().any(|s| &s.id == id)
    }
}

impl StagePass for DecompositionPass {
    const KIND: StageKind = StageKind::Decomposition;

    fn check(
        mut self,
        phase: &PhaseId,
        ctx: &CheckContext<'_>,
    ) -> Result<(Self, Vec<ValidationIssue>), PayloadError> {
        let expected = phase_word_count(ctx.texts);
        if self.words.is_empty() && expected > 0 {
            return Err(PayloadError::Rejected("decomposition returned no words".into()));
        }

        let mut issues = Vec::new();
        let word_ids: HashSet<WordId> = self.words.iter().map(|w| w.id.clone()).collect();

        // Segments pointing at unknown words are unusable.
        let before = self.segments.len();
        self.segments.retain(|s| word_ids.contains(&s.word_id));
        if self.segments.len() != before {
            issues.push(ValidationIssue::warning(
                IssueCode::PayloadRepair,
                format!("dropped {} segment(s) owned by unknown words", before - self.segments.len()),
            ).in_phase(phase));
        }

        for word in &mut self.words {
            // Derive the segment order from the segment list when the word omits it.
            if word.segment_ids.is_empty() {
                word.segment_ids = self
                    .segments
                    .iter()
                    .filter(|s| s.word_id == word.id)
                    .map(|s| s.id.clone())
                    .collect();
            }
            let joined: String = {
                let by_id: HashMap<&WordSegmentId, &WordSegment> =
                    self.segments.iter().map(|s| (&s.id, s)).collect();
                word.segment_ids
                    .iter()
                    .filter_map(|id| by_id.get(id))
                    .map(|s| s.text.as_str())
                    .collect()
            };
            if !word.segment_ids.is_empty() && joined != word.surface {
                // Concatenation must reproduce the surface exactly; fall back to one stem.
                let Some(stem_id) = WordSegmentId::new(format!("{}s1", word.id)) else {
                    continue;
                };
                issues.push(
                    ValidationIssue::warning(
                        IssueCode::PayloadRepair,
                        format!(
                            "segments of word '{}' spell '{}' not '{}'; replaced with a single stem",
                            word.id, joined, word.surface
                        ),
                    )
                    .in_phase(phase),
                );
                let old: HashSet<WordSegmentId> = word.segment_ids.drain(..).collect();
                self.segments.retain(|s| !old.contains(&s.id));
                self.relations.retain(|r| !old.contains(&r.from_segment_id));
                self.segments.push(WordSegment {
                    id: stem_id.clone(),
                    word_id: word.id.clone(),
                    text: word.surface.clone(),
                    kind: SegmentKind::Stem,
                    tooltips: Vec::new(),
                    morph: None,
                });
                word.segment_ids.push(stem_id);
            }
        }

        for segment in &mut self.segments {
            segment.tooltips.retain(|t| !t.trim().is_empty());
            segment.tooltips.truncate(3);
        }

        if self.words.len() != expected {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::PayloadRepair,
                    format!(
                        "decomposition produced {} word(s) for {} source token(s)",
                        self.words.len(),
                        expected
                    ),
                )
                .in_phase(phase),
            );
        }

        Ok((self, issues))
    }
}

// ---------------------------------------------------------------------------
// Sense assignment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordSenses {
    pub word_id: WordId,
    #[serde(default)]
    pub class: WordClass,
    pub senses: Vec<Sense>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSenses {
    pub segment_id: WordSegmentId,
    pub senses: Vec<Sense>,
}

/// Output of the sense-assignment stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenseAssignmentPass {
    pub senses: Vec<WordSenses>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segment_senses: Vec<SegmentSenses>,
}

impl SenseAssignmentPass {
    pub fn for_word(&self, id: &WordId) -> Option<&WordSenses> {
        self.senses.iter().find(|s| &s.word_id == id)
    }

    pub fn for_segment(&self, id: &WordSegmentId) -> Option<&SegmentSenses> {
        self.segment_senses.iter().find(|s| &s.segment_id == id)
    }
}

impl StagePass for SenseAssignmentPass {
    const KIND: StageKind = StageKind::SenseAssignment;

    fn check(
        mut self,
        phase: &PhaseId,
        ctx: &CheckContext<'_>,
    ) -> Result<(Self, Vec<ValidationIssue>), PayloadError> {
        let mut issues = Vec::new();

        if let Some(decomp) = ctx.decomposition {
            let known: HashSet<&WordId> = decomp.words.iter().map(|w| &w.id).collect();
            let before = self.senses.len();
            self.senses.retain(|s| known.contains(&s.word_id));
            if before != self.senses.len() {
                issues.push(
                    ValidationIssue::warning(
                        IssueCode::PayloadRepair,
                        format!("dropped senses for {} unknown word(s)", before - self.senses.len()),
                    )
                    .in_phase(phase),
                );
            }
            self.segment_senses.retain(|s| decomp.has_segment(&s.segment_id));

            // The decomposition's word class is authoritative.
            for entry in &mut self.senses {
                if let Some(word) = decomp.word(&entry.word_id) {
                    entry.class = word.class;
                }
            }
        }

        if self.senses.is_empty() && phase_word_count(ctx.texts) > 0 {
            return Err(PayloadError::Rejected("sense assignment returned no senses".into()));
        }

        for entry in &mut self.senses {
            entry.senses.retain(|s| !s.english.trim().is_empty());
            entry.senses.truncate(entry.class.max_senses());
            if entry.senses.len() < entry.class.min_senses() {
                issues.push(
                    ValidationIssue::warning(
                        IssueCode::SenseCount,
                        format!(
                            "word '{}' has {} sense(s); {:?} words need {}",
                            entry.word_id,
                            entry.senses.len(),
                            entry.class,
                            entry.class.min_senses()
                        ),
                    )
                    .in_phase(phase),
                );
            }
        }
        for entry in &mut self.segment_senses {
            entry.senses.retain(|s| !s.english.trim().is_empty());
            entry.senses.truncate(WordClass::Content.max_senses());
        }

        Ok((self, issues))
    }
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GhostKind {
    /// Grammatically necessary English scaffolding with no source counterpart.
    Required,
    /// Added by the translator for clarity.
    Interpretive,
}

/// Source unit an English token is aligned with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenLink {
    Word(WordId),
    Segment(WordSegmentId),
}

impl TokenLink {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Word(w) => w.as_str(),
            Self::Segment(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawToken", into = "RawToken")]
pub struct AlignedToken {
    pub token_index: u32,
    pub text: String,
    pub link: Option<TokenLink>,
    pub ghost: Option<GhostKind>,
}

impl AlignedToken {
    pub fn is_ghost(&self) -> bool {
        self.ghost.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToken {
    token_index: u32,
    #[serde(default)]
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    linked_segment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    linked_word_id: Option<String>,
    #[serde(default)]
    is_ghost: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ghost_kind: Option<GhostKind>,
}

impl TryFrom<RawToken> for AlignedToken {
    type Error = String;

    fn try_from(raw: RawToken) -> Result<Self, Self::Error> {
        let link = raw
            .linked_segment_id
            .and_then(WordSegmentId::new)
            .map(TokenLink::Segment)
            .or_else(|| raw.linked_word_id.and_then(WordId::new).map(TokenLink::Word));
        // A ghost never links; a non-ghost without a link is an interpretive ghost.
        let (link, ghost) = match (raw.is_ghost, link) {
            (true, _) => (None, Some(raw.ghost_kind.unwrap_or(GhostKind::Interpretive))),
            (false, Some(link)) => (Some(link), None),
            (false, None) => (None, Some(raw.ghost_kind.unwrap_or(GhostKind::Interpretive))),
        };
        Ok(Self {
            token_index: raw.token_index,
            text: raw.text,
            link,
            ghost,
        })
    }
}

impl From<AlignedToken> for RawToken {
    fn from(tok: AlignedToken) -> Self {
        let (linked_word_id, linked_segment_id) = match tok.link {
            Some(TokenLink::Word(w)) => (Some(w.to_string()), None),
            Some(TokenLink::Segment(s)) => (None, Some(s.to_string())),
            None => (None, None),
        };
        Self {
            token_index: tok.token_index,
            text: tok.text,
            linked_segment_id,
            linked_word_id,
            is_ghost: tok.ghost.is_some(),
            ghost_kind: tok.ghost,
        }
    }
}

/// Output of the alignment stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentPass {
    pub tokens: Vec<AlignedToken>,
}

impl AlignmentPass {
    /// Word ids in English reading order. Segment links resolve to their
    /// word; ghosts are skipped and each word appears once.
    pub fn reading_order(&self, decomposition: &DecompositionPass) -> Vec<WordId> {
        let owner: HashMap<&WordSegmentId, &WordId> =
            decomposition.segments.iter().map(|s| (&s.id, &s.word_id)).collect();
        let mut seen: HashSet<WordId> = HashSet::new();
        self.tokens
            .iter()
            .filter_map(|tok| match &tok.link {
                Some(TokenLink::Word(w)) => Some(w.clone()),
                Some(TokenLink::Segment(s)) => owner.get(s).map(|w| (*w).clone()),
                None => None,
            })
            .filter(|w| seen.insert(w.clone()))
            .collect()
    }
}

impl StagePass for AlignmentPass {
    const KIND: StageKind = StageKind::Alignment;

    fn check(
        mut self,
        phase: &PhaseId,
        ctx: &CheckContext<'_>,
    ) -> Result<(Self, Vec<ValidationIssue>), PayloadError> {
        let mut issues = Vec::new();
        let by_index: HashMap<u32, &TranslationToken> =
            ctx.tokens.iter().map(|t| (t.index, t)).collect();

        // Keep only tokens that exist and are not whitespace; the tokenizer's
        // text wins over whatever the model echoed back.
        let before = self.tokens.len();
        self.tokens.retain_mut(|tok| match by_index.get(&tok.token_index) {
            Some(t) if t.kind != TokenKind::Whitespace => {
                tok.text = t.text.clone();
                true
            }
            _ => false,
        });
        self.tokens.sort_by_key(|t| t.token_index);
        self.tokens.dedup_by_key(|t| t.token_index);
        if self.tokens.len() != before {
            issues.push(
                ValidationIssue::info(
                    IssueCode::PayloadRepair,
                    format!("ignored {} alignment token(s) with unknown indices", before - self.tokens.len()),
                )
                .in_phase(phase),
            );
        }

        if let Some(decomp) = ctx.decomposition {
            for tok in &mut self.tokens {
                let known = match &tok.link {
                    Some(TokenLink::Word(w)) => decomp.word(w).is_some(),
                    Some(TokenLink::Segment(s)) => decomp.has_segment(s),
                    None => true,
                };
                if !known {
                    tok.link = None;
                    tok.ghost = Some(GhostKind::Interpretive);
                }
            }
        }

        if self.tokens.is_empty() && ctx.tokens.iter().any(|t| t.kind != TokenKind::Whitespace) {
            return Err(PayloadError::Rejected("alignment returned no tokens".into()));
        }
        Ok((self, issues))
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Maximum number of words in one layout block.
pub const MAX_BLOCK_WORDS: usize = 5;

/// Output of the layout stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutPass {
    pub layout_blocks: Vec<Vec<WordId>>,
}

impl LayoutPass {
    /// Sanitises blocks against the phase's word order: unknown ids are
    /// dropped, repeats removed, missing words appended, oversize blocks split.
    pub fn sanitized(self, word_order: &[WordId]) -> (Self, usize) {
        let known: HashSet<&WordId> = word_order.iter().collect();
        let mut seen: HashSet<WordId> = HashSet::new();
        let mut repairs = 0;
        let mut blocks = Vec::new();

        for block in self.layout_blocks {
            let cleaned: Vec<WordId> = block
                .into_iter()
                .filter(|id| {
                    let keep = known.contains(id) && seen.insert(id.clone());
                    if !keep {
                        repairs += 1;
                    }
                    keep
                })
                .collect();
            if cleaned.len() > MAX_BLOCK_WORDS {
                repairs += 1;
            }
            blocks.extend(cleaned.chunks(MAX_BLOCK_WORDS).map(<[WordId]>::to_vec));
        }

        let missing: Vec<WordId> = word_order.iter().filter(|id| !seen.contains(*id)).cloned().collect();
        if !missing.is_empty() {
            repairs += missing.len();
            blocks.extend(missing.chunks(MAX_BLOCK_WORDS).map(<[WordId]>::to_vec));
        }
        (Self { layout_blocks: blocks }, repairs)
    }
}

impl StagePass for LayoutPass {
    const KIND: StageKind = StageKind::Layout;

    fn check(
        self,
        phase: &PhaseId,
        ctx: &CheckContext<'_>,
    ) -> Result<(Self, Vec<ValidationIssue>), PayloadError> {
        let Some(decomp) = ctx.decomposition else {
            return Ok((self, Vec::new()));
        };
        let order: Vec<WordId> = decomp.words.iter().map(|w| w.id.clone()).collect();
        let (pass, repairs) = self.sanitized(&order);
        let issues = if repairs > 0 {
            vec![ValidationIssue::info(
                IssueCode::PayloadRepair,
                format!("layout needed {repairs} repair(s)"),
            )
            .in_phase(phase)]
        } else {
            Vec::new()
        };
        Ok((pass, issues))
    }
}

// ---------------------------------------------------------------------------
// Tagged payload
// ---------------------------------------------------------------------------

/// A checked specialist payload, tagged by the stage that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayload {
    Decomposition(DecompositionPass),
    SenseAssignment(SenseAssignmentPass),
    Alignment(AlignmentPass),
    Layout(LayoutPass),
}

impl StagePayload {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Decomposition(_) => StageKind::Decomposition,
            Self::SenseAssignment(_) => StageKind::SenseAssignment,
            Self::Alignment(_) => StageKind::Alignment,
            Self::Layout(_) => StageKind::Layout,
        }
    }

    /// Parses `value` as the payload of `kind` and checks it.
    pub fn parse(
        kind: StageKind,
        value: Value,
        phase: &PhaseId,
        ctx: &CheckContext<'_>,
    ) -> Result<(Self, Vec<ValidationIssue>), PayloadError> {
        match kind {
            StageKind::Decomposition => DecompositionPass::from_value(value, phase, ctx)
                .map(|(p, i)| (Self::Decomposition(p), i)),
            StageKind::SenseAssignment => SenseAssignmentPass::from_value(value, phase, ctx)
                .map(|(p, i)| (Self::SenseAssignment(p), i)),
            StageKind::Alignment => AlignmentPass::from_value(value, phase, ctx)
                .map(|(p, i)| (Self::Alignment(p), i)),
            StageKind::Layout => {
                LayoutPass::from_value(value, phase, ctx).map(|(p, i)| (Self::Layout(p), i))
            }
            other => Err(PayloadError::Rejected(format!("{other} is not a specialist pass"))),
        }
    }
}

/// Joins a word's segment texts; equals the surface for a checked pass.
pub fn spelled(segments: &[&WordSegment]) -> String {
    segments.iter().map(|s| s.text.as_str()).collect()
}

/// Normalised surface comparison used when attributing words to segments.
pub fn same_surface(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}
