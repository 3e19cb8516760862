//! Deterministic assembly of a [`PhaseView`] from specialist pass outputs.
//!
//! No model calls happen here. Given whichever passes succeeded, the
//! rehydrator attaches senses to words, builds the English reading line and
//! lays words out in blocks. The monolithic fallback's output is converted by
//! [`assemble_monolithic`] into the same shape.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::passes::{PhaseText, MAX_BLOCK_WORDS};
use crate::{
    AlignmentPass, CanonicalSegment, DecompositionPass, EnglishToken, GhostKind, IssueCode,
    LayoutPass, PhaseId, PhaseView, PhaseWord, Relation, SegmentId, SegmentKind, Sense,
    SenseAssignmentPass, SkeletonPhase, TokenLink, ValidationIssue, ViewSegment, WordClass,
    WordId, WordSegmentId,
};

/// Everything the rehydrator may draw on for one phase.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    pub phase: &'a SkeletonPhase,
    pub segments: &'a [&'a CanonicalSegment],
    pub texts: &'a [PhaseText],
    pub decomposition: &'a DecompositionPass,
    pub senses: Option<&'a SenseAssignmentPass>,
    pub alignment: Option<&'a AlignmentPass>,
    pub layout: Option<&'a LayoutPass>,
}

/// An assembled view plus the issues found while assembling it.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub view: PhaseView,
    pub issues: Vec<ValidationIssue>,
}

/// Builds the phase view from decomposition plus whatever else succeeded.
pub fn rehydrate(input: AssemblyInput<'_>) -> Assembled {
    let mut issues = Vec::new();
    let decomp = input.decomposition;

    let provided: Vec<Option<SegmentId>> =
        decomp.words.iter().map(|w| w.source_segment_id.clone()).collect();
    let owners = attribute_words(&provided, input.texts);

    let mut relations_by_segment: HashMap<&WordSegmentId, Vec<Relation>> = HashMap::new();
    for relation in &decomp.relations {
        relations_by_segment
            .entry(&relation.from_segment_id)
            .or_default()
            .push(relation.clone());
    }

    let words: Vec<PhaseWord> = decomp
        .words
        .iter()
        .zip(owners)
        .map(|(word, owner)| {
            let segments: Vec<ViewSegment> = decomp
                .segments_of(word)
                .into_iter()
                .map(|seg| ViewSegment {
                    id: seg.id.clone(),
                    text: seg.text.clone(),
                    kind: seg.kind,
                    tooltips: seg.tooltips.clone(),
                    morph: seg.morph.clone(),
                    senses: input
                        .senses
                        .and_then(|s| s.for_segment(&seg.id))
                        .map(|s| s.senses.clone())
                        .unwrap_or_default(),
                    relations: relations_by_segment.remove(&seg.id).unwrap_or_default(),
                })
                .collect();

            let senses = input
                .senses
                .and_then(|s| s.for_word(&word.id))
                .map(|s| s.senses.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| compound_senses(&segments));

            PhaseWord {
                id: word.id.clone(),
                surface: word.surface.clone(),
                class: word.class,
                source_segment_id: owner,
                segments,
                senses,
                is_anchor: word.is_anchor,
            }
        })
        .collect();

    let english_structure = match input.alignment {
        Some(alignment) => from_alignment(alignment, &input.phase.id, &mut issues),
        None => synthesize_from_senses(&words),
    };
    let english_structure = collapse_adjacent(english_structure);

    let word_order: Vec<WordId> = words.iter().map(|w| w.id.clone()).collect();
    let layout_blocks = match input.layout {
        Some(layout) => layout.clone().sanitized(&word_order).0.layout_blocks,
        None => fallback_layout(&words),
    };

    Assembled {
        view: PhaseView {
            id: input.phase.id.clone(),
            title: input.phase.title.clone(),
            source_span: input.segments.iter().map(|s| s.source_ref.clone()).collect(),
            word_range: input.phase.word_range,
            words,
            english_structure,
            layout_blocks: Some(layout_blocks),
            handoff: None,
            degraded: false,
            degraded_reason: None,
        },
        issues,
    }
}

/// Word-level senses for a compound that only received segment-level senses:
/// the root's senses if it has any, else the first segment that does.
fn compound_senses(segments: &[ViewSegment]) -> Vec<Sense> {
    segments
        .iter()
        .find(|s| s.kind == SegmentKind::Root && !s.senses.is_empty())
        .or_else(|| segments.iter().find(|s| !s.senses.is_empty()))
        .map(|s| s.senses.clone())
        .unwrap_or_default()
}

/// Assigns each word to the canonical segment it came from.
///
/// When every word names a segment of this phase, those names are used.
/// Otherwise words are dealt out in order, one per whitespace token of each
/// phase text; surplus words stay with the last segment.
pub fn attribute_words(provided: &[Option<SegmentId>], texts: &[PhaseText]) -> Vec<Option<SegmentId>> {
    let known: HashSet<&SegmentId> = texts.iter().map(|t| &t.segment_id).collect();
    if !provided.is_empty() && provided.iter().all(|p| p.as_ref().is_some_and(|id| known.contains(id))) {
        return provided.to_vec();
    }

    let mut slots = texts
        .iter()
        .flat_map(|t| std::iter::repeat(&t.segment_id).take(t.words().count()));
    let last = texts.last().map(|t| &t.segment_id);
    provided
        .iter()
        .map(|_| slots.next().or(last).cloned())
        .collect()
}

fn from_alignment(
    alignment: &AlignmentPass,
    phase: &PhaseId,
    issues: &mut Vec<ValidationIssue>,
) -> Vec<EnglishToken> {
    let mut targeted: HashSet<String> = HashSet::new();
    alignment
        .tokens
        .iter()
        .map(|tok| {
            let mut link = tok.link.clone();
            let mut ghost = tok.ghost;
            if let Some(target) = &link {
                if !targeted.insert(target.as_str().to_string()) {
                    issues.push(
                        ValidationIssue::warning(
                            IssueCode::DuplicateAlignment,
                            format!(
                                "token {} '{}' repeats the mapping to '{}'; kept as an interpretive ghost",
                                tok.token_index,
                                tok.text,
                                target.as_str()
                            ),
                        )
                        .in_phase(phase),
                    );
                    link = None;
                    ghost = Some(GhostKind::Interpretive);
                }
            }
            let (linked_word_id, linked_segment_id) = match link {
                Some(TokenLink::Word(w)) => (Some(w), None),
                Some(TokenLink::Segment(s)) => (None, Some(s)),
                None => (None, None),
            };
            EnglishToken {
                id: format!("t{}", tok.token_index),
                token_index: Some(tok.token_index),
                text: tok.text.clone(),
                linked_word_id,
                linked_segment_id,
                is_ghost: ghost.is_some(),
                ghost_kind: ghost,
            }
        })
        .collect()
}

/// Minimal ghost-free reading line: each word's first sense, in source order.
pub fn synthesize_from_senses(words: &[PhaseWord]) -> Vec<EnglishToken> {
    words
        .iter()
        .filter_map(|w| w.senses.first().map(|s| (w, s)))
        .enumerate()
        .map(|(n, (word, sense))| EnglishToken {
            id: format!("s{}", n + 1),
            token_index: None,
            text: sense.english.clone(),
            linked_word_id: Some(word.id.clone()),
            linked_segment_id: None,
            is_ghost: false,
            ghost_kind: None,
        })
        .collect()
}

/// Collapses adjacent entries whose text matches case-insensitively.
///
/// The first entry survives; if it is a ghost and the dropped entry was
/// linked, the link moves onto the survivor.
pub fn collapse_adjacent(tokens: Vec<EnglishToken>) -> Vec<EnglishToken> {
    let mut out: Vec<EnglishToken> = Vec::with_capacity(tokens.len());
    for tok in tokens {
        if let Some(prev) = out.last_mut() {
            if prev.text.trim().to_lowercase() == tok.text.trim().to_lowercase() {
                if prev.is_ghost && !tok.is_ghost {
                    prev.is_ghost = false;
                    prev.ghost_kind = None;
                    prev.linked_word_id = tok.linked_word_id;
                    prev.linked_segment_id = tok.linked_segment_id;
                }
                continue;
            }
        }
        out.push(tok);
    }
    out
}

/// Deterministic layout: words grouped by canonical segment, in order, each
/// group chunked into blocks of at most five.
pub fn fallback_layout(words: &[PhaseWord]) -> Vec<Vec<WordId>> {
    let mut blocks: Vec<Vec<WordId>> = Vec::new();
    let mut group: Vec<WordId> = Vec::new();
    let mut owner: Option<&SegmentId> = None;

    for word in words {
        if word.source_segment_id.as_ref() != owner && !group.is_empty() {
            blocks.extend(group.chunks(MAX_BLOCK_WORDS).map(<[WordId]>::to_vec));
            group.clear();
        }
        owner = word.source_segment_id.as_ref();
        group.push(word.id.clone());
    }
    blocks.extend(group.chunks(MAX_BLOCK_WORDS).map(<[WordId]>::to_vec));
    blocks
}

// ---------------------------------------------------------------------------
// Monolithic fallback
// ---------------------------------------------------------------------------

/// Full phase view requested in a single call when decomposition and sense
/// assignment both failed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonolithicPass {
    pub words: Vec<MonolithicWord>,
    #[serde(default)]
    pub english_structure: Vec<MonolithicToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonolithicWord {
    #[serde(default)]
    pub id: Option<String>,
    pub surface: String,
    #[serde(default)]
    pub class: WordClass,
    #[serde(default)]
    pub source_segment_id: Option<SegmentId>,
    #[serde(default)]
    pub segments: Vec<MonolithicSegment>,
    #[serde(default)]
    pub senses: Vec<Sense>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonolithicSegment {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: SegmentKind,
    #[serde(default)]
    pub tooltips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonolithicToken {
    pub text: String,
    #[serde(default)]
    pub linked_word_id: Option<String>,
    #[serde(default)]
    pub linked_segment_id: Option<String>,
    #[serde(default)]
    pub is_ghost: bool,
    #[serde(default)]
    pub ghost_kind: Option<GhostKind>,
}

/// Converts a monolithic response into a phase view.
///
/// Ids the model left out are minted; words whose segments do not spell their
/// surface get a single stem; links to unknown ids become interpretive ghosts.
/// Returns `None` when the response has no words for a phase that has text.
pub fn assemble_monolithic(
    pass: MonolithicPass,
    phase: &SkeletonPhase,
    segments: &[&CanonicalSegment],
    texts: &[PhaseText],
) -> Option<Assembled> {
    if pass.words.is_empty() && crate::passes::phase_word_count(texts) > 0 {
        return None;
    }
    let mut issues = Vec::new();
    let provided: Vec<Option<SegmentId>> =
        pass.words.iter().map(|w| w.source_segment_id.clone()).collect();
    let owners = attribute_words(&provided, texts);

    let mut words = Vec::with_capacity(pass.words.len());
    for (n, (word, owner)) in pass.words.into_iter().zip(owners).enumerate() {
        let word_id = word
            .id
            .and_then(WordId::new)
            .unwrap_or_else(|| WordId::numbered(n + 1));
        let mut segs: Vec<ViewSegment> = word
            .segments
            .into_iter()
            .enumerate()
            .filter_map(|(k, s)| {
                let id = s
                    .id
                    .and_then(WordSegmentId::new)
                    .or_else(|| WordSegmentId::new(format!("{word_id}s{}", k + 1)))?;
                Some(ViewSegment {
                    id,
                    text: s.text,
                    kind: s.kind,
                    tooltips: s.tooltips.into_iter().take(3).collect(),
                    morph: None,
                    senses: Vec::new(),
                    relations: Vec::new(),
                })
            })
            .collect();
        let spelled: String = segs.iter().map(|s| s.text.as_str()).collect();
        if !segs.is_empty() && spelled != word.surface {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::PayloadRepair,
                    format!("monolithic word '{word_id}' segments did not spell its surface"),
                )
                .in_phase(&phase.id),
            );
            segs = WordSegmentId::new(format!("{word_id}s1"))
                .map(|id| {
                    vec![ViewSegment {
                        text: word.surface.clone(),
                        ..ViewSegment::placeholder(id)
                    }]
                })
                .unwrap_or_default();
        }
        let mut senses = word.senses;
        senses.retain(|s| !s.english.trim().is_empty());
        senses.truncate(word.class.max_senses());
        words.push(PhaseWord {
            id: word_id,
            surface: word.surface,
            class: word.class,
            source_segment_id: owner,
            segments: segs,
            senses,
            is_anchor: None,
        });
    }

    let word_ids: HashSet<&str> = words.iter().map(|w| w.id.as_str()).collect();
    let seg_ids: HashSet<&str> =
        words.iter().flat_map(|w| w.segments.iter().map(|s| s.id.as_str())).collect();
    let english_structure: Vec<EnglishToken> = pass
        .english_structure
        .into_iter()
        .filter(|t| !t.text.trim().is_empty())
        .enumerate()
        .map(|(n, t)| {
            let seg = t
                .linked_segment_id
                .filter(|id| seg_ids.contains(id.as_str()))
                .and_then(WordSegmentId::new);
            let word = t
                .linked_word_id
                .filter(|id| word_ids.contains(id.as_str()))
                .and_then(WordId::new);
            let linked = !t.is_ghost && (seg.is_some() || word.is_some());
            EnglishToken {
                id: format!("m{}", n + 1),
                token_index: None,
                text: t.text,
                linked_word_id: if linked && seg.is_none() { word } else { None },
                linked_segment_id: if linked { seg } else { None },
                is_ghost: !linked,
                ghost_kind: if linked {
                    None
                } else {
                    Some(t.ghost_kind.unwrap_or(GhostKind::Interpretive))
                },
            }
        })
        .collect();
    let english_structure = if english_structure.is_empty() {
        synthesize_from_senses(&words)
    } else {
        collapse_adjacent(english_structure)
    };

    let layout_blocks = fallback_layout(&words);
    Some(Assembled {
        view: PhaseView {
            id: phase.id.clone(),
            title: phase.title.clone(),
            source_span: segments.iter().map(|s| s.source_ref.clone()).collect(),
            word_range: phase.word_range,
            words,
            english_structure,
            layout_blocks: Some(layout_blocks),
            handoff: None,
            degraded: false,
            degraded_reason: None,
        },
        issues,
    })
}
