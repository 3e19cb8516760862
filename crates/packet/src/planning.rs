//! Deterministic half of skeleton planning.
//!
//! The model proposes a grouping per window; everything here decides whether
//! that proposal is acceptable and, if not, produces the fallback grouping.
//! Whatever path a window takes, the union of the final phases covers every
//! input segment exactly once.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{BoundaryNote, CanonicalSegment, PhaseId, SegmentId, SkeletonPhase, WordRange};

/// Default number of segments sent to the model per planning request.
pub const DEFAULT_WINDOW_SIZE: usize = 50;

/// Default size of deterministic fallback phases.
pub const DEFAULT_FALLBACK_PHASE_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Model proposal
// ---------------------------------------------------------------------------

/// Planning response shape: `{phases: [{id, title?, segmentIds[]}]}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanProposal {
    pub phases: Vec<ProposedPhase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedPhase {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub segment_ids: Vec<String>,
}

/// Why a window's proposal was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDefect {
    Empty,
    EmptyPhase(usize),
    UnknownIds(Vec<String>),
    Duplicates(Vec<String>),
    Missing(Vec<String>),
    CrossesBoundary(String),
    /// A phase skips over segments that another phase holds.
    NotContiguous(Vec<String>),
    Malformed(String),
}

impl std::fmt::Display for PlanDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "proposal has no phases"),
            Self::EmptyPhase(i) => write!(f, "proposed phase #{i} has no segments"),
            Self::UnknownIds(ids) => write!(f, "ids outside the window: {}", ids.join(", ")),
            Self::Duplicates(ids) => write!(f, "ids assigned more than once: {}", ids.join(", ")),
            Self::Missing(ids) => write!(f, "{} id(s) missing: {}", ids.len(), ids.join(", ")),
            Self::CrossesBoundary(at) => write!(f, "phase crosses the work boundary at {at}"),
            Self::NotContiguous(ids) => {
                write!(f, "phase is not a contiguous run: {}", ids.join(", "))
            }
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

/// Splits the ordered segment list into planning windows.
pub fn windows(segments: &[CanonicalSegment], size: usize) -> Vec<&[CanonicalSegment]> {
    segments.chunks(size.max(1)).collect()
}

/// Segment ids that start a new logical work.
pub fn boundary_starts(boundaries: &[BoundaryNote]) -> HashSet<&SegmentId> {
    boundaries.iter().map(|b| &b.starts_at).collect()
}

/// Checks a proposal against its window.
///
/// Every returned id must belong to the window and every window segment must
/// appear exactly once. With `boundaries` present and cross-boundary phases
/// disallowed, no phase may contain a boundary start other than as its first
/// segment. Each phase must be a contiguous run of the window; phases and the
/// segments inside them come back in source order whatever order the model
/// listed them in.
pub fn check_proposal(
    window: &[CanonicalSegment],
    proposal: &PlanProposal,
    boundaries: &HashSet<&SegmentId>,
    allow_cross_boundary: bool,
) -> Result<Vec<SkeletonPhase>, PlanDefect> {
    if proposal.phases.is_empty() {
        return Err(PlanDefect::Empty);
    }

    let position: HashMap<&str, usize> =
        window.iter().enumerate().map(|(i, s)| (s.id().as_str(), i)).collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut unknown = Vec::new();
    let mut duplicates = Vec::new();

    for (i, phase) in proposal.phases.iter().enumerate() {
        if phase.segment_ids.is_empty() {
            return Err(PlanDefect::EmptyPhase(i));
        }
        for id in &phase.segment_ids {
            if !position.contains_key(id.as_str()) {
                unknown.push(id.clone());
            } else if !seen.insert(id.as_str()) {
                duplicates.push(id.clone());
            }
        }
    }
    if !unknown.is_empty() {
        return Err(PlanDefect::UnknownIds(unknown));
    }
    if !duplicates.is_empty() {
        return Err(PlanDefect::Duplicates(duplicates));
    }
    let missing: Vec<String> = window
        .iter()
        .map(|s| s.id().as_str())
        .filter(|id| !seen.contains(id))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(PlanDefect::Missing(missing));
    }

    let mut runs: Vec<(Vec<usize>, Option<String>)> = Vec::with_capacity(proposal.phases.len());
    for proposed in &proposal.phases {
        let mut ordered: Vec<usize> =
            proposed.segment_ids.iter().filter_map(|id| position.get(id.as_str()).copied()).collect();
        ordered.sort_unstable();
        if ordered.windows(2).any(|pair| pair[1] != pair[0] + 1) {
            let ids = ordered.iter().map(|&i| window[i].id().to_string()).collect();
            return Err(PlanDefect::NotContiguous(ids));
        }
        runs.push((ordered, proposed.title.clone().filter(|t| !t.trim().is_empty())));
    }
    runs.sort_by_key(|(ordered, _)| ordered.first().copied());

    let mut phases = Vec::with_capacity(runs.len());
    for (ordered, title) in runs {
        let segment_ids: Vec<SegmentId> = ordered.iter().map(|&i| window[i].id().clone()).collect();

        if !allow_cross_boundary {
            if let Some(crossing) = segment_ids.iter().skip(1).find(|id| boundaries.contains(id)) {
                return Err(PlanDefect::CrossesBoundary(crossing.to_string()));
            }
        }

        phases.push(SkeletonPhase {
            id: placeholder_id(),
            title,
            segment_ids,
            word_range: None,
        });
    }
    Ok(phases)
}

/// Deterministic grouping: phases of at most `phase_size` segments, starting a
/// new phase at each boundary when cross-boundary phases are disallowed.
pub fn fallback_phases(
    window: &[CanonicalSegment],
    phase_size: usize,
    boundaries: &HashSet<&SegmentId>,
    allow_cross_boundary: bool,
) -> Vec<SkeletonPhase> {
    let phase_size = phase_size.max(1);
    let mut phases = Vec::new();
    let mut current: Vec<SegmentId> = Vec::new();

    for segment in window {
        let at_boundary = !allow_cross_boundary && boundaries.contains(segment.id());
        if !current.is_empty() && (current.len() >= phase_size || at_boundary) {
            phases.push(std::mem::take(&mut current));
        }
        current.push(segment.id().clone());
    }
    if !current.is_empty() {
        phases.push(current);
    }

    phases
        .into_iter()
        .map(|segment_ids| SkeletonPhase {
            id: placeholder_id(),
            title: None,
            segment_ids,
            word_range: None,
        })
        .collect()
}

/// Splits single-segment phases whose segment has more than `max_words` words
/// into consecutive sub-segment phases carrying a [`WordRange`].
pub fn split_long_segments(
    phases: Vec<SkeletonPhase>,
    segments: &[CanonicalSegment],
    max_words: usize,
) -> Vec<SkeletonPhase> {
    let max_words = max_words.max(1);
    let words: HashMap<&SegmentId, usize> =
        segments.iter().map(|s| (s.id(), s.word_count())).collect();

    let mut out = Vec::with_capacity(phases.len());
    for phase in phases {
        let count = match phase.segment_ids.as_slice() {
            [only] if phase.word_range.is_none() => words.get(only).copied().unwrap_or(0),
            _ => 0,
        };
        if count <= max_words {
            out.push(phase);
            continue;
        }
        let parts = count.div_ceil(max_words);
        let base = count / parts;
        let extra = count % parts;
        let mut start = 0;
        for part in 0..parts {
            let len = base + usize::from(part < extra);
            out.push(SkeletonPhase {
                id: placeholder_id(),
                title: phase.title.as_ref().map(|t| format!("{t} ({}/{parts})", part + 1)),
                segment_ids: phase.segment_ids.clone(),
                word_range: WordRange::new(start, start + len),
            });
            start += len;
        }
    }
    out
}

/// Assigns sequential ids `p1`, `p2`, … in order.
pub fn renumber(phases: &mut [SkeletonPhase]) {
    for (i, phase) in phases.iter_mut().enumerate() {
        phase.id = PhaseId::numbered(i + 1);
    }
}

/// Id carried by phases until [`renumber`] runs.
fn placeholder_id() -> PhaseId {
    PhaseId::numbered(0)
}

/// Returns every segment id that is not covered exactly once by `phases`
/// (ignoring word-range splits). Empty means full single coverage.
pub fn coverage_gaps(segments: &[CanonicalSegment], phases: &[SkeletonPhase]) -> Vec<SegmentId> {
    let mut counts: HashMap<&SegmentId, usize> = HashMap::new();
    for phase in phases {
        if phase.word_range.is_some_and(|r| r.start > 0) {
            continue;
        }
        for id in &phase.segment_ids {
            *counts.entry(id).or_default() += 1;
        }
    }
    segments
        .iter()
        .map(CanonicalSegment::id)
        .filter(|id| counts.get(id).copied().unwrap_or(0) != 1)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::segment;

    fn segs(n: usize) -> Vec<CanonicalSegment> {
        (0..n).map(|i| segment(&format!("s{i}"), i as u32, "a b", None)).collect()
    }

    fn proposal(groups: &[&[&str]]) -> PlanProposal {
        PlanProposal {
            phases: groups
                .iter()
                .map(|g| ProposedPhase {
                    id: None,
                    title: None,
                    segment_ids: g.iter().map(|s| s.to_string()).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn accepts_exact_cover_and_sorts_within_phase() {
        let w = segs(3);
        let phases =
            check_proposal(&w, &proposal(&[&["s1", "s0"], &["s2"]]), &HashSet::new(), false).unwrap();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].segment_ids[0].as_str(), "s0");
    }

    #[test]
    fn rejects_missing_duplicate_and_unknown() {
        let w = segs(3);
        let none = HashSet::new();
        assert!(matches!(
            check_proposal(&w, &proposal(&[&["s0", "s1"]]), &none, false),
            Err(PlanDefect::Missing(ids)) if ids == vec!["s2".to_string()]
        ));
        assert!(matches!(
            check_proposal(&w, &proposal(&[&["s0", "s1"], &["s1", "s2"]]), &none, false),
            Err(PlanDefect::Duplicates(_))
        ));
        assert!(matches!(
            check_proposal(&w, &proposal(&[&["s0", "s1", "s2", "x"]]), &none, false),
            Err(PlanDefect::UnknownIds(_))
        ));
        assert_eq!(check_proposal(&w, &proposal(&[]), &none, false), Err(PlanDefect::Empty));
        assert_eq!(
            check_proposal(&w, &proposal(&[&["s0", "s1", "s2"], &[]]), &none, false),
            Err(PlanDefect::EmptyPhase(1))
        );
    }

    #[test]
    fn shuffled_contiguous_phases_come_back_in_source_order() {
        let w = segs(4);
        let phases =
            check_proposal(&w, &proposal(&[&["s3"], &["s2", "s1"], &["s0"]]), &HashSet::new(), false)
                .unwrap();
        let groups: Vec<Vec<&str>> = phases
            .iter()
            .map(|p| p.segment_ids.iter().map(SegmentId::as_str).collect())
            .collect();
        assert_eq!(groups, vec![vec!["s0"], vec!["s1", "s2"], vec!["s3"]]);
    }

    #[test]
    fn interleaved_phases_are_a_defect() {
        let w = segs(4);
        let result = check_proposal(&w, &proposal(&[&["s3"], &["s0", "s2"], &["s1"]]), &HashSet::new(), false);
        assert_eq!(
            result,
            Err(PlanDefect::NotContiguous(vec!["s0".to_string(), "s2".to_string()]))
        );
    }

    #[test]
    fn boundary_crossing_is_a_defect_only_when_disallowed() {
        let w = segs(3);
        let id = SegmentId::new("s1").unwrap();
        let boundaries: HashSet<&SegmentId> = [&id].into_iter().collect();
        let p = proposal(&[&["s0", "s1", "s2"]]);
        assert!(matches!(
            check_proposal(&w, &p, &boundaries, false),
            Err(PlanDefect::CrossesBoundary(_))
        ));
        assert!(check_proposal(&w, &p, &boundaries, true).is_ok());
    }

    #[test]
    fn fallback_packs_and_restarts_at_boundaries() {
        let w = segs(20);
        let id = SegmentId::new("s3").unwrap();
        let boundaries: HashSet<&SegmentId> = [&id].into_iter().collect();
        let phases = fallback_phases(&w, 8, &boundaries, false);
        let sizes: Vec<usize> = phases.iter().map(|p| p.segment_ids.len()).collect();
        assert_eq!(sizes, vec![3, 8, 8, 1]);

        let phases = fallback_phases(&w, 8, &boundaries, true);
        let sizes: Vec<usize> = phases.iter().map(|p| p.segment_ids.len()).collect();
        assert_eq!(sizes, vec![8, 8, 4]);
        assert!(coverage_gaps(&w, &phases).is_empty());
    }

    #[test]
    fn long_segments_split_into_ranges() {
        let seg = segment("long", 0, "a b c d e f g h i j", None);
        let phases = vec![SkeletonPhase {
            id: placeholder_id(),
            title: Some("Verse".into()),
            segment_ids: vec![seg.id().clone()],
            word_range: None,
        }];
        let mut split = split_long_segments(phases, std::slice::from_ref(&seg), 4);
        renumber(&mut split);
        let ranges: Vec<WordRange> = split.iter().filter_map(|p| p.word_range).collect();
        assert_eq!(ranges, vec![
            WordRange { start: 0, end: 4 },
            WordRange { start: 4, end: 7 },
            WordRange { start: 7, end: 10 },
        ]);
        assert_eq!(split[2].id.as_str(), "p3");
        assert_eq!(split[1].title.as_deref(), Some("Verse (2/3)"));
        assert!(coverage_gaps(std::slice::from_ref(&seg), &split).is_empty());
    }
}
