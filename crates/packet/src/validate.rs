//! Two-tier structural validation.
//!
//! [`repair_phase`] runs on every assembled phase right before it joins the
//! packet and fixes what it finds in place; nothing it reports is an error.
//! [`validate_packet`] runs once after all phases and checks cross-phase
//! properties against the canonical source. Neither ever fails: findings are
//! returned as [`ValidationIssue`]s.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::passes::PhaseText;
use crate::rehydrate::fallback_layout;
use crate::text::{content_words, english_words, normalize};
use crate::{
    CanonicalSegment, Confidence, Handoff, IssueCode, PhaseView, PhaseWord, RelationTarget,
    SegmentId, Sense, SkeletonPhase, ValidationIssue, ViewSegment, WordClass, WordId,
    WordRange, WordSegmentId,
};

// ---------------------------------------------------------------------------
// Per-phase repair
// ---------------------------------------------------------------------------

/// Repairs structural defects of one assembled phase.
pub fn repair_phase(view: &mut PhaseView) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let phase = view.id.clone();

    let mut seen_words: HashSet<&WordId> = HashSet::new();
    for word in &view.words {
        if !seen_words.insert(&word.id) {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::DuplicateWordId,
                    format!("word id '{}' appears more than once", word.id),
                )
                .in_phase(&phase),
            );
        }
    }

    for word in &mut view.words {
        if word.segments.is_empty() {
            if let Some(id) = WordSegmentId::new(format!("{}s0", word.id)) {
                word.segments.push(ViewSegment::placeholder(id));
            }
            issues.push(
                ValidationIssue::warning(
                    IssueCode::EmptyWordSegments,
                    format!("word '{}' had no segments; inserted a placeholder", word.id),
                )
                .in_phase(&phase),
            );
        }
    }

    let word_ids: HashSet<WordId> = view.words.iter().map(|w| w.id.clone()).collect();
    let segment_ids: HashSet<WordSegmentId> = view
        .words
        .iter()
        .flat_map(|w| w.segments.iter().map(|s| s.id.clone()))
        .collect();
    for segment in view.words.iter_mut().flat_map(|w| w.segments.iter_mut()) {
        segment.relations.retain(|rel| {
            let exists = match &rel.target {
                RelationTarget::Word(w) => word_ids.contains(w),
                RelationTarget::Segment(s) => segment_ids.contains(s),
            };
            if !exists {
                issues.push(
                    ValidationIssue::warning(
                        IssueCode::DanglingRelation,
                        format!("relation '{}' pointed at a missing target; removed", rel.id),
                    )
                    .in_phase(&phase),
                );
            }
            exists
        });
    }

    for word in &mut view.words {
        if word.senses.is_empty() {
            word.senses.push(Sense::placeholder());
            issues.push(
                ValidationIssue::warning(
                    IssueCode::EmptySenses,
                    format!("word '{}' had no senses; inserted a placeholder", word.id),
                )
                .in_phase(&phase),
            );
        }
    }

    let mut seen_tokens: HashSet<&str> = HashSet::new();
    for token in &view.english_structure {
        if !seen_tokens.insert(token.id.as_str()) {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::DuplicateTokenId,
                    format!("english token id '{}' appears more than once", token.id),
                )
                .in_phase(&phase),
            );
        }
    }

    issues
}

/// Placeholder view for a phase whose whole pipeline failed.
///
/// Carries one placeholder word per source segment so the packet's segment
/// coverage is unchanged.
pub fn degraded_phase(
    phase: &SkeletonPhase,
    segments: &[&CanonicalSegment],
    texts: &[PhaseText],
    reason: impl Into<String>,
) -> PhaseView {
    let words: Vec<PhaseWord> = segments
        .iter()
        .enumerate()
        .map(|(n, seg)| {
            let id = WordId::numbered(n + 1);
            let surface = texts
                .iter()
                .find(|t| &t.segment_id == seg.id())
                .map(|t| t.text.clone())
                .unwrap_or_else(|| seg.text_in(phase.word_range));
            let segments = WordSegmentId::new(format!("{id}s1"))
                .map(|s| vec![ViewSegment::placeholder(s)])
                .unwrap_or_default();
            PhaseWord {
                id,
                surface,
                class: WordClass::Content,
                source_segment_id: Some(seg.id().clone()),
                segments,
                senses: vec![Sense::placeholder()],
                is_anchor: None,
            }
        })
        .collect();
    let layout_blocks = fallback_layout(&words);

    PhaseView {
        id: phase.id.clone(),
        title: phase.title.clone(),
        source_span: segments.iter().map(|s| s.source_ref.clone()).collect(),
        word_range: phase.word_range,
        words,
        english_structure: Vec::new(),
        layout_blocks: Some(layout_blocks),
        handoff: Some(Handoff {
            confidence: Confidence::none(),
            ..Handoff::new()
        }),
        degraded: true,
        degraded_reason: Some(reason.into()),
    }
}

// ---------------------------------------------------------------------------
// Per-packet validation
// ---------------------------------------------------------------------------

/// Knobs for [`validate_packet`].
#[derive(Debug, Clone, Copy)]
pub struct PacketChecks {
    /// Maximum number of missing words quoted in one coverage warning.
    pub coverage_sample_cap: usize,
}

impl Default for PacketChecks {
    fn default() -> Self {
        Self { coverage_sample_cap: 5 }
    }
}

/// Checks the assembled phases against the canonical source.
pub fn validate_packet(
    segments: &[CanonicalSegment],
    phases: &[PhaseView],
    checks: PacketChecks,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut occurrences: HashMap<&SegmentId, Vec<&PhaseView>> = HashMap::new();
    for phase in phases {
        let mut in_phase: HashSet<&SegmentId> = HashSet::new();
        for id in phase.segment_ids() {
            if in_phase.insert(id) {
                occurrences.entry(id).or_default().push(phase);
            }
        }
    }

    for segment in segments {
        let id = segment.id();
        let found = occurrences.get(id).map(Vec::as_slice).unwrap_or_default();
        match found.len() {
            0 => issues.push(
                ValidationIssue::error(
                    IssueCode::MissingSegment,
                    format!("segment '{id}' is not covered by any phase"),
                )
                .for_segment(id),
            ),
            1 => {}
            n => issues.push(multi_phase_issue(id, found, n)),
        }
    }

    for phase in phases.iter().filter(|p| p.degraded) {
        issues.push(
            ValidationIssue::error(
                IssueCode::DegradedPhase,
                format!(
                    "phase is degraded: {}",
                    phase.degraded_reason.as_deref().unwrap_or("unknown reason")
                ),
            )
            .in_phase(&phase.id),
        );
    }

    for phase in phases {
        let mut targets: HashMap<&str, usize> = HashMap::new();
        for target in phase.english_structure.iter().filter_map(|t| t.target()) {
            *targets.entry(target).or_default() += 1;
        }
        let mut repeated: Vec<(&str, usize)> =
            targets.into_iter().filter(|(_, n)| *n > 1).collect();
        repeated.sort_unstable();
        for (target, n) in repeated {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::DuplicateAlignment,
                    format!("{n} english tokens are aligned to '{target}'"),
                )
                .in_phase(&phase.id),
            );
        }
    }

    for segment in segments {
        let Some(found) = occurrences.get(segment.id()) else {
            continue;
        };
        if let Some(issue) = check_text_integrity(segment, found) {
            issues.push(issue);
        }
        if let Some(issue) = check_content_coverage(segment, found, checks.coverage_sample_cap) {
            issues.push(issue);
        }
    }

    issues
}

fn multi_phase_issue(id: &SegmentId, found: &[&PhaseView], n: usize) -> ValidationIssue {
    let ranges: Option<Vec<WordRange>> = found.iter().map(|p| p.word_range).collect();
    let disjoint = ranges.is_some_and(|mut r| {
        r.sort_by_key(|r| r.start);
        r.windows(2).all(|w| !w[0].overlaps(w[1]))
    });
    let phase_list = found.iter().map(|p| p.id.as_str()).collect::<Vec<_>>().join(", ");
    let issue = if disjoint {
        ValidationIssue::warning(
            IssueCode::SegmentSplit,
            format!("segment '{id}' is split across {n} phases ({phase_list})"),
        )
    } else {
        ValidationIssue::warning(
            IssueCode::SegmentInMultiplePhases,
            format!("segment '{id}' appears in {n} phases ({phase_list}) without disjoint word ranges"),
        )
    };
    issue.for_segment(id)
}

/// Words of `segment` in phase order, or `None` if any phase holding it is degraded.
fn words_of<'a>(segment: &CanonicalSegment, found: &[&'a PhaseView]) -> Option<Vec<&'a PhaseWord>> {
    if found.iter().any(|p| p.degraded) {
        return None;
    }
    let mut ordered: Vec<&&PhaseView> = found.iter().collect();
    ordered.sort_by_key(|p| p.word_range.map(|r| r.start).unwrap_or(0));
    Some(
        ordered
            .into_iter()
            .flat_map(|p| p.words.iter())
            .filter(|w| w.source_segment_id.as_ref() == Some(segment.id()))
            .collect(),
    )
}

fn check_text_integrity(segment: &CanonicalSegment, found: &[&PhaseView]) -> Option<ValidationIssue> {
    let words = words_of(segment, found)?;
    let rebuilt = words.iter().map(|w| w.spelled()).collect::<Vec<_>>().join(" ");
    let expected = normalize(&segment.source_text);
    let actual = normalize(&rebuilt);
    if expected == actual {
        return None;
    }
    let mut issue = ValidationIssue::error(
        IssueCode::TextIntegrity,
        format!("segment '{}' rebuilds as '{actual}', expected '{expected}'", segment.id()),
    )
    .for_segment(segment.id());
    if let [only] = found {
        issue = issue.in_phase(&only.id);
    }
    Some(issue)
}

fn check_content_coverage(
    segment: &CanonicalSegment,
    found: &[&PhaseView],
    sample_cap: usize,
) -> Option<ValidationIssue> {
    let translation = segment.translation()?;
    let labels: HashSet<String> = found
        .iter()
        .flat_map(|p| p.english_structure.iter())
        .filter(|t| !t.is_ghost)
        .flat_map(|t| english_words(&t.text))
        .collect();
    let missing: BTreeSet<String> = content_words(translation)
        .into_iter()
        .filter(|w| !labels.contains(w))
        .collect();
    if missing.is_empty() {
        return None;
    }
    let sample: Vec<&str> = missing.iter().take(sample_cap).map(String::as_str).collect();
    let more = missing.len().saturating_sub(sample.len());
    let suffix = if more > 0 { format!(" (+{more} more)") } else { String::new() };
    Some(
        ValidationIssue::warning(
            IssueCode::ContentCoverage,
            format!(
                "translation words missing from the reading line: {}{suffix}",
                sample.join(", ")
            ),
        )
        .for_segment(segment.id()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::segment;
    use crate::{EnglishToken, PhaseId, Relation, RelationId, RelationStatus, Severity};

    fn view(id: &str, seg: &CanonicalSegment, words: Vec<PhaseWord>) -> PhaseView {
        PhaseView {
            id: PhaseId::new(id).unwrap(),
            title: None,
            source_span: vec![seg.source_ref.clone()],
            word_range: None,
            words,
            english_structure: Vec::new(),
            layout_blocks: None,
            handoff: None,
            degraded: false,
            degraded_reason: None,
        }
    }

    fn word(id: &str, seg: &CanonicalSegment, pieces: &[&str]) -> PhaseWord {
        PhaseWord {
            id: WordId::new(id).unwrap(),
            surface: pieces.concat(),
            class: WordClass::Content,
            source_segment_id: Some(seg.id().clone()),
            segments: pieces
                .iter()
                .enumerate()
                .map(|(k, p)| ViewSegment {
                    text: (*p).into(),
                    ..ViewSegment::placeholder(WordSegmentId::new(format!("{id}s{}", k + 1)).unwrap())
                })
                .collect(),
            senses: vec![Sense { english: "x".into(), nuance: String::new(), notes: None }],
            is_anchor: None,
        }
    }

    fn token(id: &str, text: &str, word: Option<&str>) -> EnglishToken {
        EnglishToken {
            id: id.into(),
            token_index: None,
            text: text.into(),
            linked_word_id: word.and_then(WordId::new),
            linked_segment_id: None,
            is_ghost: word.is_none(),
            ghost_kind: None,
        }
    }

    #[test]
    fn repair_fills_placeholders_and_strips_dangling_relations() {
        let seg = segment("a", 1, "x y", None);
        let mut w1 = word("w1", &seg, &["x"]);
        let from_segment_id = w1.segments[0].id.clone();
        w1.segments[0].relations.push(Relation {
            id: RelationId::new("r1").unwrap(),
            from_segment_id,
            target: RelationTarget::Word(WordId::new("w9").unwrap()),
            kind: "agent".into(),
            label: "by".into(),
            status: RelationStatus::Confirmed,
        });
        let mut w2 = word("w2", &seg, &[]);
        w2.senses.clear();
        let mut v = view("p1", &seg, vec![w1, w2, word("w1", &seg, &["y"])]);
        v.english_structure = vec![token("t1", "x", Some("w1")), token("t1", "y", Some("w2"))];

        let issues = repair_phase(&mut v);
        let codes: Vec<IssueCode> = issues.iter().map(|i| i.code).collect();
        assert_eq!(
            codes,
            vec![
                IssueCode::DuplicateWordId,
                IssueCode::EmptyWordSegments,
                IssueCode::DanglingRelation,
                IssueCode::EmptySenses,
                IssueCode::DuplicateTokenId,
            ]
        );
        assert!(issues.iter().all(|i| i.severity == Severity::Warning));
        assert_eq!(v.words[1].segments[0].text, "…");
        assert_eq!(v.words[1].senses[0].english, "…");
        assert!(v.words[0].segments[0].relations.is_empty());
    }

    #[test]
    fn clean_packet_has_no_issues() {
        let seg = segment("a", 1, "Evaṁ me sutaṁ—", Some("Thus I heard."));
        let mut v = view("p1", &seg, vec![
            word("w1", &seg, &["Evaṁ"]),
            word("w2", &seg, &["me"]),
            word("w3", &seg, &["sut", "aṁ—"]),
        ]);
        v.english_structure = vec![
            token("t0", "Thus", Some("w1")),
            token("t2", "I", Some("w2")),
            token("t4", "heard", Some("w3")),
        ];
        let issues = validate_packet(&[seg], &[v], PacketChecks::default());
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn missing_and_degraded_phases_are_errors() {
        let a = segment("a", 1, "x", None);
        let b = segment("b", 2, "y", None);
        let p = SkeletonPhase {
            id: PhaseId::new("p1").unwrap(),
            title: None,
            segment_ids: vec![a.id().clone()],
            word_range: None,
        };
        let degraded = degraded_phase(&p, &[&a], &[], "all stages failed");
        assert!(degraded.degraded);
        assert_eq!(degraded.words.len(), 1);
        assert_eq!(degraded.words[0].surface, "x");

        let issues = validate_packet(&[a, b], &[degraded], PacketChecks::default());
        let codes: Vec<IssueCode> = issues.iter().map(|i| i.code).collect();
        assert!(codes.contains(&IssueCode::MissingSegment));
        assert!(codes.contains(&IssueCode::DegradedPhase));
        // Degraded phases are exempt from the text check.
        assert!(!codes.contains(&IssueCode::TextIntegrity));
        assert!(issues.iter().filter(|i| i.is_error()).count() == 2);
    }

    #[test]
    fn split_segments_are_distinguished_from_duplicates() {
        let seg = segment("a", 1, "one two three four", None);
        let mut first = view("p1", &seg, vec![word("w1", &seg, &["one"]), word("w2", &seg, &["two"])]);
        first.word_range = WordRange::new(0, 2);
        let mut second =
            view("p2", &seg, vec![word("w1", &seg, &["three"]), word("w2", &seg, &["four"])]);
        second.word_range = WordRange::new(2, 4);

        let issues = validate_packet(&[seg.clone()], &[first.clone(), second], PacketChecks::default());
        assert_eq!(issues.len(), 1, "{issues:?}");
        assert_eq!(issues[0].code, IssueCode::SegmentSplit);

        let dup = view("p2", &seg, first.words.clone());
        let issues = validate_packet(&[seg], &[first, dup], PacketChecks::default());
        assert!(issues.iter().any(|i| i.code == IssueCode::SegmentInMultiplePhases));
    }

    #[test]
    fn text_mismatch_is_an_error() {
        let seg = segment("a", 1, "Evaṁ me sutaṁ", None);
        let v = view("p1", &seg, vec![word("w1", &seg, &["Evaṁ"]), word("w2", &seg, &["sutaṁ"])]);
        let issues = validate_packet(&[seg], &[v], PacketChecks::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::TextIntegrity);
        assert_eq!(issues[0].phase_id.as_ref().map(|p| p.as_str()), Some("p1"));
    }

    #[test]
    fn coverage_and_duplicate_alignment_are_warnings() {
        let seg = segment("a", 1, "x", Some("The Blessed One was staying near Sāvatthī."));
        let mut v = view("p1", &seg, vec![word("w1", &seg, &["x"])]);
        v.english_structure = vec![
            token("t1", "Blessed", Some("w1")),
            token("t2", "One", Some("w1")),
            token("t3", "staying", None),
        ];
        let issues = validate_packet(&[seg], &[v], PacketChecks { coverage_sample_cap: 2 });
        let dup = issues.iter().find(|i| i.code == IssueCode::DuplicateAlignment).unwrap();
        assert_eq!(dup.severity, Severity::Warning);
        let cov = issues.iter().find(|i| i.code == IssueCode::ContentCoverage).unwrap();
        assert_eq!(cov.severity, Severity::Warning);
        // Missing: near, staying, sāvatthī; only two are quoted.
        assert!(cov.message.contains("(+1 more)"), "{}", cov.message);
        assert!(cov.message.contains("near"));
    }
}
