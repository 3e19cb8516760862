//! The compilation driver.
//!
//! [`PacketCompiler`] plans the segment list, runs each phase through the
//! [`Orchestrator`] strictly in order, reports progress after every phase and
//! finishes with packet-level validation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use packet::passes::PhaseText;
use packet::text::tokenize_translation;
use packet::validate::{validate_packet, PacketChecks};
use packet::{
    BoundaryNote, CanonicalSegment, CapabilityResolver, CompileError, CompilerMeta,
    DictionaryEntry, DictionaryLookup, DurationStat, FixedCapabilities, InMemoryStore, IssueCode,
    KeyValueStore, LlmGateway, Packet, PacketId, PacketSource, PacketState,
    PhaseView, Progress, ProgressTracker, SegmentId, SegmentSource, SkeletonPhase, Timestamp,
    ValidationIssue, WorkRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::CompilerConfig;
use crate::gateway::CallGateway;
use crate::orchestrator::{AssemblyPath, Orchestrator};
use crate::planner::plan;
use crate::stages::{DictionaryStep, PhaseInput};
use crate::throttle::Throttle;

/// Receives progress after planning and after every completed phase.
///
/// `phase` is the view that was just appended, so consumers can render a
/// partial packet before compilation finishes.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &Progress, phase: Option<&PhaseView>);
}

impl<F> ProgressSink for F
where
    F: Fn(&Progress, Option<&PhaseView>) + Send + Sync,
{
    fn on_progress(&self, progress: &Progress, phase: Option<&PhaseView>) {
        self(progress, phase)
    }
}

/// A sink that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _progress: &Progress, _phase: Option<&PhaseView>) {}
}

/// Input of one compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRequest {
    pub source: PacketSource,
    pub segments: Vec<CanonicalSegment>,
    pub boundaries: Vec<BoundaryNote>,
}

/// Compiles canonical segments into a packet.
///
/// The throttle and both caches live as long as the compiler, so they are
/// shared by every compilation it runs.
pub struct PacketCompiler {
    llm: Arc<dyn LlmGateway>,
    capabilities: Arc<dyn CapabilityResolver>,
    dictionary: DictionaryStep,
    durations: Arc<dyn KeyValueStore<DurationStat>>,
    throttle: Arc<Throttle>,
    config: CompilerConfig,
}

impl PacketCompiler {
    /// Creates a compiler with no dictionary, in-memory caches and free-form
    /// JSON calls.
    pub fn new(llm: Arc<dyn LlmGateway>, config: CompilerConfig) -> Result<Self, CompileError> {
        config.validate()?;
        let durations: Arc<InMemoryStore<DurationStat>> = Arc::new(InMemoryStore::new());
        Ok(Self {
            llm,
            capabilities: Arc::new(FixedCapabilities(false)),
            dictionary: DictionaryStep::disabled(),
            durations,
            throttle: Arc::new(Throttle::new(config.min_call_gap())),
            config,
        })
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Arc<dyn CapabilityResolver>) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_dictionary(
        mut self,
        lookup: Arc<dyn DictionaryLookup>,
        cache: Arc<dyn KeyValueStore<Option<DictionaryEntry>>>,
    ) -> Self {
        self.dictionary = DictionaryStep::new(lookup, cache);
        self
    }

    #[must_use]
    pub fn with_durations(mut self, durations: Arc<dyn KeyValueStore<DurationStat>>) -> Self {
        self.durations = durations;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Fetches a work from `source` and compiles it.
    pub async fn compile_work(
        &self,
        source: &dyn SegmentSource,
        work: &WorkRequest,
        boundaries: Vec<BoundaryNote>,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Packet, CompileError> {
        let segments = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CompileError::Cancelled),
            fetched = source.fetch(work) => fetched?,
        };
        let request = CompileRequest {
            source: PacketSource {
                provider: source.provider().to_string(),
                work_id: work.work_id.clone(),
                edition: work.edition.clone(),
                title: None,
            },
            segments,
            boundaries,
        };
        self.compile(request, sink, cancel).await
    }

    /// Compiles `request`. Only cancellation and invalid input are errors;
    /// everything else ends up in the packet's validation issues.
    #[instrument(skip_all, fields(work = %request.source.work_id, segments = request.segments.len()))]
    pub async fn compile(
        &self,
        request: CompileRequest,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Packet, CompileError> {
        let CompileRequest { source, segments, boundaries } = request;
        let (mut segments, input_issues) = dedupe_segments(segments);
        segments.sort_by_key(|s| s.order);

        let started_at = Timestamp::now();
        let structured = self
            .capabilities
            .supports_structured_output(self.llm.provider_name(), self.llm.model_name());
        let gateway =
            CallGateway::new(Arc::clone(&self.llm), Arc::clone(&self.throttle), structured, cancel.clone())
                .with_retry(self.config.retry_policy());
        let mut meta = CompilerMeta {
            compiler_version: env!("CARGO_PKG_VERSION").to_string(),
            provider: self.llm.provider_name().to_string(),
            model: self.llm.model_name().to_string(),
            structured_output: structured,
            started_at,
            finished_at: None,
            planner_windows: 0,
            planner_fallback_windows: 0,
            phase_limit: self.config.max_phases,
        };
        let mut issues: Vec<ValidationIssue> = input_issues;

        sink.on_progress(
            &Progress { total_segments: segments.len(), ..Progress::default() },
            None,
        );

        let plan = plan(&gateway, &self.config, &segments, &boundaries).await?;
        meta.planner_windows = plan.windows;
        meta.planner_fallback_windows = plan.fallback_windows;
        issues.extend(plan.issues);

        let mut skeleton = plan.phases;
        let truncated = match self.config.max_phases {
            Some(limit) if skeleton.len() > limit => {
                issues.push(ValidationIssue::warning(
                    IssueCode::PhaseLimit,
                    format!("stopped after {limit} of {} phases", skeleton.len()),
                ));
                true
            }
            _ => false,
        };
        let total_phases = skeleton.len();
        if let Some(limit) = self.config.max_phases {
            skeleton.truncate(limit);
        }

        let mut tracker = ProgressTracker::start(
            source.work_id.clone(),
            Arc::clone(&self.durations),
            total_phases,
            segments.len(),
        );
        sink.on_progress(tracker.snapshot(), None);

        let index: HashMap<&SegmentId, usize> =
            segments.iter().enumerate().map(|(i, s)| (s.id(), i)).collect();
        let orchestrator = Orchestrator {
            gateway: &gateway,
            config: &self.config,
            dictionary: &self.dictionary,
        };
        let mut ready: HashSet<&SegmentId> = HashSet::new();
        let mut phases: Vec<PhaseView> = Vec::with_capacity(skeleton.len());
        let mut degraded = 0;

        for phase in &skeleton {
            if cancel.is_cancelled() {
                return Err(CompileError::Cancelled);
            }
            tracker.begin_phase(&phase.id);
            let started = Instant::now();
            let input = phase_input(phase, &segments, &index, self.config.context_segments);

            let outcome = orchestrator.run_phase(&input).await?;
            if outcome.path == AssemblyPath::Degraded {
                degraded += 1;
            }
            issues.extend(outcome.issues);

            let newly_ready = input
                .segments
                .iter()
                .filter(|s| finishes_segment(phase, s))
                .filter(|s| ready.insert(s.id()))
                .count();
            let progress = tracker.phase_done(newly_ready, started.elapsed());
            sink.on_progress(progress, Some(&outcome.view));
            phases.push(outcome.view);
        }

        let checks = PacketChecks { coverage_sample_cap: self.config.coverage_sample_cap };
        issues.extend(validate_packet(&segments, &phases, checks));

        let state = if phases.is_empty() || degraded == phases.len() {
            PacketState::Error
        } else if truncated {
            PacketState::Incomplete
        } else {
            PacketState::Complete
        };
        let progress = tracker.finish(state);
        sink.on_progress(&progress, None);
        meta.finished_at = Some(Timestamp::now());

        let (info_count, warnings, errors) = packet::issues::tally(&issues);
        if errors > 0 {
            warn!(?state, errors, warnings, "packet compiled with integrity errors");
        } else {
            info!(?state, phases = phases.len(), warnings, info = info_count, "packet compiled");
        }

        Ok(Packet {
            packet_id: PacketId::new_random(),
            source,
            canonical_segments: segments,
            phases,
            progress,
            compiler_meta: meta,
            validation_issues: issues,
        })
    }
}

impl std::fmt::Debug for PacketCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCompiler")
            .field("provider", &self.llm.provider_name())
            .field("model", &self.llm.model_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Keeps the first segment for each id. Every later duplicate is dropped and
/// recorded as an error.
fn dedupe_segments(segments: Vec<CanonicalSegment>) -> (Vec<CanonicalSegment>, Vec<ValidationIssue>) {
    let mut seen: HashSet<SegmentId> = HashSet::new();
    let mut issues = Vec::new();
    let kept = segments
        .into_iter()
        .filter(|segment| {
            if seen.insert(segment.id().clone()) {
                return true;
            }
            issues.push(
                ValidationIssue::error(
                    IssueCode::DuplicateSegment,
                    format!(
                        "segment id '{}' appears more than once; order {} was dropped",
                        segment.id(),
                        segment.order
                    ),
                )
                .for_segment(segment.id()),
            );
            false
        })
        .collect();
    (kept, issues)
}

/// `true` once `phase` covers the end of `segment`.
fn finishes_segment(phase: &SkeletonPhase, segment: &CanonicalSegment) -> bool {
    phase.word_range.map_or(true, |r| r.end >= segment.word_count())
}

/// Builds the stage input for `phase`.
///
/// The reference translation of a split segment is attached to its first
/// slice only.
fn phase_input<'a>(
    phase: &'a SkeletonPhase,
    segments: &'a [CanonicalSegment],
    index: &HashMap<&SegmentId, usize>,
    context_segments: usize,
) -> PhaseInput<'a> {
    let positions: Vec<usize> =
        phase.segment_ids.iter().filter_map(|id| index.get(id).copied()).collect();
    let members: Vec<&CanonicalSegment> = positions.iter().map(|&i| &segments[i]).collect();

    let texts: Vec<PhaseText> = members
        .iter()
        .map(|s| PhaseText {
            segment_id: s.id().clone(),
            text: s.text_in(phase.word_range),
            translation: phase
                .word_range
                .map_or(true, |r| r.start == 0)
                .then(|| s.translation().map(str::to_string))
                .flatten(),
        })
        .collect();

    let first = positions.iter().copied().min().unwrap_or(0);
    let context: Vec<&CanonicalSegment> =
        segments[first.saturating_sub(context_segments)..first].iter().collect();

    let translation = texts
        .iter()
        .filter_map(|t| t.translation.as_deref())
        .collect::<Vec<_>>()
        .join(" ");

    PhaseInput {
        phase,
        segments: members,
        texts,
        context,
        tokens: tokenize_translation(&translation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet::{SourceRef, WordRange, WorkId};

    fn seg(id: &str, order: u32, text: &str, translation: &str) -> CanonicalSegment {
        CanonicalSegment {
            source_ref: SourceRef {
                provider: "test".into(),
                work_id: WorkId::new("mn10").unwrap(),
                segment_id: SegmentId::new(id).unwrap(),
            },
            order,
            source_text: text.into(),
            reference_translation: Some(translation.into()),
        }
    }

    #[test]
    fn duplicate_segment_ids_keep_the_first_occurrence() {
        let segments = vec![seg("a", 1, "x", "x"), seg("b", 2, "y", "y"), seg("a", 3, "z", "z")];
        let (kept, issues) = dedupe_segments(segments);
        let orders: Vec<u32> = kept.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::DuplicateSegment);
        assert!(issues[0].is_error());
        assert_eq!(issues[0].segment_id.as_ref().map(SegmentId::as_str), Some("a"));
    }

    #[test]
    fn phase_input_carries_context_and_slices() {
        let segments = vec![
            seg("a", 1, "one", "One."),
            seg("b", 2, "two", "Two."),
            seg("c", 3, "three four five", "Three four five."),
        ];
        let index: HashMap<&SegmentId, usize> =
            segments.iter().enumerate().map(|(i, s)| (s.id(), i)).collect();

        let second_slice = SkeletonPhase {
            id: packet::PhaseId::numbered(4),
            title: None,
            segment_ids: vec![segments[2].id().clone()],
            word_range: WordRange::new(2, 3),
        };
        let input = phase_input(&second_slice, &segments, &index, 1);
        assert_eq!(input.texts[0].text, "five");
        assert_eq!(input.texts[0].translation, None);
        assert!(input.tokens.is_empty());
        assert_eq!(input.context.len(), 1);
        assert_eq!(input.context[0].id().as_str(), "b");
        assert!(finishes_segment(&second_slice, &segments[2]));

        let whole = SkeletonPhase {
            id: packet::PhaseId::numbered(1),
            title: None,
            segment_ids: vec![segments[0].id().clone()],
            word_range: None,
        };
        let input = phase_input(&whole, &segments, &index, 2);
        assert!(input.context.is_empty());
        assert!(input.has_translation());
    }
}
