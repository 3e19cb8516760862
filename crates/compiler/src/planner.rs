//! Skeleton planner: partitions the ordered segment list into study phases.
//!
//! Each window of segments gets one model proposal. A proposal that fails the
//! coverage check (or a call that fails outright) is discarded wholesale and
//! replaced by deterministic chunking, so planning always yields full coverage.
//! Cancellation is the only error it returns.

use packet::planning::{
    boundary_starts, check_proposal, fallback_phases, renumber, split_long_segments, windows,
    PlanDefect, PlanProposal,
};
use packet::{
    BoundaryNote, CanonicalSegment, IssueCode, PayloadError, SegmentId, SkeletonPhase,
    StageError, StageKind, ValidationIssue,
};
use tracing::{info, instrument, warn};

use crate::config::CompilerConfig;
use crate::gateway::{CallGateway, CallSpec};
use crate::prompts;

/// Planned phases plus what it took to get them.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub phases: Vec<SkeletonPhase>,
    pub issues: Vec<ValidationIssue>,
    pub windows: usize,
    pub fallback_windows: usize,
}

#[instrument(skip_all, fields(segments = segments.len()))]
pub async fn plan(
    gateway: &CallGateway,
    config: &CompilerConfig,
    segments: &[CanonicalSegment],
    boundaries: &[BoundaryNote],
) -> Result<Plan, StageError> {
    let starts = boundary_starts(boundaries);
    let windows = windows(segments, config.window_size);
    let mut phases = Vec::new();
    let mut issues = Vec::new();
    let mut fallback_windows = 0;

    for (index, window) in windows.iter().enumerate() {
        let proposed = if config.use_llm_planner {
            propose(gateway, config, window, &starts).await
        } else {
            Err(WindowFailure::Disabled)
        };

        match proposed {
            Ok(window_phases) => phases.extend(window_phases),
            Err(WindowFailure::Cancelled) => return Err(StageError::Cancelled),
            Err(failure) => {
                fallback_windows += 1;
                if let WindowFailure::Defect(reason) = &failure {
                    warn!(window = index, %reason, "planner proposal discarded");
                    issues.push(ValidationIssue::info(
                        IssueCode::PlanFallback,
                        format!("planning window {} used fallback chunking: {reason}", index + 1),
                    ));
                }
                phases.extend(fallback_phases(
                    window,
                    config.fallback_phase_size,
                    &starts,
                    config.allow_cross_boundary,
                ));
            }
        }
    }

    if let Some(max_words) = config.split_segments_over_words {
        phases = split_long_segments(phases, segments, max_words);
    }
    renumber(&mut phases);

    info!(
        phases = phases.len(),
        windows = windows.len(),
        fallback_windows,
        "plan ready"
    );
    Ok(Plan { phases, issues, windows: windows.len(), fallback_windows })
}

enum WindowFailure {
    Disabled,
    Cancelled,
    Defect(String),
}

async fn propose(
    gateway: &CallGateway,
    config: &CompilerConfig,
    window: &[CanonicalSegment],
    starts: &std::collections::HashSet<&SegmentId>,
) -> Result<Vec<SkeletonPhase>, WindowFailure> {
    let in_window: Vec<&SegmentId> =
        window.iter().map(CanonicalSegment::id).filter(|id| starts.contains(id)).collect();
    let spec = CallSpec {
        stage: StageKind::Planning,
        system: prompts::system_prompt(StageKind::Planning),
        user: prompts::planning_user(window, &in_window),
        schema: prompts::schema(StageKind::Planning),
        max_tokens: config.max_tokens.for_stage(StageKind::Planning),
    };
    let parse = |value| {
        serde_json::from_value::<PlanProposal>(value)
            .map_err(|e| PayloadError::Shape(PlanDefect::Malformed(e.to_string()).to_string()))
    };
    // Coverage defects are not retried; the window goes straight to fallback.
    match gateway.call(&spec, parse).await {
        Ok(proposal) => check_proposal(window, &proposal, starts, config.allow_cross_boundary)
            .map_err(|defect| WindowFailure::Defect(defect.to_string())),
        Err(StageError::Cancelled) => Err(WindowFailure::Cancelled),
        Err(err) => Err(WindowFailure::Defect(err.to_string())),
    }
}
