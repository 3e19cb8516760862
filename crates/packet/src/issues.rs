//! Validation findings carried in the packet.
//!
//! Issues are advisory: they are accumulated, never thrown. A caller reading
//! [`crate::Packet::validation_issues`] tells "usable packet with warnings"
//! apart from "packet with integrity errors" by looking at [`Severity::Error`].

use serde::{Deserialize, Serialize};

use crate::{PhaseId, SegmentId};

/// Severity level for a [`ValidationIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Contextual information; nothing to fix.
    Info,
    /// Something was repaired or looks suspicious; the packet is still usable.
    Warning,
    /// Integrity is compromised; the affected phases need re-compilation.
    Error,
}

/// Machine-readable category of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    // Input
    DuplicateSegment,

    // Planning
    PlanFallback,
    PhaseLimit,

    // Stage boundary
    StageFailed,
    PayloadRepair,
    SenseCount,

    // Per-phase repair
    DuplicateWordId,
    EmptyWordSegments,
    DanglingRelation,
    EmptySenses,
    DuplicateTokenId,

    // Per-packet
    SegmentSplit,
    SegmentInMultiplePhases,
    MissingSegment,
    DegradedPhase,
    DuplicateAlignment,
    TextIntegrity,
    ContentCoverage,
}

/// One structured finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: IssueCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<PhaseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<SegmentId>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(severity: Severity, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            phase_id: None,
            segment_id: None,
            message: message.into(),
        }
    }

    pub fn info(code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, code, message)
    }

    pub fn warning(code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn error(code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    #[must_use]
    pub fn in_phase(mut self, phase: &PhaseId) -> Self {
        self.phase_id = Some(phase.clone());
        self
    }

    #[must_use]
    pub fn for_segment(mut self, segment: &SegmentId) -> Self {
        self.segment_id = Some(segment.clone());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {:?}", self.severity, self.code)?;
        if let Some(phase) = &self.phase_id {
            write!(f, " phase={phase}")?;
        }
        if let Some(segment) = &self.segment_id {
            write!(f, " segment={segment}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Counts issues at each severity; handy for logging.
pub fn tally(issues: &[ValidationIssue]) -> (usize, usize, usize) {
    issues.iter().fold((0, 0, 0), |(i, w, e), issue| match issue.severity {
        Severity::Info => (i + 1, w, e),
        Severity::Warning => (i, w + 1, e),
        Severity::Error => (i, w, e + 1),
    })
}
