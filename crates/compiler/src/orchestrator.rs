//! Per-phase stage pipeline.
//!
//! A phase moves through
//! `pending → decomposition → sense-assignment → alignment → layout → assembled`.
//! Every stage is optional and independently degradable: a failure is logged,
//! recorded as a [`IssueCode::StageFailed`] warning and the phase moves on.
//! When neither decomposition nor sense assignment produced anything, a single
//! monolithic call is tried instead; if that fails too the phase is degraded.

use packet::passes::phase_word_count;
use packet::rehydrate::{rehydrate, AssemblyInput};
use packet::validate::{degraded_phase, repair_phase};
use packet::{
    Confidence, DecompositionPass, Handoff, IssueCode, PhaseId, PhaseView, StageError, StageKind,
    ValidationIssue,
};
use tracing::{debug, info, instrument, warn};

use crate::config::CompilerConfig;
use crate::gateway::CallGateway;
use crate::stages::{self, DictionaryHints, DictionaryStep, PhaseInput};

/// Confidence of a phase assembled by the monolithic fallback.
pub const MONOLITHIC_CONFIDENCE: f64 = 0.4;
/// Factor applied for each specialist stage that did not complete.
pub const MISSING_STAGE_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Pending,
    Decomposition,
    SenseAssignment,
    Alignment,
    Layout,
    Assembled,
}

/// How the phase view was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyPath {
    Specialists,
    Monolithic,
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub view: PhaseView,
    pub issues: Vec<ValidationIssue>,
    pub path: AssemblyPath,
}

/// Drives one phase through its stages.
#[derive(Debug)]
pub struct Orchestrator<'a> {
    pub gateway: &'a CallGateway,
    pub config: &'a CompilerConfig,
    pub dictionary: &'a DictionaryStep,
}

/// Accumulates stage results for one phase.
struct Run<'p> {
    phase: &'p PhaseId,
    state: PhaseState,
    issues: Vec<ValidationIssue>,
    completed: Vec<StageKind>,
    failures: Vec<String>,
    notes: Vec<String>,
}

impl Run<'_> {
    fn enter(&mut self, state: PhaseState) {
        debug!(phase = %self.phase, from = ?self.state, to = ?state, "phase transition");
        self.state = state;
    }

    /// Records a stage result; `Ok(None)` means the stage failed and was recorded.
    fn settle<T>(
        &mut self,
        stage: StageKind,
        result: Result<(T, Vec<ValidationIssue>), StageError>,
    ) -> Result<Option<T>, StageError> {
        match result {
            Ok((value, issues)) => {
                self.issues.extend(issues);
                self.completed.push(stage);
                Ok(Some(value))
            }
            Err(StageError::Cancelled) => Err(StageError::Cancelled),
            Err(StageError::Skipped { reason, .. }) => {
                debug!(phase = %self.phase, %stage, %reason, "stage skipped");
                self.notes.push(format!("{stage} skipped: {reason}"));
                Ok(None)
            }
            Err(err) => {
                warn!(phase = %self.phase, %stage, error = %err, "stage failed");
                self.issues.push(
                    ValidationIssue::warning(IssueCode::StageFailed, err.to_string())
                        .in_phase(self.phase),
                );
                self.failures.push(err.to_string());
                Ok(None)
            }
        }
    }

    fn disabled(&mut self, stage: StageKind) {
        self.notes.push(format!("{stage} disabled"));
    }
}

impl Orchestrator<'_> {
    #[instrument(skip_all, fields(phase = %input.phase.id, segments = input.segments.len()))]
    pub async fn run_phase(&self, input: &PhaseInput<'_>) -> Result<PhaseOutcome, StageError> {
        let toggles = self.config.stages;
        let mut run = Run {
            phase: &input.phase.id,
            state: PhaseState::Pending,
            issues: Vec::new(),
            completed: Vec::new(),
            failures: Vec::new(),
            notes: Vec::new(),
        };

        run.enter(PhaseState::Decomposition);
        let decomposition = if toggles.decomposition {
            let result = stages::decompose(self.gateway, self.config, input).await;
            run.settle(StageKind::Decomposition, result)?
        } else {
            run.disabled(StageKind::Decomposition);
            None
        };
        let decomposed = decomposition.is_some();
        let working = decomposition.unwrap_or_else(|| {
            if phase_word_count(&input.texts) > 0 {
                run.notes.push("using whitespace decomposition".into());
            }
            DecompositionPass::from_whitespace(&input.texts)
        });

        run.enter(PhaseState::SenseAssignment);
        let mut hints = DictionaryHints::default();
        let senses = if toggles.sense_assignment {
            hints = self.dictionary.gather(&working, self.gateway.cancel_token()).await?;
            let result =
                stages::assign_senses(self.gateway, self.config, input, &working, &hints).await;
            run.settle(StageKind::SenseAssignment, result)?
        } else {
            run.disabled(StageKind::SenseAssignment);
            None
        };

        if !decomposed && senses.is_none() {
            return self.fall_back(input, run).await;
        }

        run.enter(PhaseState::Alignment);
        let alignment = if toggles.alignment {
            let result =
                stages::align(self.gateway, self.config, input, &working, senses.as_ref()).await;
            run.settle(StageKind::Alignment, result)?
        } else {
            run.disabled(StageKind::Alignment);
            None
        };

        run.enter(PhaseState::Layout);
        let layout = if toggles.layout {
            let result =
                stages::lay_out(self.gateway, self.config, input, &working, alignment.as_ref()).await;
            run.settle(StageKind::Layout, result)?
        } else {
            run.disabled(StageKind::Layout);
            None
        };

        run.enter(PhaseState::Assembled);
        let assembled = rehydrate(AssemblyInput {
            phase: input.phase,
            segments: &input.segments,
            texts: &input.texts,
            decomposition: &working,
            senses: senses.as_ref(),
            alignment: alignment.as_ref(),
            layout: layout.as_ref(),
        });
        run.issues.extend(assembled.issues);

        let coverage = senses.as_ref().and(hints.coverage());
        let missing = StageKind::SPECIALISTS
            .iter()
            .filter(|s| !run.completed.contains(*s))
            .count();
        let confidence = handoff_confidence(coverage, missing);
        let mut view = assembled.view;
        view.handoff = Some(Handoff {
            confidence,
            dictionary_coverage: coverage,
            completed_stages: run.completed.clone(),
            notes: run.notes.clone(),
        });
        run.issues.extend(repair_phase(&mut view));

        info!(
            phase = %view.id,
            words = view.words.len(),
            confidence = confidence.as_f64(),
            completed = run.completed.len(),
            "phase assembled"
        );
        Ok(PhaseOutcome { view, issues: run.issues, path: AssemblyPath::Specialists })
    }

    async fn fall_back(
        &self,
        input: &PhaseInput<'_>,
        mut run: Run<'_>,
    ) -> Result<PhaseOutcome, StageError> {
        let result = if self.config.stages.monolithic_fallback {
            stages::monolithic(self.gateway, self.config, input)
                .await
                .map(|assembled| (assembled, Vec::new()))
        } else {
            Err(StageError::Skipped {
                stage: StageKind::Monolithic,
                reason: "monolithic fallback disabled".into(),
            })
        };

        run.enter(PhaseState::Assembled);
        if let Some(assembled) = run.settle(StageKind::Monolithic, result)? {
            run.issues.extend(assembled.issues);
            let mut view = assembled.view;
            view.handoff = Some(Handoff {
                confidence: Confidence::clamped(MONOLITHIC_CONFIDENCE),
                dictionary_coverage: None,
                completed_stages: run.completed.clone(),
                notes: run.notes.clone(),
            });
            run.issues.extend(repair_phase(&mut view));
            info!(phase = %view.id, words = view.words.len(), "phase assembled by monolithic fallback");
            return Ok(PhaseOutcome { view, issues: run.issues, path: AssemblyPath::Monolithic });
        }

        let reason = if run.failures.is_empty() {
            "no stage produced output".to_string()
        } else {
            run.failures.join("; ")
        };
        warn!(phase = %input.phase.id, %reason, "phase degraded");
        let mut view = degraded_phase(input.phase, &input.segments, &input.texts, reason);
        if let Some(handoff) = view.handoff.as_mut() {
            handoff.notes = run.notes.clone();
        }
        Ok(PhaseOutcome { view, issues: run.issues, path: AssemblyPath::Degraded })
    }
}

/// Phase confidence: dictionary coverage scales the sense stage's share and
/// every specialist stage that did not complete costs a fixed factor.
pub fn handoff_confidence(coverage: Option<f64>, missing_stages: usize) -> Confidence {
    let mut confidence = Confidence::full();
    if let Some(c) = coverage {
        confidence = confidence.scaled(0.55 + 0.45 * c.clamp(0.0, 1.0));
    }
    for _ in 0..missing_stages {
        confidence = confidence.scaled(MISSING_STAGE_FACTOR);
    }
    confidence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_run_with_full_coverage_is_fully_trusted() {
        assert_eq!(handoff_confidence(Some(1.0), 0).as_f64(), 1.0);
        assert_eq!(handoff_confidence(None, 0).as_f64(), 1.0);
    }

    #[test]
    fn missing_dictionary_and_stages_lower_confidence() {
        let c = handoff_confidence(Some(0.0), 0).as_f64();
        assert!((c - 0.55).abs() < 1e-9);
        let c = handoff_confidence(Some(1.0), 2).as_f64();
        assert!((c - 0.64).abs() < 1e-9);
        assert!(handoff_confidence(Some(0.0), 4).as_f64() > 0.0);
    }
}
