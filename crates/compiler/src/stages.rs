//! The specialist stage runners and the dictionary step that feeds sense
//! assignment.
//!
//! Each runner builds its prompt, goes through the [`CallGateway`] and returns
//! a checked pass plus the repairs made at the parse boundary. Runners never
//! decide what happens on failure; that is the orchestrator's job.

use std::collections::BTreeSet;
use std::sync::Arc;

use packet::passes::PhaseText;
use packet::rehydrate::assemble_monolithic;
use packet::text::{surface_key, TokenKind, TranslationToken};
use packet::{
    AlignmentPass, Assembled, CanonicalSegment, CheckContext, DecompositionPass, DictionaryEntry,
    DictionaryLookup, InMemoryStore, KeyValueStore, LayoutPass, MonolithicPass, PayloadError, SenseAssignmentPass,
    SkeletonPhase, StageError, StageKind, StagePass, ValidationIssue,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CompilerConfig;
use crate::gateway::{CallGateway, CallSpec};
use crate::prompts;

/// Everything about one phase the stages read.
#[derive(Debug, Clone)]
pub struct PhaseInput<'a> {
    pub phase: &'a SkeletonPhase,
    pub segments: Vec<&'a CanonicalSegment>,
    pub texts: Vec<PhaseText>,
    /// Canonical segments preceding the phase, oldest first.
    pub context: Vec<&'a CanonicalSegment>,
    /// Tokenised reference translation of the whole phase.
    pub tokens: Vec<TranslationToken>,
}

impl PhaseInput<'_> {
    pub fn has_translation(&self) -> bool {
        self.tokens.iter().any(|t| t.kind != TokenKind::Whitespace)
    }
}

pub type Checked<P> = (P, Vec<ValidationIssue>);

fn spec(config: &CompilerConfig, stage: StageKind, user: String) -> CallSpec {
    CallSpec {
        stage,
        system: prompts::system_prompt(stage),
        user,
        schema: prompts::schema(stage),
        max_tokens: config.max_tokens.for_stage(stage),
    }
}

async fn run_pass<P: StagePass>(
    gateway: &CallGateway,
    config: &CompilerConfig,
    input: &PhaseInput<'_>,
    decomposition: Option<&DecompositionPass>,
    user: String,
) -> Result<Checked<P>, StageError> {
    let ctx = CheckContext {
        texts: &input.texts,
        decomposition,
        tokens: &input.tokens,
    };
    let phase = &input.phase.id;
    gateway
        .call(&spec(config, P::KIND, user), |value| P::from_value(value, phase, &ctx))
        .await
}

pub async fn decompose(
    gateway: &CallGateway,
    config: &CompilerConfig,
    input: &PhaseInput<'_>,
) -> Result<Checked<DecompositionPass>, StageError> {
    let user = prompts::decomposition_user(&input.texts, &input.context);
    run_pass(gateway, config, input, None, user).await
}

pub async fn assign_senses(
    gateway: &CallGateway,
    config: &CompilerConfig,
    input: &PhaseInput<'_>,
    decomposition: &DecompositionPass,
    hints: &DictionaryHints,
) -> Result<Checked<SenseAssignmentPass>, StageError> {
    let user = prompts::sense_user(&input.texts, decomposition, &hints.entries, &input.context);
    run_pass(gateway, config, input, Some(decomposition), user).await
}

pub async fn align(
    gateway: &CallGateway,
    config: &CompilerConfig,
    input: &PhaseInput<'_>,
    decomposition: &DecompositionPass,
    senses: Option<&SenseAssignmentPass>,
) -> Result<Checked<AlignmentPass>, StageError> {
    if !input.has_translation() {
        return Err(StageError::Skipped {
            stage: StageKind::Alignment,
            reason: "phase has no reference translation".into(),
        });
    }
    let user = prompts::alignment_user(&input.tokens, decomposition, senses);
    run_pass(gateway, config, input, Some(decomposition), user).await
}

pub async fn lay_out(
    gateway: &CallGateway,
    config: &CompilerConfig,
    input: &PhaseInput<'_>,
    decomposition: &DecompositionPass,
    alignment: Option<&AlignmentPass>,
) -> Result<Checked<LayoutPass>, StageError> {
    let user = prompts::layout_user(&input.texts, decomposition, alignment);
    run_pass(gateway, config, input, Some(decomposition), user).await
}

/// Single-call fallback used when decomposition and sense assignment both failed.
pub async fn monolithic(
    gateway: &CallGateway,
    config: &CompilerConfig,
    input: &PhaseInput<'_>,
) -> Result<Assembled, StageError> {
    let user = prompts::monolithic_user(&input.texts, &input.context);
    let parse = |value| {
        let pass: MonolithicPass =
            serde_json::from_value(value).map_err(|e| PayloadError::Shape(e.to_string()))?;
        assemble_monolithic(pass, input.phase, &input.segments, &input.texts)
            .ok_or_else(|| PayloadError::Rejected("monolithic reply has no words".into()))
    };
    gateway.call(&spec(config, StageKind::Monolithic, user), parse).await
}

// ---------------------------------------------------------------------------
// Dictionary step
// ---------------------------------------------------------------------------

/// Dictionary entries found for a phase's surface forms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DictionaryHints {
    pub entries: Vec<(String, DictionaryEntry)>,
    pub looked_up: usize,
}

impl DictionaryHints {
    /// Share of distinct surface forms with an entry; `None` when nothing was looked up.
    pub fn coverage(&self) -> Option<f64> {
        (self.looked_up > 0).then(|| self.entries.len() as f64 / self.looked_up as f64)
    }
}

/// Dictionary lookups behind a process-scoped cache.
///
/// Without a lookup the step yields empty hints with no coverage. Cache hits
/// resolve synchronously. Misses are fetched concurrently and
/// written back in one batch. A failed lookup counts as "no entry" for this
/// phase and is not cached.
#[derive(Clone)]
pub struct DictionaryStep {
    lookup: Option<Arc<dyn DictionaryLookup>>,
    cache: Arc<dyn KeyValueStore<Option<DictionaryEntry>>>,
}

impl DictionaryStep {
    pub fn new(
        lookup: Arc<dyn DictionaryLookup>,
        cache: Arc<dyn KeyValueStore<Option<DictionaryEntry>>>,
    ) -> Self {
        Self { lookup: Some(lookup), cache }
    }

    /// A step that never looks anything up.
    pub fn disabled() -> Self {
        let cache: Arc<InMemoryStore<Option<DictionaryEntry>>> = Arc::new(InMemoryStore::new());
        Self { lookup: None, cache }
    }

    pub async fn gather(
        &self,
        decomposition: &DecompositionPass,
        cancel: &CancellationToken,
    ) -> Result<DictionaryHints, StageError> {
        let Some(lookup) = &self.lookup else {
            return Ok(DictionaryHints::default());
        };
        let keys: BTreeSet<String> = decomposition
            .words
            .iter()
            .map(|w| surface_key(&w.surface))
            .filter(|k| !k.is_empty())
            .collect();

        let mut hints = DictionaryHints { entries: Vec::new(), looked_up: keys.len() };
        let mut pending = JoinSet::new();
        for key in keys {
            match self.cache.get(&key) {
                Some(Some(entry)) => hints.entries.push((key, entry)),
                Some(None) => {}
                None => {
                    let lookup = Arc::clone(lookup);
                    pending.spawn(async move {
                        let result = lookup.lookup(&key).await;
                        (key, result)
                    });
                }
            }
        }

        let mut fresh = Vec::new();
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pending.abort_all();
                    return Err(StageError::Cancelled);
                }
                joined = pending.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok((key, Ok(entry))) => {
                    if let Some(found) = &entry {
                        hints.entries.push((key.clone(), found.clone()));
                    }
                    fresh.push((key, entry));
                }
                Ok((key, Err(err))) => {
                    debug!(surface = %key, error = %err, "dictionary lookup failed");
                }
                Err(err) => warn!(error = %err, "dictionary lookup task failed"),
            }
        }
        if !fresh.is_empty() {
            self.cache.set_many(fresh);
        }
        hints.entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hints)
    }
}

impl std::fmt::Debug for DictionaryStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionaryStep")
            .field("enabled", &self.lookup.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use packet::{LookupError, SegmentId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDictionary {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DictionaryLookup for CountingDictionary {
        async fn lookup(&self, surface: &str) -> Result<Option<DictionaryEntry>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match surface {
                "evaṁ" => Ok(Some(DictionaryEntry {
                    headword: "evaṁ".into(),
                    definitions: vec!["thus".into()],
                    grammar: Some("ind".into()),
                })),
                "sutaṁ" => Err(LookupError::Unavailable("timeout".into())),
                _ => Ok(None),
            }
        }
    }

    fn decomposition() -> DecompositionPass {
        DecompositionPass::from_whitespace(&[PhaseText {
            segment_id: SegmentId::new("mn10:1.1").unwrap(),
            text: "Evaṁ me sutaṁ— evaṁ".into(),
            translation: None,
        }])
    }

    #[tokio::test]
    async fn lookups_are_cached_and_failures_count_as_misses() {
        let dict = Arc::new(CountingDictionary { calls: AtomicUsize::new(0) });
        let cache: Arc<InMemoryStore<Option<DictionaryEntry>>> = Arc::new(InMemoryStore::new());
        let step = DictionaryStep::new(dict.clone(), cache.clone());
        let cancel = CancellationToken::new();

        let hints = step.gather(&decomposition(), &cancel).await.unwrap();
        assert_eq!(hints.looked_up, 3);
        assert_eq!(hints.entries.len(), 1);
        assert!((hints.coverage().unwrap() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(dict.calls.load(Ordering::SeqCst), 3);
        // The failed lookup is not cached.
        assert_eq!(cache.len(), 2);

        let again = step.gather(&decomposition(), &cancel).await.unwrap();
        assert_eq!(again.entries, hints.entries);
        assert_eq!(dict.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_gather_returns_cancelled() {
        let dict = Arc::new(CountingDictionary { calls: AtomicUsize::new(0) });
        let cache: Arc<InMemoryStore<Option<DictionaryEntry>>> = Arc::new(InMemoryStore::new());
        let step = DictionaryStep::new(dict, cache);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = step.gather(&decomposition(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn disabled_step_has_no_coverage() {
        let hints = DictionaryStep::disabled()
            .gather(&decomposition(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(hints.entries.is_empty());
        assert_eq!(hints.coverage(), None);
    }
}
