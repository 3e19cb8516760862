//! End-to-end compilation against a fake model that answers from the JSON
//! prompts it receives.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use compiler::planner::plan;
use compiler::{CallGateway, CompileRequest, CompilerConfig, NoProgress, PacketCompiler, Throttle};
use packet::{
    BoundaryNote, CanonicalSegment, ChatRequest, ChatResponse, CompileError, DictionaryEntry, DictionaryLookup,
    GatewayError, InMemoryStore, IssueCode, LlmGateway, LookupError, PacketSource, PacketState,
    PhaseView, Progress, SegmentId, SegmentSource, Severity, SourceError, SourceRef, WorkId,
    WorkRequest,
};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fake model
// ---------------------------------------------------------------------------

/// Answers every stage deterministically from the prompt payload.
#[derive(Default)]
struct FakeModel {
    /// Stages answering with a transport error.
    failing: HashSet<&'static str>,
    /// Number of segment ids the planner leaves out of its proposal.
    planner_drops: usize,
    /// Planning reply used instead of the one-phase-per-segment proposal.
    planner_reply: Option<Value>,
    /// Cancelled when the first call for the named stage arrives.
    cancel_on: Option<(&'static str, CancellationToken)>,
    calls: Mutex<Vec<(String, Instant)>>,
    prompts: Mutex<Vec<(String, Value)>>,
}

impl FakeModel {
    fn failing(stages: &[&'static str]) -> Self {
        Self { failing: stages.iter().copied().collect(), ..Self::default() }
    }

    fn stages_called(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    /// User payloads received for `stage`, in call order.
    fn prompts_for(&self, stage: &str) -> Vec<Value> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == stage)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn answer(&self, stage: &str, prompt: &Value) -> Value {
        match stage {
            "planning" => self.plan(prompt),
            "decomposition" => decompose(prompt),
            "sense_assignment" => senses(prompt),
            "alignment" => align(prompt),
            "layout" => layout(prompt),
            "monolithic" => monolithic(prompt),
            other => panic!("unexpected stage {other}"),
        }
    }

    /// One phase per segment, minus the dropped ids.
    fn plan(&self, prompt: &Value) -> Value {
        if let Some(reply) = &self.planner_reply {
            return reply.clone();
        }
        let ids: Vec<&str> = prompt["segments"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap())
            .collect();
        let kept: Vec<&str> = ids
            .iter()
            .enumerate()
            .filter(|(i, _)| *i == 0 || *i % 10 != 0 || *i / 10 > self.planner_drops)
            .map(|(_, id)| *id)
            .collect();
        let phases: Vec<Value> = kept.iter().map(|id| json!({"segmentIds": [id]})).collect();
        json!({ "phases": phases })
    }
}

#[async_trait]
impl LlmGateway for FakeModel {
    async fn chat_json(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        let system = &request.messages[0].content;
        let stage = system
            .strip_prefix("[stage:")
            .and_then(|rest| rest.split(']').next())
            .unwrap()
            .to_string();
        self.calls.lock().unwrap().push((stage.clone(), Instant::now()));

        if let Some((target, token)) = &self.cancel_on {
            if *target == stage {
                token.cancel();
            }
        }
        if self.failing.contains(stage.as_str()) {
            return Err(GatewayError::Transport("connection reset".into()));
        }
        let prompt: Value = serde_json::from_str(&request.messages[1].content).unwrap();
        self.prompts.lock().unwrap().push((stage.clone(), prompt.clone()));
        Ok(ChatResponse { text: self.answer(&stage, &prompt).to_string(), raw: None })
    }

    fn provider_name(&self) -> &str {
        "fake"
    }

    fn model_name(&self) -> &str {
        "fake-1"
    }
}

fn gloss(surface: &str) -> String {
    let key: String = surface.to_lowercase().chars().filter(|c| c.is_alphabetic()).collect();
    match key.as_str() {
        "evaṁ" => "thus",
        "me" => "i",
        "sutaṁ" => "heard",
        "ekaṁ" => "one",
        "samayaṁ" => "time",
        "bhagavā" => "blessed",
        _ => return key,
    }
    .to_string()
}

fn source_words(prompt: &Value) -> Vec<(String, String)> {
    prompt["segments"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|s| {
            let segment = s["segmentId"].as_str().unwrap().to_string();
            s["text"]
                .as_str()
                .unwrap()
                .split_whitespace()
                .map(move |w| (segment.clone(), w.to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Words longer than four characters get a root and a suffix segment. The
/// first word's last segment carries a relation to the second word.
fn decompose(prompt: &Value) -> Value {
    let mut words = Vec::new();
    let mut segments = Vec::new();
    for (n, (segment, surface)) in source_words(prompt).into_iter().enumerate() {
        let id = format!("w{}", n + 1);
        let chars: Vec<char> = surface.chars().collect();
        let parts: Vec<(String, &str)> = if chars.len() > 4 {
            vec![
                (chars[..3].iter().collect(), "root"),
                (chars[3..].iter().collect(), "suffix"),
            ]
        } else {
            vec![(surface.clone(), "stem")]
        };
        let ids: Vec<String> = (1..=parts.len()).map(|k| format!("{id}s{k}")).collect();
        for ((text, kind), seg_id) in parts.into_iter().zip(&ids) {
            segments.push(json!({"id": seg_id, "wordId": id, "text": text, "type": kind, "tooltips": []}));
        }
        words.push(json!({
            "id": id,
            "surface": surface,
            "class": "content",
            "segmentIds": ids,
            "sourceSegmentId": segment,
        }));
    }
    let relations: Vec<Value> = match (words.first(), words.get(1)) {
        (Some(first), Some(second)) => {
            let marker = first["segmentIds"].as_array().unwrap().last().unwrap().clone();
            vec![json!({
                "id": "r1",
                "fromSegmentId": marker,
                "targetWordId": second["id"],
                "type": "agreement",
                "label": "agrees with",
                "status": "confirmed",
            })]
        }
        _ => Vec::new(),
    };
    json!({ "words": words, "segments": segments, "relations": relations })
}

fn three_senses(surface: &str) -> Value {
    let g = gloss(surface);
    json!([
        {"english": g, "nuance": "literal"},
        {"english": format!("{g} (idiomatic)"), "nuance": "idiomatic"},
        {"english": format!("{g} (contextual)"), "nuance": "contextual"},
    ])
}

fn senses(prompt: &Value) -> Value {
    let senses: Vec<Value> = prompt["words"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| {
            json!({
                "wordId": w["id"],
                "class": "content",
                "senses": three_senses(w["surface"].as_str().unwrap()),
            })
        })
        .collect();
    json!({ "senses": senses })
}

/// Links each English token to the first unused word glossed by it; multi
/// segment words link through their root.
fn align(prompt: &Value) -> Value {
    let words = prompt["words"].as_array().unwrap();
    let mut used = HashSet::new();
    let tokens: Vec<Value> = prompt["englishTokens"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| {
            let text = t["text"].as_str().unwrap();
            let hit = words.iter().find(|w| {
                let id = w["id"].as_str().unwrap();
                !used.contains(id) && gloss(w["surface"].as_str().unwrap()) == text.to_lowercase()
            });
            match hit {
                Some(w) => {
                    let id = w["id"].as_str().unwrap().to_string();
                    used.insert(id.clone());
                    let segments = w["segments"].as_array().unwrap();
                    if segments.len() > 1 {
                        json!({"tokenIndex": t["tokenIndex"], "text": text, "linkedSegmentId": segments[0]["id"], "isGhost": false})
                    } else {
                        json!({"tokenIndex": t["tokenIndex"], "text": text, "linkedWordId": id, "isGhost": false})
                    }
                }
                None => json!({"tokenIndex": t["tokenIndex"], "text": text, "isGhost": true, "ghostKind": "required"}),
            }
        })
        .collect();
    json!({ "tokens": tokens })
}

fn layout(prompt: &Value) -> Value {
    let ids: Vec<Value> = prompt["words"].as_array().unwrap().iter().map(|w| w["id"].clone()).collect();
    json!({ "layoutBlocks": [ids] })
}

fn monolithic(prompt: &Value) -> Value {
    let words: Vec<Value> = source_words(prompt)
        .into_iter()
        .map(|(segment, surface)| {
            json!({
                "surface": surface,
                "class": "content",
                "sourceSegmentId": segment,
                "segments": [{"text": surface, "type": "stem"}],
                "senses": three_senses(&surface),
            })
        })
        .collect();
    json!({ "words": words, "englishStructure": [] })
}

struct UnavailableDictionary;

#[async_trait]
impl DictionaryLookup for UnavailableDictionary {
    async fn lookup(&self, _surface: &str) -> Result<Option<DictionaryEntry>, LookupError> {
        Err(LookupError::Unavailable("dictionary offline".into()))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn segment(id: &str, order: u32, text: &str, translation: Option<&str>) -> CanonicalSegment {
    CanonicalSegment {
        source_ref: SourceRef {
            provider: "test".into(),
            work_id: WorkId::new("mn10").unwrap(),
            segment_id: SegmentId::new(id).unwrap(),
        },
        order,
        source_text: text.into(),
        reference_translation: translation.map(str::to_string),
    }
}

fn opening() -> Vec<CanonicalSegment> {
    vec![
        segment("mn10:1.1", 1, "Evaṁ me sutaṁ—", Some("Thus I have heard.")),
        segment("mn10:1.2", 2, "ekaṁ samayaṁ bhagavā", Some("At one time the Blessed One")),
    ]
}

fn request(segments: Vec<CanonicalSegment>) -> CompileRequest {
    CompileRequest {
        source: PacketSource {
            provider: "test".into(),
            work_id: WorkId::new("mn10").unwrap(),
            edition: None,
            title: Some("Satipaṭṭhāna Sutta".into()),
        },
        segments,
        boundaries: Vec::new(),
    }
}

fn numbered(n: u32) -> Vec<CanonicalSegment> {
    (1..=n).map(|i| segment(&format!("mn10:{i}"), i, &format!("pada{i}"), None)).collect()
}

fn gateway_for(model: Arc<FakeModel>) -> CallGateway {
    CallGateway::new(model, Arc::new(Throttle::new(Duration::ZERO)), false, CancellationToken::new())
}

fn groups(phases: &[packet::SkeletonPhase]) -> Vec<Vec<&str>> {
    phases
        .iter()
        .map(|p| p.segment_ids.iter().map(SegmentId::as_str).collect())
        .collect()
}

fn fast_config() -> CompilerConfig {
    CompilerConfig { min_call_gap_ms: 0, max_retries: 0, ..CompilerConfig::default() }
}

fn errors(packet: &packet::Packet) -> Vec<&packet::ValidationIssue> {
    packet.validation_issues.iter().filter(|i| i.severity == Severity::Error).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn opening_lines_compile_through_every_stage() {
    let model = Arc::new(FakeModel::default());
    let compiler = PacketCompiler::new(model.clone(), fast_config()).unwrap();

    let packet = compiler
        .compile(request(opening()), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(packet.progress.state, PacketState::Complete);
    assert_eq!(packet.phases.len(), 2);
    assert!(errors(&packet).is_empty(), "{:?}", packet.validation_issues);

    let first = &packet.phases[0];
    assert!(!first.degraded);
    let spelled: Vec<String> = first.words.iter().map(|w| w.spelled()).collect();
    assert_eq!(spelled, vec!["Evaṁ", "me", "sutaṁ—"]);
    assert_eq!(first.words[2].segments.len(), 2);
    assert!(first.words.iter().all(|w| w.senses.len() == 3));

    let by_text = |text: &str| first.english_structure.iter().find(|t| t.text == text).unwrap();
    assert_eq!(by_text("Thus").linked_word_id.as_ref().unwrap().as_str(), "w1");
    assert_eq!(by_text("I").linked_word_id.as_ref().unwrap().as_str(), "w2");
    assert_eq!(by_text("heard").linked_segment_id.as_ref().unwrap().as_str(), "w3s1");
    assert!(by_text("have").is_ghost);

    let handoff = first.handoff.as_ref().unwrap();
    assert_eq!(handoff.confidence.as_f64(), 1.0);
    assert_eq!(handoff.completed_stages.len(), 4);
    assert_eq!(
        first.layout_blocks.as_ref().unwrap().iter().flatten().count(),
        first.words.len()
    );

    assert_eq!(packet.compiler_meta.provider, "fake");
    assert_eq!(packet.compiler_meta.planner_fallback_windows, 0);
    assert!(packet.compiler_meta.finished_at.is_some());
    assert_eq!(model.stages_called()[0], "planning");
}

#[tokio::test]
async fn failed_dictionary_lowers_confidence_without_degrading() {
    let model = Arc::new(FakeModel::default());
    let cache: Arc<InMemoryStore<Option<DictionaryEntry>>> = Arc::new(InMemoryStore::new());
    let compiler = PacketCompiler::new(model, fast_config())
        .unwrap()
        .with_dictionary(Arc::new(UnavailableDictionary), cache.clone());

    let packet = compiler
        .compile(request(opening()), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    for phase in &packet.phases {
        assert!(!phase.degraded);
        assert!(phase.words.iter().all(|w| w.senses.len() == 3));
        let handoff = phase.handoff.as_ref().unwrap();
        assert_eq!(handoff.dictionary_coverage, Some(0.0));
        assert!(handoff.confidence.as_f64() < 1.0);
        assert!(handoff.confidence.as_f64() > 0.0);
    }
    // Failed lookups are not cached.
    assert!(cache.is_empty());
}

#[tokio::test]
async fn planner_discards_incomplete_window_proposal() {
    let segments = numbered(50);
    let config = CompilerConfig {
        window_size: 50,
        fallback_phase_size: 8,
        ..fast_config()
    };

    let model = Arc::new(FakeModel { planner_drops: 3, ..FakeModel::default() });
    let planned = plan(&gateway_for(model), &config, &segments, &[]).await.unwrap();

    assert_eq!(planned.fallback_windows, 1);
    assert!(planned.issues.iter().any(|i| i.code == IssueCode::PlanFallback));
    assert_eq!(planned.phases.len(), 7);
    assert!(planned.phases.iter().all(|p| p.segment_ids.len() <= 8));
    let covered: Vec<&SegmentId> = planned.phases.iter().flat_map(|p| &p.segment_ids).collect();
    let expected: Vec<&SegmentId> = segments.iter().map(CanonicalSegment::id).collect();
    assert_eq!(covered, expected);

    let model = Arc::new(FakeModel::default());
    let planned = plan(&gateway_for(model), &config, &segments, &[]).await.unwrap();
    assert_eq!(planned.fallback_windows, 0);
    assert_eq!(planned.phases.len(), 50);
}

#[tokio::test]
async fn planner_returns_shuffled_phases_in_source_order() {
    let model = Arc::new(FakeModel {
        planner_reply: Some(json!({"phases": [
            {"segmentIds": ["mn10:4"]},
            {"segmentIds": ["mn10:3", "mn10:2"]},
            {"segmentIds": ["mn10:1"]}
        ]})),
        ..FakeModel::default()
    });

    let planned = plan(&gateway_for(model), &fast_config(), &numbered(4), &[]).await.unwrap();

    assert_eq!(planned.fallback_windows, 0);
    assert_eq!(groups(&planned.phases), vec![vec!["mn10:1"], vec!["mn10:2", "mn10:3"], vec!["mn10:4"]]);
    let ids: Vec<&str> = planned.phases.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);
}

#[tokio::test]
async fn planner_falls_back_on_interleaved_phases() {
    let model = Arc::new(FakeModel {
        planner_reply: Some(json!({"phases": [
            {"segmentIds": ["mn10:4"]},
            {"segmentIds": ["mn10:1", "mn10:3"]},
            {"segmentIds": ["mn10:2"]}
        ]})),
        ..FakeModel::default()
    });

    let planned = plan(&gateway_for(model), &fast_config(), &numbered(4), &[]).await.unwrap();

    assert_eq!(planned.fallback_windows, 1);
    assert!(planned.issues.iter().any(|i| i.code == IssueCode::PlanFallback));
    assert_eq!(groups(&planned.phases), vec![vec!["mn10:1", "mn10:2", "mn10:3", "mn10:4"]]);
}

#[tokio::test]
async fn planner_proposal_crossing_a_boundary_falls_back() {
    let model = Arc::new(FakeModel {
        planner_reply: Some(json!({"phases": [
            {"segmentIds": ["mn10:1", "mn10:2", "mn10:3"]},
            {"segmentIds": ["mn10:4"]}
        ]})),
        ..FakeModel::default()
    });
    let boundaries = vec![BoundaryNote { starts_at: SegmentId::new("mn10:3").unwrap(), label: None }];

    let planned = plan(&gateway_for(model.clone()), &fast_config(), &numbered(4), &boundaries)
        .await
        .unwrap();

    assert_eq!(planned.fallback_windows, 1);
    assert!(planned.issues.iter().any(|i| i.code == IssueCode::PlanFallback));
    assert_eq!(groups(&planned.phases), vec![vec!["mn10:1", "mn10:2"], vec!["mn10:3", "mn10:4"]]);

    let sent = &model.prompts_for("planning")[0];
    let starts: Vec<bool> = sent["segments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["startsWork"].as_bool().unwrap())
        .collect();
    assert_eq!(starts, vec![false, false, true, false]);
}

#[tokio::test]
async fn layout_request_carries_reading_order_and_relations() {
    let model = Arc::new(FakeModel::default());
    let compiler = PacketCompiler::new(model.clone(), fast_config()).unwrap();

    compiler
        .compile(request(opening()), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    let layouts = model.prompts_for("layout");
    assert_eq!(layouts.len(), 2);
    let first = &layouts[0];
    // "Thus I have heard.": "have" is a ghost and "heard" links through w3's root.
    assert_eq!(first["readingOrder"], json!(["w1", "w2", "w3"]));
    let owners: Vec<&str> = first["words"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["sourceSegmentId"].as_str().unwrap())
        .collect();
    assert_eq!(owners, vec!["mn10:1.1"; 3]);
    assert_eq!(first["words"][2]["segmentIds"], json!(["w3s1", "w3s2"]));
    let relations = first["relations"].as_array().unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0]["fromWordId"], "w1");
    assert_eq!(relations[0]["toWordId"], "w2");
}

#[tokio::test]
async fn layout_request_without_alignment_has_no_reading_order() {
    let model = Arc::new(FakeModel::failing(&["alignment"]));
    let compiler = PacketCompiler::new(model.clone(), fast_config()).unwrap();

    compiler
        .compile(request(opening()), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    let layouts = model.prompts_for("layout");
    assert!(!layouts.is_empty());
    assert!(layouts.iter().all(|p| p["readingOrder"].is_null()));
}

#[tokio::test]
async fn monolithic_fallback_covers_failed_specialists() {
    let model = Arc::new(FakeModel::failing(&["decomposition", "sense_assignment"]));
    let compiler = PacketCompiler::new(model.clone(), fast_config()).unwrap();

    let packet = compiler
        .compile(request(opening()), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(packet.progress.state, PacketState::Complete);
    for phase in &packet.phases {
        assert!(!phase.degraded);
        assert!(!phase.english_structure.is_empty());
        assert_eq!(phase.handoff.as_ref().unwrap().confidence.as_f64(), 0.4);
    }
    assert!(errors(&packet).is_empty(), "{:?}", packet.validation_issues);
    let stages = model.stages_called();
    assert!(stages.iter().any(|s| s == "monolithic"));
    assert!(!stages.iter().any(|s| s == "alignment"));
}

#[tokio::test]
async fn every_segment_survives_total_model_failure() {
    let model = Arc::new(FakeModel::failing(&[
        "planning",
        "decomposition",
        "sense_assignment",
        "alignment",
        "layout",
        "monolithic",
    ]));
    let compiler = PacketCompiler::new(model, fast_config()).unwrap();
    let segments = opening();

    let packet = compiler
        .compile(request(segments.clone()), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(packet.progress.state, PacketState::Error);
    assert!(!packet.phases.is_empty());
    assert!(packet.phases.iter().all(|p| p.degraded && p.degraded_reason.is_some()));
    let covered: Vec<&SegmentId> = packet
        .phases
        .iter()
        .flat_map(|p| p.source_span.iter().map(|r| &r.segment_id))
        .collect();
    assert_eq!(covered, segments.iter().map(CanonicalSegment::id).collect::<Vec<_>>());
    assert!(packet
        .validation_issues
        .iter()
        .any(|i| i.code == IssueCode::DegradedPhase && i.severity == Severity::Error));
    assert!(!packet.validation_issues.iter().any(|i| i.code == IssueCode::MissingSegment));
}

#[tokio::test(start_paused = true)]
async fn call_starts_respect_the_minimum_gap() {
    let model = Arc::new(FakeModel::default());
    let config = CompilerConfig { min_call_gap_ms: 1000, ..CompilerConfig::default() };
    let compiler = PacketCompiler::new(model.clone(), config).unwrap();

    compiler
        .compile(request(opening()), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    let times = model.call_times();
    assert!(times.len() > 2);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
    }
}

#[tokio::test]
async fn cancellation_stops_between_phases() {
    let cancel = CancellationToken::new();
    let model = Arc::new(FakeModel {
        cancel_on: Some(("layout", cancel.clone())),
        ..FakeModel::default()
    });
    let compiler = PacketCompiler::new(model.clone(), fast_config()).unwrap();

    let result = compiler.compile(request(opening()), &NoProgress, cancel).await;

    assert!(matches!(result, Err(CompileError::Cancelled)));
    assert_eq!(model.stages_called().iter().filter(|s| *s == "decomposition").count(), 1);
}

#[tokio::test]
async fn cancelled_before_start_makes_no_calls() {
    let model = Arc::new(FakeModel::default());
    let compiler = PacketCompiler::new(model.clone(), fast_config()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = compiler.compile(request(opening()), &NoProgress, cancel).await;

    assert!(matches!(result, Err(CompileError::Cancelled)));
    assert!(model.stages_called().is_empty());
}

#[tokio::test]
async fn progress_reports_each_phase() {
    let model = Arc::new(FakeModel::default());
    let compiler = PacketCompiler::new(model, fast_config()).unwrap();
    let seen: Mutex<Vec<(Progress, bool)>> = Mutex::new(Vec::new());
    let sink = |progress: &Progress, phase: Option<&PhaseView>| {
        seen.lock().unwrap().push((progress.clone(), phase.is_some()));
    };

    let packet = compiler
        .compile(request(opening()), &sink, CancellationToken::new())
        .await
        .unwrap();

    let seen = seen.into_inner().unwrap();
    let with_phase: Vec<&Progress> = seen.iter().filter(|(_, p)| *p).map(|(p, _)| p).collect();
    assert_eq!(with_phase.len(), 2);
    assert_eq!(with_phase[0].ready_phases, 1);
    assert_eq!(with_phase[0].ready_segments, 1);
    assert!(with_phase[0].eta_ms.is_some());

    let (last, _) = seen.last().unwrap();
    assert_eq!(last.state, PacketState::Complete);
    assert_eq!(last.ready_phases, last.total_phases);
    assert_eq!(last.ready_segments, 2);
    assert_eq!(last.eta_ms, Some(0));
    assert_eq!(&packet.progress, last);
}

#[tokio::test]
async fn phase_limit_marks_packet_incomplete() {
    let model = Arc::new(FakeModel::default());
    let config = CompilerConfig { max_phases: Some(1), ..fast_config() };
    let compiler = PacketCompiler::new(model, config).unwrap();

    let packet = compiler
        .compile(request(opening()), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(packet.progress.state, PacketState::Incomplete);
    assert_eq!(packet.phases.len(), 1);
    assert!(packet.validation_issues.iter().any(|i| i.code == IssueCode::PhaseLimit));
    assert!(packet.validation_issues.iter().any(|i| i.code == IssueCode::MissingSegment));
}

#[tokio::test]
async fn duplicate_segment_ids_are_recorded_and_dropped() {
    let compiler = PacketCompiler::new(Arc::new(FakeModel::default()), fast_config()).unwrap();
    let mut segments = opening();
    segments.push(segment("mn10:1.1", 3, "again", None));

    let packet = compiler
        .compile(request(segments), &NoProgress, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(packet.progress.state, PacketState::Complete);
    assert_eq!(packet.canonical_segments.len(), 2);
    assert_eq!(packet.progress.total_segments, 2);
    let duplicate: Vec<&packet::ValidationIssue> = errors(&packet)
        .into_iter()
        .filter(|i| i.code == IssueCode::DuplicateSegment)
        .collect();
    assert_eq!(duplicate.len(), 1);
    assert_eq!(duplicate[0].segment_id.as_ref().map(SegmentId::as_str), Some("mn10:1.1"));
    assert!(!packet.validation_issues.iter().any(|i| i.code == IssueCode::TextIntegrity));
}

struct OpeningSource;

#[async_trait]
impl SegmentSource for OpeningSource {
    async fn fetch(&self, work: &WorkRequest) -> Result<Vec<CanonicalSegment>, SourceError> {
        match work.work_id.as_str() {
            "mn10" => Ok(opening()),
            other => Err(SourceError::NotFound(other.to_string())),
        }
    }

    fn provider(&self) -> &str {
        "fixture"
    }
}

#[tokio::test]
async fn works_are_fetched_from_a_segment_source() {
    let compiler = PacketCompiler::new(Arc::new(FakeModel::default()), fast_config()).unwrap();
    let work = WorkRequest { work_id: WorkId::new("mn10").unwrap(), edition: Some("sujato".into()) };
    let boundaries = vec![BoundaryNote { starts_at: SegmentId::new("mn10:1.2").unwrap(), label: None }];

    let packet = compiler
        .compile_work(&OpeningSource, &work, boundaries, &NoProgress, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(packet.source.provider, "fixture");
    assert_eq!(packet.source.edition.as_deref(), Some("sujato"));
    assert_eq!(packet.progress.total_segments, 2);

    let missing = WorkRequest { work_id: WorkId::new("mn11").unwrap(), edition: None };
    let err = compiler
        .compile_work(&OpeningSource, &missing, Vec::new(), &NoProgress, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CompileError::Source(SourceError::NotFound(_))));
}
