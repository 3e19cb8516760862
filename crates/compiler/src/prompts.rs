//! System prompts, user prompt builders and response schemas.
//!
//! Every system prompt starts with a `[stage:<name>]` marker line so the
//! stage is recoverable from the request alone (logs, replay fixtures).
//!
//! Schemas follow the strict structured-output rules: every property is
//! required and optional values are nullable.

use std::collections::HashMap;

use packet::passes::{PhaseText, RelationTarget};
use packet::rehydrate::attribute_words;
use packet::text::{TokenKind, TranslationToken};
use packet::{
    AlignmentPass, CanonicalSegment, DecompositionPass, DictionaryEntry, SegmentId,
    SenseAssignmentPass, StageKind, WordId, WordSegmentId,
};
use serde_json::{json, Map, Value};

/// The marker line that opens the system prompt for `stage`.
pub fn stage_marker(stage: StageKind) -> String {
    format!("[stage:{}]", stage.as_str())
}

pub fn system_prompt(stage: StageKind) -> String {
    let body = match stage {
        StageKind::Planning => PLANNING,
        StageKind::Decomposition => DECOMPOSITION,
        StageKind::SenseAssignment => SENSE_ASSIGNMENT,
        StageKind::Alignment => ALIGNMENT,
        StageKind::Layout => LAYOUT,
        StageKind::Monolithic => MONOLITHIC,
    };
    format!("{}\n{}\n{}", stage_marker(stage), body.trim(), JSON_ONLY)
}

const JSON_ONLY: &str = "Reply with a single JSON object and nothing else.";

const PLANNING: &str = r#"
You group canonical source segments into study phases.
Return {"phases":[{"id","title","segmentIds":[...]}]}.
Every segment id you are given must appear in exactly one phase; never invent ids.
Default to one segment per phase. Group only clearly paired lines, such as a
title with its subtitle. Keep the items of an enumeration in separate phases.
Aim for at most 8 source words per phase. Never let a phase cross a marked
work boundary.
"#;

const DECOMPOSITION: &str = r#"
You analyse source-language text word by word.
Each whitespace-separated token is exactly one word; keep punctuation attached
to the token it belongs to. Split each word into morphological segments
(prefix, root, suffix, stem) whose texts concatenate to the word's surface
exactly, character for character. Give each segment at most 3 short tooltips.
Classify each word as "content" or "function". Record cross-word grammatical
relations on the segment that carries the grammatical marker.
Word ids are w1, w2, ... in order; segment ids are the word id plus s1, s2, ...
"#;

const SENSE_ASSIGNMENT: &str = r#"
You give English senses for analysed words.
Content words get exactly 3 senses, function words 1 or 2, each with a short
nuance. Use the dictionary hints when present and infer senses when they are
not. For compounds you may also give senses for individual segments.
Use the word and segment ids exactly as given.
"#;

const ALIGNMENT: &str = r#"
You align a reference translation with the analysed source words.
For every non-whitespace English token (identified by tokenIndex) either link
it to one source word or segment id, or mark it as a ghost: "required" for
grammatical English scaffolding with no source counterpart, "interpretive" for
words the translator added for clarity. Link each source segment at most once.
"#;

const LAYOUT: &str = r#"
You group the words of a phase into visual layout blocks for a study viewer.
Each block holds at most 5 word ids and every word id appears in exactly one
block. When choosing blocks, prefer in this order:
1. keep words from the same canonical segment (sourceSegmentId) together;
2. follow the English reading order (readingOrder) when it is given;
3. keep words joined by a relation close to each other.
"#;

const MONOLITHIC: &str = r#"
You produce a complete word-by-word study view of source-language text in one
step. Each whitespace-separated token is exactly one word; segment texts must
concatenate to the surface exactly. Content words get 3 English senses,
function words 1 or 2. Then give the English reading line in order, linking
each English word to the word id it renders or marking it as a ghost.
"#;

// ---------------------------------------------------------------------------
// User prompts
// ---------------------------------------------------------------------------

pub fn planning_user(window: &[CanonicalSegment], boundaries: &[&SegmentId]) -> String {
    let segments: Vec<Value> = window
        .iter()
        .map(|s| {
            json!({
                "id": s.id(),
                "text": s.source_text,
                "translation": s.translation(),
                "startsWork": boundaries.contains(&s.id()),
            })
        })
        .collect();
    json!({ "segments": segments }).to_string()
}

fn context_json(context: &[&CanonicalSegment]) -> Value {
    Value::Array(
        context
            .iter()
            .map(|s| json!({"id": s.id(), "text": s.source_text, "translation": s.translation()}))
            .collect(),
    )
}

fn texts_json(texts: &[PhaseText]) -> Value {
    Value::Array(
        texts
            .iter()
            .map(|t| json!({"segmentId": t.segment_id, "text": t.text, "translation": t.translation}))
            .collect(),
    )
}

pub fn decomposition_user(texts: &[PhaseText], context: &[&CanonicalSegment]) -> String {
    json!({
        "precedingContext": context_json(context),
        "segments": texts_json(texts),
    })
    .to_string()
}

pub fn sense_user(
    texts: &[PhaseText],
    decomposition: &DecompositionPass,
    hints: &[(String, DictionaryEntry)],
    context: &[&CanonicalSegment],
) -> String {
    let words: Vec<Value> = decomposition
        .words
        .iter()
        .map(|w| {
            let segments: Vec<Value> = decomposition
                .segments_of(w)
                .into_iter()
                .map(|s| json!({"id": s.id, "text": s.text, "type": s.kind}))
                .collect();
            json!({"id": w.id, "surface": w.surface, "class": w.class, "segments": segments})
        })
        .collect();
    let dictionary: Vec<Value> = hints
        .iter()
        .map(|(surface, entry)| json!({"surface": surface, "entry": entry}))
        .collect();
    json!({
        "precedingContext": context_json(context),
        "segments": texts_json(texts),
        "words": words,
        "dictionary": dictionary,
    })
    .to_string()
}

pub fn alignment_user(
    tokens: &[TranslationToken],
    decomposition: &DecompositionPass,
    senses: Option<&SenseAssignmentPass>,
) -> String {
    let english: Vec<Value> = tokens
        .iter()
        .filter(|t| t.kind != TokenKind::Whitespace)
        .map(|t| json!({"tokenIndex": t.index, "text": t.text}))
        .collect();
    let words: Vec<Value> = decomposition
        .words
        .iter()
        .map(|w| {
            let gloss: Vec<&str> = senses
                .and_then(|s| s.for_word(&w.id))
                .map(|s| s.senses.iter().map(|x| x.english.as_str()).collect())
                .unwrap_or_default();
            let segments: Vec<Value> = decomposition
                .segments_of(w)
                .into_iter()
                .map(|s| json!({"id": s.id, "text": s.text}))
                .collect();
            json!({"id": w.id, "surface": w.surface, "senses": gloss, "segments": segments})
        })
        .collect();
    json!({ "englishTokens": english, "words": words }).to_string()
}

/// Layout input: each word with its canonical segment, the relations
/// between words, and the non-ghost English reading order (`null` when
/// alignment did not run).
pub fn layout_user(
    texts: &[PhaseText],
    decomposition: &DecompositionPass,
    alignment: Option<&AlignmentPass>,
) -> String {
    let provided: Vec<Option<SegmentId>> =
        decomposition.words.iter().map(|w| w.source_segment_id.clone()).collect();
    let owners = attribute_words(&provided, texts);
    let words: Vec<Value> = decomposition
        .words
        .iter()
        .zip(&owners)
        .map(|(w, owner)| {
            json!({
                "id": w.id,
                "surface": w.surface,
                "class": w.class,
                "sourceSegmentId": owner,
                "segmentIds": w.segment_ids,
            })
        })
        .collect();

    let word_of: HashMap<&WordSegmentId, &WordId> =
        decomposition.segments.iter().map(|s| (&s.id, &s.word_id)).collect();
    let relations: Vec<Value> = decomposition
        .relations
        .iter()
        .map(|r| {
            let to = match &r.target {
                RelationTarget::Word(w) => Some(w),
                RelationTarget::Segment(s) => word_of.get(s).copied(),
            };
            json!({
                "fromWordId": word_of.get(&r.from_segment_id),
                "toWordId": to,
                "type": r.kind,
                "label": r.label,
            })
        })
        .collect();

    let reading_order = alignment.map(|a| a.reading_order(decomposition));
    json!({
        "segments": texts_json(texts),
        "words": words,
        "relations": relations,
        "readingOrder": reading_order,
    })
    .to_string()
}

pub fn monolithic_user(texts: &[PhaseText], context: &[&CanonicalSegment]) -> String {
    decomposition_user(texts, context)
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

pub fn schema(stage: StageKind) -> Value {
    match stage {
        StageKind::Planning => object([(
            "phases",
            array(object([
                ("id", nullable(string())),
                ("title", nullable(string())),
                ("segmentIds", array(string())),
            ])),
        )]),
        StageKind::Decomposition => object([
            (
                "words",
                array(object([
                    ("id", string()),
                    ("surface", string()),
                    ("class", word_class()),
                    ("segmentIds", array(string())),
                    ("sourceSegmentId", nullable(string())),
                    ("isAnchor", json!({"type": ["boolean", "null"]})),
                ])),
            ),
            (
                "segments",
                array(object([
                    ("id", string()),
                    ("wordId", string()),
                    ("text", string()),
                    ("type", enumeration(&["root", "prefix", "suffix", "stem"])),
                    ("tooltips", array(string())),
                    ("morph", nullable(morphology())),
                ])),
            ),
            (
                "relations",
                array(object([
                    ("id", string()),
                    ("fromSegmentId", string()),
                    ("targetWordId", nullable(string())),
                    ("targetSegmentId", nullable(string())),
                    ("type", string()),
                    ("label", string()),
                    ("status", enumeration(&["confirmed", "tentative"])),
                ])),
            ),
        ]),
        StageKind::SenseAssignment => object([
            (
                "senses",
                array(object([
                    ("wordId", string()),
                    ("class", word_class()),
                    ("senses", array(sense())),
                ])),
            ),
            (
                "segmentSenses",
                array(object([("segmentId", string()), ("senses", array(sense()))])),
            ),
        ]),
        StageKind::Alignment => object([(
            "tokens",
            array(object([
                ("tokenIndex", json!({"type": "integer"})),
                ("text", string()),
                ("linkedSegmentId", nullable(string())),
                ("linkedWordId", nullable(string())),
                ("isGhost", json!({"type": "boolean"})),
                ("ghostKind", nullable_enumeration(&["required", "interpretive"])),
            ])),
        )]),
        StageKind::Layout => object([("layoutBlocks", array(array(string())))]),
        StageKind::Monolithic => object([
            (
                "words",
                array(object([
                    ("id", nullable(string())),
                    ("surface", string()),
                    ("class", word_class()),
                    ("sourceSegmentId", nullable(string())),
                    (
                        "segments",
                        array(object([
                            ("id", nullable(string())),
                            ("text", string()),
                            ("type", enumeration(&["root", "prefix", "suffix", "stem"])),
                            ("tooltips", array(string())),
                        ])),
                    ),
                    ("senses", array(sense())),
                ])),
            ),
            (
                "englishStructure",
                array(object([
                    ("text", string()),
                    ("linkedWordId", nullable(string())),
                    ("linkedSegmentId", nullable(string())),
                    ("isGhost", json!({"type": "boolean"})),
                    ("ghostKind", nullable_enumeration(&["required", "interpretive"])),
                ])),
            ),
        ]),
    }
}

fn object<const N: usize>(props: [(&str, Value); N]) -> Value {
    let required: Vec<&str> = props.iter().map(|(name, _)| *name).collect();
    let properties: Map<String, Value> =
        props.into_iter().map(|(name, schema)| (name.to_string(), schema)).collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn array(items: Value) -> Value {
    json!({"type": "array", "items": items})
}

fn string() -> Value {
    json!({"type": "string"})
}

fn nullable(schema: Value) -> Value {
    json!({"anyOf": [schema, {"type": "null"}]})
}

fn enumeration(values: &[&str]) -> Value {
    json!({"type": "string", "enum": values})
}

fn nullable_enumeration(values: &[&str]) -> Value {
    let mut all: Vec<Value> = values.iter().map(|v| Value::from(*v)).collect();
    all.push(Value::Null);
    json!({"type": ["string", "null"], "enum": all})
}

fn word_class() -> Value {
    enumeration(&["content", "function"])
}

fn sense() -> Value {
    object([("english", string()), ("nuance", string()), ("notes", nullable(string()))])
}

fn morphology() -> Value {
    object([
        ("case", nullable(string())),
        ("number", nullable(string())),
        ("gender", nullable(string())),
        ("person", nullable(string())),
        ("tense", nullable(string())),
        ("mood", nullable(string())),
        ("voice", nullable(string())),
        ("lemma", nullable(string())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet::text::tokenize_translation;

    #[test]
    fn every_system_prompt_names_its_stage() {
        for stage in [
            StageKind::Planning,
            StageKind::Decomposition,
            StageKind::SenseAssignment,
            StageKind::Alignment,
            StageKind::Layout,
            StageKind::Monolithic,
        ] {
            let prompt = system_prompt(stage);
            assert!(prompt.starts_with(&stage_marker(stage)), "{prompt}");
        }
    }

    #[test]
    fn schemas_require_every_property() {
        fn check(schema: &Value) {
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                let required: Vec<&str> = schema["required"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .filter_map(Value::as_str)
                    .collect();
                assert_eq!(required.len(), props.len());
                assert_eq!(schema["additionalProperties"], false);
                props.values().for_each(check);
            }
            if let Some(items) = schema.get("items") {
                check(items);
            }
            if let Some(options) = schema.get("anyOf").and_then(Value::as_array) {
                options.iter().for_each(check);
            }
        }
        for stage in StageKind::SPECIALISTS {
            check(&schema(stage));
        }
        check(&schema(StageKind::Planning));
        check(&schema(StageKind::Monolithic));
    }

    #[test]
    fn alignment_prompt_omits_whitespace_tokens() {
        let tokens = tokenize_translation("Thus I heard.");
        let prompt: Value =
            serde_json::from_str(&alignment_user(&tokens, &DecompositionPass::default(), None)).unwrap();
        let indices: Vec<u64> = prompt["englishTokens"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["tokenIndex"].as_u64())
            .collect();
        assert_eq!(indices, vec![0, 2, 4, 5]);
    }
}
