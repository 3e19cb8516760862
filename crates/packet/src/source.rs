//! Canonical source segments: the immutable input of every compilation.

use serde::{Deserialize, Serialize};

use crate::{SegmentId, WordRange, WorkId};

/// Fully-qualified address of one canonical segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Archive the segment came from (e.g. `"suttacentral"`).
    pub provider: String,
    pub work_id: WorkId,
    pub segment_id: SegmentId,
}

/// One addressable unit of source-language text plus its optional reference
/// translation.
///
/// Immutable once fetched. `order` is total and stable across the input list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSegment {
    #[serde(rename = "ref")]
    pub source_ref: SourceRef,
    pub order: u32,
    pub source_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_translation: Option<String>,
}

impl CanonicalSegment {
    /// Shorthand for the segment id.
    pub fn id(&self) -> &SegmentId {
        &self.source_ref.segment_id
    }

    /// Whitespace-delimited source tokens. Each becomes exactly one word.
    pub fn source_words(&self) -> Vec<&str> {
        self.source_text.split_whitespace().collect()
    }

    /// Number of whitespace-delimited source tokens.
    pub fn word_count(&self) -> usize {
        self.source_text.split_whitespace().count()
    }

    /// Source text restricted to `range`, or the full text when `range` is `None`.
    pub fn text_in(&self, range: Option<WordRange>) -> String {
        match range {
            None => self.source_text.trim().to_string(),
            Some(r) => r.slice(&self.source_words()).join(" "),
        }
    }

    /// Reference translation with surrounding whitespace removed; `None` if blank.
    pub fn translation(&self) -> Option<&str> {
        self.reference_translation
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Marks the point where one logical work ends and the next begins.
///
/// The boundary sits immediately before `starts_at`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryNote {
    pub starts_at: SegmentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// What the packet was compiled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketSource {
    pub provider: String,
    pub work_id: WorkId,
    /// Author or edition identifier passed to the segment source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[cfg(test)]
pub(crate) fn segment(id: &str, order: u32, text: &str, translation: Option<&str>) -> CanonicalSegment {
    CanonicalSegment {
        source_ref: SourceRef {
            provider: "test".into(),
            work_id: WorkId::new("w").unwrap(),
            segment_id: SegmentId::new(id).unwrap(),
        },
        order,
        source_text: text.into(),
        reference_translation: translation.map(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialises_wire_shape() {
        let json = r#"{
            "ref": {"provider": "sc", "workId": "mn10", "segmentId": "mn10:1.1"},
            "order": 1,
            "sourceText": "Evaṁ me sutaṁ—",
            "referenceTranslation": "So I have heard."
        }"#;
        let seg: CanonicalSegment = serde_json::from_str(json).unwrap();
        assert_eq!(seg.id().as_str(), "mn10:1.1");
        assert_eq!(seg.source_words(), vec!["Evaṁ", "me", "sutaṁ—"]);
        assert_eq!(seg.translation(), Some("So I have heard."));
    }

    #[test]
    fn text_in_applies_word_range() {
        let seg = segment("s1", 0, "a b  c d", Some("   "));
        assert_eq!(seg.text_in(WordRange::new(1, 3)), "b c");
        assert_eq!(seg.text_in(None), "a b  c d");
        assert_eq!(seg.translation(), None);
    }
}
