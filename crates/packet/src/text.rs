//! Text normalisation and reference-translation tokenisation.
//!
//! Normalisation here is deliberately simple: lowercase, drop everything that
//! is neither a letter, a digit, a combining mark nor whitespace, then collapse
//! whitespace. Source texts are expected in NFC.

use serde::{Deserialize, Serialize};

/// Returns `true` for Unicode combining diacritical marks, which must survive
/// punctuation stripping so decomposed romanisations still compare equal.
fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF | 0xFE20..=0xFE2F)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || is_combining_mark(c)
}

/// Case-folds, strips punctuation and collapses whitespace.
///
/// Used by the text-integrity check, so `"Evaṁ me sutaṁ—"` and
/// `"evaṁ  me sutaṁ"` normalise to the same string.
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter_map(|c| match c {
            c if is_word_char(c) => Some(c),
            c if c.is_whitespace() => Some(' '),
            _ => None,
        })
        .collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Content-address key for the dictionary cache: a surface form normalised
/// to a single lowercase token with punctuation removed.
pub fn surface_key(surface: &str) -> String {
    normalize(surface).replace(' ', "")
}

// ---------------------------------------------------------------------------
// Reference translation tokens
// ---------------------------------------------------------------------------

/// Kind of an English token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Word,
    Whitespace,
    Punctuation,
}

/// One token of a tokenised reference translation.
///
/// Indices are stable: the same text always produces the same numbering, and
/// whitespace tokens consume an index like any other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationToken {
    pub index: u32,
    pub text: String,
    pub kind: TokenKind,
}

/// Splits a translation into word, whitespace and punctuation tokens.
///
/// Apostrophes and hyphens between letters stay inside the word
/// (`"Blessed-One's"` is one token).
pub fn tokenize_translation(text: &str) -> Vec<TranslationToken> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let kind = if c.is_whitespace() {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            TokenKind::Whitespace
        } else if is_word_char(c) {
            while i < chars.len() {
                let ch = chars[i];
                let joiner = matches!(ch, '\'' | '’' | '-')
                    && i + 1 < chars.len()
                    && is_word_char(chars[i + 1])
                    && i > start;
                if is_word_char(ch) || joiner {
                    i += 1;
                } else {
                    break;
                }
            }
            TokenKind::Word
        } else {
            i += 1;
            TokenKind::Punctuation
        };
        tokens.push(TranslationToken {
            index: tokens.len() as u32,
            text: chars[start..i].iter().collect(),
            kind,
        });
    }
    tokens
}

// ---------------------------------------------------------------------------
// Content words
// ---------------------------------------------------------------------------

/// English function words ignored by the content-coverage check.
const STOPWORDS: &[&str] = &[
    "a", "about", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be", "been",
    "being", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "here", "him", "his", "how", "i", "if", "in", "into", "is", "it",
    "its", "me", "my", "no", "not", "of", "on", "or", "our", "out", "over", "she",
    "should", "so", "some", "than", "that", "the", "their", "them", "then", "there", "these",
    "they", "this", "those", "thus", "to", "too", "up", "upon", "us", "was", "we", "were",
    "what", "when", "where", "which", "while", "who", "whom", "will", "with", "would", "you",
    "your",
];

/// Lowercases a word token and strips a trailing possessive.
pub fn fold_word(word: &str) -> String {
    let lower = word.to_lowercase();
    lower
        .strip_suffix("'s")
        .or_else(|| lower.strip_suffix("’s"))
        .map(str::to_string)
        .unwrap_or(lower)
}

/// Lowercased content words of an English text, in order, duplicates kept.
pub fn content_words(text: &str) -> Vec<String> {
    tokenize_translation(text)
        .into_iter()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| fold_word(&t.text))
        .filter(|w| !STOPWORDS.contains(&w.as_str()) && !w.chars().all(|c| c.is_numeric()))
        .collect()
}

/// All lowercased word tokens of an English text.
pub fn english_words(text: &str) -> Vec<String> {
    tokenize_translation(text)
        .into_iter()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| fold_word(&t.text))
        .collect()
}
