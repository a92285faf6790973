//! # Per-Student Shaping
//!
//! The translated text for a language group is shared; each student may get a
//! re-shaped copy before delivery.
//!
//! ## Shaping Steps:
//! - **Term locking**: glossary terms are forced to their canonical rendering
//! - **Low-literacy simplification**: parenthetical asides are removed and
//!   whitespace is collapsed

use crate::pipeline::providers::primary_language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Preferences a student sends with `register`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerSettings {
    /// Speak the text on the client instead of receiving server audio
    pub use_client_speech: bool,
    pub low_literacy: bool,
    /// Preferred synthesis tier, tried before the default sequence
    pub tts_tier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub term: String,
    pub rendering: String,
}

/// Locked terminology per target language (keyed by primary subtag).
#[derive(Debug, Default)]
pub struct TermGlossary {
    entries: RwLock<HashMap<String, Vec<GlossaryEntry>>>,
}

impl TermGlossary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `term` to `rendering` for one target language, replacing any earlier lock.
    pub fn lock_term(&self, language: &str, term: &str, rendering: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let list = entries.entry(primary_language(language)).or_default();
        list.retain(|e| !e.term.eq_ignore_ascii_case(term));
        list.push(GlossaryEntry {
            term: term.to_string(),
            rendering: rendering.to_string(),
        });
    }

    pub fn entries(&self, language: &str) -> Vec<GlossaryEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&primary_language(language))
            .cloned()
            .unwrap_or_default()
    }

    /// Replace whole-word, ASCII case-insensitive occurrences of locked terms.
    pub fn apply(&self, language: &str, text: &str) -> String {
        self.entries(language)
            .iter()
            .fold(text.to_string(), |acc, entry| {
                replace_word(&acc, &entry.term, &entry.rendering)
            })
    }
}

fn is_word_char(c: Option<char>) -> bool {
    c.map_or(false, |c| c.is_alphanumeric() || c == '_')
}

fn replace_word(text: &str, term: &str, rendering: &str) -> String {
    if term.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, _) in text.char_indices() {
        if start < cursor {
            continue;
        }
        let end = start + term.len();
        let Some(candidate) = text.get(start..end) else {
            continue;
        };
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        if candidate.eq_ignore_ascii_case(term) && !is_word_char(before) && !is_word_char(after) {
            out.push_str(&text[cursor..start]);
            out.push_str(rendering);
            cursor = end;
        }
    }
    out.push_str(&text[cursor..]);
    out
}

/// Drop parenthetical and bracketed asides and collapse whitespace.
pub fn simplify_for_low_literacy(text: &str) -> String {
    let mut depth = 0usize;
    let mut kept = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => kept.push(c),
            _ => {}
        }
    }

    let simplified = kept.split_whitespace().collect::<Vec<_>>().join(" ");
    let simplified = simplified
        .replace(" ,", ",")
        .replace(" .", ".")
        .replace(" ?", "?")
        .replace(" !", "!");

    if simplified.is_empty() {
        text.trim().to_string()
    } else {
        simplified
    }
}

/// Shape the shared group text for one student.
pub fn shape_for_listener(
    text: &str,
    language: &str,
    settings: &ListenerSettings,
    glossary: &TermGlossary,
) -> String {
    let locked = glossary.apply(language, text);
    if settings.low_literacy {
        simplify_for_low_literacy(&locked)
    } else {
        locked
    }
}
