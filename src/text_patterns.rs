//! Regex fallbacks over free OCR text.
//!
//! Pure functions, no async. Patterns come from config and are compiled once;
//! an invalid pattern is skipped with a warning instead of failing startup.

use regex::Regex;
use tracing::{debug, warn};

use crate::config::TextPattern;

/// Pre-compiled text patterns ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    patterns: Vec<CompiledPattern>,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    id: String,
    regex: Regex,
    normalize: Option<String>,
}

impl CompiledPatterns {
    /// Compile patterns from config. Skips invalid regexes with a warning.
    pub fn compile(patterns: &[TextPattern]) -> Self {
        let mut compiled = Vec::new();
        for p in patterns {
            match Regex::new(&p.pattern) {
                Ok(regex) => compiled.push(CompiledPattern {
                    id: p.id.clone(),
                    regex,
                    normalize: p.normalize.clone(),
                }),
                Err(e) => {
                    warn!("Skipping invalid text pattern '{}' ({}): {}", p.id, p.pattern, e);
                }
            }
        }
        debug!("Compiled {} text patterns", compiled.len());
        Self { patterns: compiled }
    }

    /// Returns true if there are no compiled patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First match of pattern `id` in `text`, normalized.
    ///
    /// Several patterns may share an id; they are tried in config order.
    pub fn find(&self, id: &str, text: &str) -> Option<String> {
        self.patterns
            .iter()
            .filter(|p| p.id == id)
            .find_map(|p| {
                let cap = p.regex.captures(text)?;
                let raw = cap.get(1).or_else(|| cap.get(0))?.as_str();
                if raw.is_empty() {
                    return None;
                }
                Some(normalize_value(raw, p.normalize.as_deref()))
            })
    }
}

/// Apply normalization to a matched value.
fn normalize_value(value: &str, normalize: Option<&str>) -> String {
    match normalize {
        Some("uppercase") => value.to_uppercase(),
        Some("strip_punctuation") => value.chars().filter(|c| c.is_alphanumeric()).collect(),
        Some("uppercase_strip_punctuation") => value
            .to_uppercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect(),
        _ => value.to_string(),
    }
}
