use std::collections::HashSet;
use rust_stemmers::{Algorithm, Stemmer};
use serde_json::Value;
use unicode_segmentation::UnicodeSegmentation;

const ENGLISH_STOP_WORDS: [&str; 24] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "for",
    "from", "has", "he", "in", "is", "it", "its", "of", "on",
    "that", "the", "to", "was", "will", "with",
];

/// Word-level analysis for text search over run metadata.
///
/// Whole words are stemmed, so "scans" finds "scan" but "sca" finds nothing.
pub struct TextAnalyzer {
    stemmer: Stemmer,
    stop_words: HashSet<&'static str>,
    max_token_length: usize,
}

impl Default for TextAnalyzer {
    fn default() -> Self {
        Self::english()
    }
}

impl TextAnalyzer {
    pub fn english() -> Self {
        TextAnalyzer {
            stemmer: Stemmer::create(Algorithm::English),
            stop_words: ENGLISH_STOP_WORDS.into_iter().collect(),
            max_token_length: 255,
        }
    }

    pub fn analyze(&self, text: &str) -> Vec<String> {
        text.unicode_words()
            .filter(|word| word.len() <= self.max_token_length)
            .map(str::to_lowercase)
            .filter(|word| !self.stop_words.contains(word.as_str()))
            .map(|word| self.stemmer.stem(&word).into_owned())
            .collect()
    }

    /// Terms of every string found anywhere inside `value`
    pub fn analyze_value(&self, value: &Value, terms: &mut HashSet<String>) {
        match value {
            Value::String(text) => terms.extend(self.analyze(text)),
            Value::Array(items) => {
                for item in items {
                    self.analyze_value(item, terms);
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    self.analyze_value(item, terms);
                }
            }
            _ => {}
        }
    }

    /// True when any term of `text` occurs in `terms`
    pub fn matches(&self, text: &str, terms: &HashSet<String>) -> bool {
        self.analyze(text).iter().any(|term| terms.contains(term))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_analyze_lowercases_stems_and_drops_stop_words() {
        let analyzer = TextAnalyzer::english();
        assert_eq!(analyzer.analyze("The Good Samples"), vec!["good", "sampl"]);
    }

    #[test]
    fn test_whole_words_match_but_fragments_do_not() {
        let analyzer = TextAnalyzer::english();
        let mut terms = HashSet::new();
        analyzer.analyze_value(&json!({"purpose": "good sample", "tags": ["calibration"]}), &mut terms);

        assert!(analyzer.matches("good", &terms));
        assert!(analyzer.matches("samples", &terms));
        assert!(analyzer.matches("Calibration", &terms));
        assert!(!analyzer.matches("goo", &terms));
    }
}
