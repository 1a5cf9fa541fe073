//! Comment relevance heuristics.
//!
//! Matching is case-insensitive and word-based: text is split on anything
//! that is not alphanumeric, so `"hi!"` contains the word `hi` but `"this"`
//! does not. Multi-word phrases (`"guten morgen"`) match consecutive words.

use std::collections::HashSet;

use crate::config::CommentConfig;

const QUESTION_WEIGHT: f32 = 0.6;
const KEYWORD_WEIGHT: f32 = 0.35;
const LENGTH_WEIGHT: f32 = 0.1;
const PUNCTUATION_WEIGHT: f32 = 0.05;
const LENGTH_BONUS_CHARS: usize = 7;

#[derive(Debug, Clone)]
pub struct CommentClassifier {
    ignore_prefixes: Vec<String>,
    ignore_contains: Vec<String>,
    keywords: HashSet<String>,
    greetings: Vec<Vec<String>>,
    thanks: Vec<Vec<String>>,
}

impl CommentClassifier {
    pub fn new(config: &CommentConfig) -> Self {
        let lower = |list: &[String]| -> Vec<String> {
            list.iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let phrases = |list: &[String]| -> Vec<Vec<String>> {
            list.iter()
                .map(|s| words(&s.to_lowercase()))
                .filter(|w| !w.is_empty())
                .collect()
        };
        Self {
            ignore_prefixes: lower(&config.ignore_if_startswith),
            ignore_contains: lower(&config.ignore_contains),
            keywords: lower(&config.keywords_bonus).into_iter().collect(),
            greetings: phrases(&config.greetings),
            thanks: phrases(&config.thanks),
        }
    }

    /// Commands, configured spam fragments and links.
    pub fn is_ignored(&self, text: &str) -> bool {
        let low = text.trim().to_lowercase();
        self.ignore_prefixes.iter().any(|p| low.starts_with(p.as_str()))
            || self.ignore_contains.iter().any(|c| low.contains(c.as_str()))
            || contains_link(&low)
    }

    pub fn is_greeting(&self, text: &str) -> bool {
        contains_phrase(&words(&text.to_lowercase()), &self.greetings)
    }

    pub fn is_thanks(&self, text: &str) -> bool {
        contains_phrase(&words(&text.to_lowercase()), &self.thanks)
    }

    /// Relevance in [0, 1]: questions, bonus keywords, length and
    /// punctuation each add a fixed weight.
    pub fn score(&self, text: &str) -> f32 {
        let low = text.trim().to_lowercase();
        let mut score = 0.0;
        if low.contains('?') {
            score += QUESTION_WEIGHT;
        }
        if words(&low).iter().any(|w| self.keywords.contains(w)) {
            score += KEYWORD_WEIGHT;
        }
        if low.chars().count() >= LENGTH_BONUS_CHARS {
            score += LENGTH_WEIGHT;
        }
        if low.contains([':', ';', '!']) {
            score += PUNCTUATION_WEIGHT;
        }
        f32::min(score, 1.0)
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(words: &[String], phrases: &[Vec<String>]) -> bool {
    phrases.iter().any(|phrase| {
        words
            .windows(phrase.len())
            .any(|window| window == phrase.as_slice())
    })
}

fn contains_link(low: &str) -> bool {
    if low.contains("http://") || low.contains("https://") {
        return true;
    }
    words(low).windows(2).any(|w| w[0] == "discord" && w[1] == "gg")
}
