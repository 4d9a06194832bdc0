//! Text analysis for the fulltext index.
//!
//! The analyzer configuration is stored with the index, and the same
//! pipeline runs at index time and query time:
//!
//! 1. lowercase, split on non-alphanumeric, drop tokens under 2 chars
//! 2. optional umlaut folding (ä→a, ö→o, ü→u, ß→ss)
//! 3. optional stopword removal (configured list, or a small built-in
//!    list per language)
//! 4. optional stemming: an English Porter subset, or German suffix
//!    stripping

use serde::{Deserialize, Serialize};

/// Analyzer language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Language {
    /// English: Porter-subset stemming.
    En,
    /// German: suffix stripping.
    De,
    /// No language-specific processing.
    #[default]
    None,
}

/// Per-index analyzer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Language driving stemming and the default stopword list.
    pub language: Language,
    /// Apply the language stemmer.
    pub stemming_enabled: bool,
    /// Remove stopwords.
    pub stopwords_enabled: bool,
    /// Custom stopword list; empty means the built-in list.
    pub stopwords: Vec<String>,
    /// Fold German umlauts before tokenizing.
    pub normalize_umlauts: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            language: Language::None,
            stemming_enabled: false,
            stopwords_enabled: false,
            stopwords: Vec::new(),
            normalize_umlauts: false,
        }
    }
}

impl AnalyzerConfig {
    /// Sensible defaults for a language: stemming and stopwords on,
    /// umlaut folding for German.
    pub fn for_language(language: Language) -> Self {
        AnalyzerConfig {
            language,
            stemming_enabled: language != Language::None,
            stopwords_enabled: language != Language::None,
            stopwords: Vec::new(),
            normalize_umlauts: language == Language::De,
        }
    }

    /// Run the full pipeline over `text`.
    pub fn analyze(&self, text: &str) -> Vec<String> {
        let folded;
        let input = if self.normalize_umlauts {
            folded = fold_umlauts(text);
            folded.as_str()
        } else {
            text
        };

        tokenize(input)
            .into_iter()
            .filter(|token| !self.is_stopword(token))
            .map(|token| {
                if self.stemming_enabled {
                    match self.language {
                        Language::En => stem_en(&token),
                        Language::De => stem_de(&token),
                        Language::None => token,
                    }
                } else {
                    token
                }
            })
            .filter(|token| token.len() >= 2)
            .collect()
    }

    fn is_stopword(&self, token: &str) -> bool {
        if !self.stopwords_enabled {
            return false;
        }
        if !self.stopwords.is_empty() {
            return self.stopwords.iter().any(|s| s == token);
        }
        let builtin: &[&str] = match self.language {
            Language::En => EN_STOPWORDS,
            Language::De => DE_STOPWORDS,
            Language::None => &[],
        };
        builtin.contains(&token)
    }
}

const EN_STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "in", "on",
    "at", "to", "of", "for", "with", "by", "it", "this", "that",
];

const DE_STOPWORDS: &[&str] = &[
    "der", "die", "das", "und", "oder", "aber", "ein", "eine", "ist", "sind", "war", "waren",
    "in", "an", "auf", "zu", "von", "fur", "mit", "bei", "es", "im", "den",
];

/// Lowercase, split on non-alphanumeric, drop tokens under 2 chars.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() >= 2)
        .map(String::from)
        .collect()
}

/// Fold German umlauts and sharp s.
pub fn fold_umlauts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'ä' => out.push('a'),
            'ö' => out.push('o'),
            'ü' => out.push('u'),
            'Ä' => out.push('A'),
            'Ö' => out.push('O'),
            'Ü' => out.push('U'),
            'ß' => out.push_str("ss"),
            other => out.push(other),
        }
    }
    out
}

fn has_vowel(s: &str) -> bool {
    s.chars().any(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y'))
}

/// English Porter subset: plural reduction, -ed/-ing removal with
/// double-consonant undoubling, and a few common suffixes. Enough to
/// conflate the usual inflections ("running" → "run", "stories" →
/// "stori" → "story" is *not* attempted).
pub fn stem_en(token: &str) -> String {
    let mut s = token.to_string();

    // Step 1a: plurals.
    if s.ends_with("sses") {
        s.truncate(s.len() - 2);
    } else if s.ends_with("ies") {
        s.truncate(s.len() - 2);
    } else if s.ends_with('s') && !s.ends_with("ss") && s.len() > 3 {
        s.truncate(s.len() - 1);
    }

    // Step 1b: -eed / -ed / -ing.
    if s.ends_with("eed") {
        s.truncate(s.len() - 1);
    } else if s.ends_with("ing") && s.len() > 5 && has_vowel(&s[..s.len() - 3]) {
        s.truncate(s.len() - 3);
        undouble(&mut s);
    } else if s.ends_with("ed") && s.len() > 4 && has_vowel(&s[..s.len() - 2]) {
        s.truncate(s.len() - 2);
        undouble(&mut s);
    }

    // A few common derivational suffixes.
    if s.ends_with("ly") && s.len() > 4 {
        s.truncate(s.len() - 2);
    } else if s.ends_with("ness") && s.len() > 5 {
        s.truncate(s.len() - 4);
    }
    s
}

/// Undouble a trailing consonant pair ("runn" → "run"), sparing l/s/z
/// as Porter does.
fn undouble(s: &mut String) {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let last = bytes[bytes.len() - 1];
        let prev = bytes[bytes.len() - 2];
        if last == prev && last.is_ascii_alphabetic() && !matches!(last, b'l' | b's' | b'z') {
            s.truncate(s.len() - 1);
        }
    }
}

/// German light stemmer: strip one inflectional suffix, longest first,
/// keeping at least three characters of stem.
pub fn stem_de(token: &str) -> String {
    const SUFFIXES: &[&str] = &["ern", "em", "en", "er", "es", "e", "s", "n"];
    for suffix in SUFFIXES {
        if token.ends_with(suffix) && token.len() - suffix.len() >= 3 {
            return token[..token.len() - suffix.len()].to_string();
        }
    }
    token.to_string()
}
