//! Fuzzy name similarity.
//!
//! Blends normalized Levenshtein, Jaro-Winkler and a Soundex agreement into
//! one score in `0.0..=1.0`.

use strsim::{jaro_winkler, normalized_levenshtein};

#[derive(Debug, Clone)]
pub struct FuzzyConfig {
    pub levenshtein_weight: f64,
    pub jaro_winkler_weight: f64,
    pub soundex_weight: f64,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            levenshtein_weight: 0.4,
            jaro_winkler_weight: 0.4,
            soundex_weight: 0.2,
        }
    }
}

impl FuzzyConfig {
    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            self.levenshtein_weight,
            self.jaro_winkler_weight,
            self.soundex_weight,
        ];
        if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err("fuzzy weights must be in range [0.0, 1.0]".to_string());
        }
        if (weights.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err("fuzzy weights must sum to 1.0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FuzzyScorer {
    config: FuzzyConfig,
}

impl FuzzyScorer {
    pub fn new(config: FuzzyConfig) -> Self {
        Self { config }
    }

    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let (a, b) = (normalize(a), normalize(b));
        if a.is_empty() || b.is_empty() {
            return if a == b { 1.0 } else { 0.0 };
        }
        if a == b {
            return 1.0;
        }
        let sound = if soundex(&a) == soundex(&b) { 1.0 } else { 0.0 };
        normalized_levenshtein(&a, &b) * self.config.levenshtein_weight
            + jaro_winkler(&a, &b) * self.config.jaro_winkler_weight
            + sound * self.config.soundex_weight
    }
}

/// Lower case, trimmed, inner whitespace collapsed.
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Four-character Soundex code; empty for input with no letters.
pub fn soundex(s: &str) -> String {
    let code = |c: char| match c.to_ascii_lowercase() {
        'b' | 'f' | 'p' | 'v' => Some('1'),
        'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => Some('2'),
        'd' | 't' => Some('3'),
        'l' => Some('4'),
        'm' | 'n' => Some('5'),
        'r' => Some('6'),
        _ => None,
    };

    let mut letters = s.chars().filter(char::is_ascii_alphabetic);
    let Some(first) = letters.next() else {
        return String::new();
    };
    let mut out = String::with_capacity(4);
    out.push(first.to_ascii_uppercase());
    let mut previous = code(first);
    for c in letters {
        if out.len() == 4 {
            break;
        }
        let current = code(c);
        if let Some(digit) = current {
            if current != previous {
                out.push(digit);
            }
        }
        // 'h' and 'w' do not separate equal codes.
        if !matches!(c.to_ascii_lowercase(), 'h' | 'w') {
            previous = current;
        }
    }
    while out.len() < 4 {
        out.push('0');
    }
    out
}
