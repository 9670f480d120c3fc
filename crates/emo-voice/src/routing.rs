//! Turn routing: quit phrases, barge-in stop phrases and persona-switch prefixes.
//!
//! Phrase matching is exact after normalization (trim, lowercase, single spaces).
//! Persona keywords match as a leading word, case-insensitively.

use crate::config::LanguageConfig;
use crate::persona::Persona;

/// Default phrases that end the session when heard as a whole utterance.
pub const DEFAULT_QUIT_PHRASES: [&str; 4] = ["quit", "exit", "stop", "end"];

/// Default phrases that silence playback when heard during a barge-in.
pub const DEFAULT_STOP_PHRASES: [&str; 5] = ["stop", "quiet", "shut up", "be quiet", "enough"];

/// Where one transcribed utterance goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// End the session.
    Quit,
    /// Nothing left to answer; loop without calling the generator.
    Skip,
    /// Send this text to the generator.
    Respond(String),
}

/// Result of routing one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedTurn {
    /// Persona selected by a leading keyword, if any.
    pub persona: Option<Persona>,
    pub route: Route,
}

/// Phrase tables for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRouter {
    quit_phrases: Vec<String>,
    stop_phrases: Vec<String>,
}

impl Default for TurnRouter {
    fn default() -> Self {
        Self::new(DEFAULT_QUIT_PHRASES, DEFAULT_STOP_PHRASES)
    }
}

impl TurnRouter {
    pub fn new<Q, S>(quit_phrases: Q, stop_phrases: S) -> Self
    where
        Q: IntoIterator,
        Q::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let table = |phrases: Vec<String>| -> Vec<String> {
            phrases.into_iter().filter(|p| !p.is_empty()).collect()
        };
        Self {
            quit_phrases: table(quit_phrases.into_iter().map(|p| normalize(p.as_ref())).collect()),
            stop_phrases: table(stop_phrases.into_iter().map(|p| normalize(p.as_ref())).collect()),
        }
    }

    pub fn from_config(cfg: &LanguageConfig) -> Self {
        Self::new(&cfg.quit_phrases, &cfg.stop_phrases)
    }

    pub fn is_quit(&self, text: &str) -> bool {
        let text = normalize(text);
        self.quit_phrases.iter().any(|p| *p == text)
    }

    pub fn is_stop(&self, text: &str) -> bool {
        let text = normalize(text);
        self.stop_phrases.iter().any(|p| *p == text)
    }

    /// Route one utterance: quit check first, then persona switch, then the empty check.
    pub fn route(&self, text: &str) -> RoutedTurn {
        if self.is_quit(text) {
            return RoutedTurn {
                persona: None,
                route: Route::Quit,
            };
        }

        let (persona, rest) = match split_persona_prefix(text) {
            Some((persona, rest)) => (Some(persona), rest),
            None => (None, text.trim()),
        };

        let route = if rest.is_empty() {
            Route::Skip
        } else {
            Route::Respond(rest.to_string())
        };
        RoutedTurn { persona, route }
    }
}

/// Lowercase, trim, and collapse internal whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Split a leading persona keyword off `text`.
///
/// The keyword must be followed by end of text or a non-alphanumeric character, so
/// "emotional" does not select EMO. Longer keywords are tried first. The remainder is
/// trimmed of whitespace but otherwise untouched, punctuation included.
pub fn split_persona_prefix(text: &str) -> Option<(Persona, &str)> {
    let text = text.trim_start();
    let mut candidates: Vec<(Persona, &'static str)> = Persona::SWITCHABLE
        .iter()
        .filter_map(|p| p.keyword().map(|k| (p.clone(), k)))
        .collect();
    candidates.sort_by_key(|(_, k)| std::cmp::Reverse(k.len()));

    for (persona, keyword) in candidates {
        let Some(head) = text.get(..keyword.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(keyword) {
            continue;
        }
        let rest = &text[keyword.len()..];
        if rest.chars().next().map_or(true, |c| !c.is_alphanumeric()) {
            return Some((persona, rest.trim()));
        }
    }
    None
}
