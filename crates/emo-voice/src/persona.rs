//! Persona layer: the named response-style profiles (EMO, EMUSINIO) and the generation prompt.
//!
//! A persona only affects tone. `instruction_for` is pure; `PersonaContext` holds the active
//! persona for a session and may be re-selected from any thread.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

/// Reply the generator uses to end the session. Compared case-sensitively after trimming.
pub const QUIT_SENTINEL: &str = "QUIT";

const EMO_INSTRUCTION: &str = "Speak in a playful, casual tone. \
     Keep replies short, friendly, sometimes with emojis or fun expressions.";

const EMUSINIO_INSTRUCTION: &str = "Speak in a wise, formal, and calm tone. \
     Use full sentences, no emojis, and sound like a mentor.";

const NEUTRAL_INSTRUCTION: &str = "Respond in a helpful, concise manner.";

/// A response-style profile selectable at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Persona {
    /// Playful and casual; emoji allowed.
    #[default]
    Emo,
    /// Wise, formal mentor; no emoji.
    Emusinio,
    /// Any other name. Uses the neutral instruction.
    Other(String),
}

/// Tone/style parameters for one persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersonaStyle {
    pub instruction: &'static str,
    pub emoji_allowed: bool,
}

impl Persona {
    /// Personas that can be selected by a spoken keyword prefix.
    pub const SWITCHABLE: [Persona; 2] = [Persona::Emo, Persona::Emusinio];

    pub fn as_str(&self) -> &str {
        match self {
            Persona::Emo => "EMO",
            Persona::Emusinio => "EMUSINIO",
            Persona::Other(name) => name.as_str(),
        }
    }

    /// Case-insensitive parse; unknown names are kept as `Other`.
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        if name.eq_ignore_ascii_case("emo") {
            Persona::Emo
        } else if name.eq_ignore_ascii_case("emusinio") {
            Persona::Emusinio
        } else {
            Persona::Other(name.to_string())
        }
    }

    /// Spoken keyword that switches to this persona, if any.
    pub fn keyword(&self) -> Option<&'static str> {
        match self {
            Persona::Emo => Some("emo"),
            Persona::Emusinio => Some("emusinio"),
            Persona::Other(_) => None,
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Persona {
    fn from(s: String) -> Self {
        Persona::parse(&s)
    }
}

impl From<&str> for Persona {
    fn from(s: &str) -> Self {
        Persona::parse(s)
    }
}

impl From<Persona> for String {
    fn from(p: Persona) -> Self {
        p.as_str().to_string()
    }
}

/// Instruction text and emoji policy for `persona`. Unknown personas get a neutral instruction.
pub fn instruction_for(persona: &Persona) -> PersonaStyle {
    match persona {
        Persona::Emo => PersonaStyle {
            instruction: EMO_INSTRUCTION,
            emoji_allowed: true,
        },
        Persona::Emusinio => PersonaStyle {
            instruction: EMUSINIO_INSTRUCTION,
            emoji_allowed: false,
        },
        Persona::Other(_) => PersonaStyle {
            instruction: NEUTRAL_INSTRUCTION,
            emoji_allowed: false,
        },
    }
}

/// Build the generation request for one user turn.
///
/// `reply_language`, when set, pins the reply language regardless of what the user speaks.
pub fn build_prompt(persona: &Persona, reply_language: Option<&str>, user_text: &str) -> String {
    let style = instruction_for(persona);
    let mut prompt = format!("You are {}. {}\n", persona, style.instruction);

    if let Some(lang) = reply_language.map(str::trim).filter(|l| !l.is_empty()) {
        prompt.push_str(&format!(
            "IMPORTANT: Always reply in {lang}, natural conversational style. \
             Ignore the language the user speaks in and ALWAYS respond in {lang}.\n"
        ));
    }
    if style.emoji_allowed {
        prompt.push_str("Include emojis in your responses.\n");
    }
    prompt.push_str(&format!(
        "If the user asks to quit/exit/end/stop (in any language), reply ONLY with the word {}.\n",
        QUIT_SENTINEL
    ));
    prompt.push_str(&format!("User said: \"{}\"", user_text));
    prompt
}

/// The active persona of one session.
#[derive(Debug, Default)]
pub struct PersonaContext {
    current: RwLock<Persona>,
}

impl PersonaContext {
    pub fn new(initial: Persona) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> Persona {
        match self.current.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Takes effect from the next generation request.
    pub fn set(&self, persona: Persona) {
        match self.current.write() {
            Ok(mut p) => *p = persona,
            Err(poisoned) => *poisoned.into_inner() = persona,
        }
    }

    pub fn style(&self) -> PersonaStyle {
        instruction_for(&self.current())
    }
}
