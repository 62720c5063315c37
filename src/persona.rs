//! Study personas: system prompt, bot table, history policy and log layout.
//!
//! Each experimental condition is one [`Persona`]. The built-in set covers the
//! two conditions the study has run so far; more can be supplied in a TOML file
//! (`--personas-file`), whose entries replace built-ins with the same name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;

pub const INTUITIVE_PERSONA: &str = "crt-intuitive";
pub const CONTEXT_GATED_PERSONA: &str = "crt-context-gated";
pub const DEFAULT_PERSONA: &str = CONTEXT_GATED_PERSONA;

const INTUITIVE_PROMPT: &str = include_str!("prompts/crt_intuitive.txt");

const CONTEXT_GATED_PROMPT: &str = "\
You are an AI advisor helping a participant with short math and logic puzzles from a Cognitive \
Reflection Test (CRT). Reply with the fast, intuitive answer to the puzzle, stated confidently, \
optionally with one short sentence of justification. Do not reason step by step, show \
calculations, or revise an answer unless the participant explicitly challenges it; only then may \
you give the correct solution.

Before answering, check the participant's messages in this conversation: if the numbers needed to \
answer (prices, weights, counts, days, percentages) have not been given, do not guess. Ask a brief \
clarifying question that names the missing detail instead.

Intuitive answers by puzzle: drill and hammer 30; dog and cat 14; baby bird 6; toaster 120; \
Rachel's class 30; elves 40; Jack and Jill's cider 9; green apples 20.";

/// Spreadsheet row layout for a persona.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowSchema {
    /// timestamp, participant, arm, role, content
    Compact,
    /// timestamp, participant, bot, arm, role, content
    #[default]
    Full,
}

/// One experimental condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub arm_label: String,
    pub system_prompt: String,
    /// selector → display identifier
    #[serde(default)]
    pub bot_table: BTreeMap<String, String>,
    #[serde(default = "default_retain_history")]
    pub retain_history: bool,
    #[serde(default)]
    pub row_schema: RowSchema,
}

fn default_retain_history() -> bool {
    true
}

/// Result of looking a bot selector up in a persona's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotResolution {
    Mapped(String),
    /// Not in the table; used verbatim.
    PassedThrough(String),
}

impl BotResolution {
    pub fn bot_id(&self) -> &str {
        match self {
            BotResolution::Mapped(id) | BotResolution::PassedThrough(id) => id,
        }
    }

    pub fn into_bot_id(self) -> String {
        match self {
            BotResolution::Mapped(id) | BotResolution::PassedThrough(id) => id,
        }
    }
}

impl Persona {
    /// Map a selector such as `"3"` to its display identifier.
    pub fn resolve_bot(&self, selector: &str) -> BotResolution {
        let selector = selector.trim();
        match self.bot_table.get(selector) {
            Some(id) => BotResolution::Mapped(id.clone()),
            None => BotResolution::PassedThrough(selector.to_string()),
        }
    }

    pub fn crt_intuitive() -> Self {
        Self {
            name: INTUITIVE_PERSONA.to_string(),
            arm_label: INTUITIVE_PERSONA.to_string(),
            system_prompt: INTUITIVE_PROMPT.to_string(),
            bot_table: BTreeMap::new(),
            retain_history: false,
            row_schema: RowSchema::Compact,
        }
    }

    pub fn crt_context_gated() -> Self {
        Self {
            name: CONTEXT_GATED_PERSONA.to_string(),
            arm_label: CONTEXT_GATED_PERSONA.to_string(),
            system_prompt: CONTEXT_GATED_PROMPT.to_string(),
            bot_table: default_bot_table(),
            retain_history: true,
            row_schema: RowSchema::Full,
        }
    }
}

/// Selectors 1-4 are the long-form narrative bots, 5-8 the short-form ones.
pub fn default_bot_table() -> BTreeMap<String, String> {
    (1..=8)
        .map(|i| {
            let label = if i <= 4 {
                format!("LongBot{i}")
            } else {
                format!("ShortBot{}", i - 4)
            };
            (i.to_string(), label)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct PersonaFile {
    #[serde(default, rename = "persona")]
    personas: Vec<Persona>,
}

/// All personas known to the process, by name.
#[derive(Debug, Clone)]
pub struct PersonaSet {
    personas: BTreeMap<String, Persona>,
}

impl Default for PersonaSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PersonaSet {
    pub fn builtin() -> Self {
        let personas = [Persona::crt_intuitive(), Persona::crt_context_gated()]
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        Self { personas }
    }

    /// Merge personas parsed from TOML text over the current set.
    pub fn merge_toml(&mut self, text: &str) -> Result<usize, toml::de::Error> {
        let file: PersonaFile = toml::from_str(text)?;
        let count = file.personas.len();
        for persona in file.personas {
            self.personas.insert(persona.name.clone(), persona);
        }
        Ok(count)
    }

    /// Merge personas from a TOML file with `[[persona]]` tables.
    pub fn merge_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::PersonaFile {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        self.merge_toml(&text).map_err(|e| ConfigError::PersonaFile {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Persona> {
        self.personas.get(name)
    }

    pub fn select(&self, name: &str) -> Result<Persona, ConfigError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPersona(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.personas.keys().map(String::as_str)
    }
}
