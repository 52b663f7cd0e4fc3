//! Local knowledge base of pre-answered questions (`knowledge.toml`).
//!
//! ```toml
//! [[entry]]
//! question = "which database?"
//! kind = "choice"
//! value = "postgres"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{DecisionKind, DecisionValue};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub question: String,
    #[serde(default)]
    pub kind: DecisionKind,
    pub value: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnowledgeFile {
    #[serde(default, rename = "entry")]
    entries: Vec<KnowledgeEntry>,
}

/// Exact-match lookup table keyed by question text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeBase {
    answers: BTreeMap<String, DecisionValue>,
}

impl KnowledgeBase {
    pub fn from_entries(entries: impl IntoIterator<Item = KnowledgeEntry>) -> Result<Self> {
        let mut answers = BTreeMap::new();
        for entry in entries {
            let question = entry.question.trim().to_string();
            if question.is_empty() {
                return Err(anyhow!("knowledge entry has an empty question"));
            }
            let value = DecisionValue::parse(entry.kind, &entry.value)
                .map_err(|msg| anyhow!("knowledge entry '{question}': {msg}"))?;
            if answers.insert(question.clone(), value).is_some() {
                return Err(anyhow!("duplicate knowledge entry '{question}'"));
            }
        }
        Ok(Self { answers })
    }

    /// The stored answer for `question`, if it has the requested kind.
    pub fn lookup(&self, question: &str, kind: DecisionKind) -> Option<&DecisionValue> {
        self.answers
            .get(question.trim())
            .filter(|value| value.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

/// Load the knowledge base; a missing file is an empty base.
pub fn load_knowledge(path: &Path) -> Result<KnowledgeBase> {
    if !path.exists() {
        return Ok(KnowledgeBase::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: KnowledgeFile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    KnowledgeBase::from_entries(file.entries).with_context(|| format!("load {}", path.display()))
}
