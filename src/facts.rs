use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::agent::{AgentError, CompletionParams, LanguageModel, ModelRole};
use crate::conversation::{Message, Sender};

pub const MAX_HOBBIES: usize = 5;
pub const MAX_INTERESTS: usize = 5;
pub const MAX_NOTES: usize = 20;

const RECENT_USER_MESSAGES: usize = 8;
/// Below this many characters there is not enough signal to bother the model.
const MIN_SIGNAL_CHARS: usize = 10;

const EXTRACTOR_SYSTEM: &str = "You extract personal facts about a user.";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarPolicy {
    #[default]
    FirstWriteWins,
    LatestWins,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hobbies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sarcasm: Option<String>,
}

impl ContactFacts {
    pub fn is_empty(&self) -> bool {
        *self == ContactFacts::default()
    }

    /// Fold `partial` into `self`. Sets only grow; scalars follow `policy`.
    pub fn merge(&mut self, partial: &ContactFacts, policy: ScalarPolicy) {
        merge_scalar(&mut self.name, &partial.name, policy);
        merge_scalar(&mut self.job, &partial.job, policy);
        merge_scalar(&mut self.location, &partial.location, policy);
        merge_scalar(&mut self.emotion, &partial.emotion, policy);
        merge_scalar(&mut self.relationship, &partial.relationship, policy);
        merge_scalar(&mut self.sarcasm, &partial.sarcasm, policy);

        union_keep_newest(&mut self.hobbies, &partial.hobbies, MAX_HOBBIES);
        union_keep_newest(&mut self.interests, &partial.interests, MAX_INTERESTS);
        union_keep_oldest(&mut self.notes, &partial.notes, MAX_NOTES);
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        let scalars = [
            ("name", &self.name),
            ("job", &self.job),
            ("location", &self.location),
            ("mood", &self.emotion),
            ("relationship", &self.relationship),
            ("sarcasm", &self.sarcasm),
        ];
        for (label, value) in scalars {
            if let Some(v) = value {
                lines.push(format!("- {label}: {v}"));
            }
        }
        let sets = [("hobbies", &self.hobbies), ("interests", &self.interests), ("notes", &self.notes)];
        for (label, values) in sets {
            if !values.is_empty() {
                lines.push(format!("- {label}: {}", values.join(", ")));
            }
        }
        lines.join("\n")
    }
}

fn merge_scalar(slot: &mut Option<String>, incoming: &Option<String>, policy: ScalarPolicy) {
    let Some(value) = incoming.as_ref().filter(|v| !v.trim().is_empty()) else {
        return;
    };
    match policy {
        ScalarPolicy::FirstWriteWins if slot.is_some() => {}
        _ => *slot = Some(value.clone()),
    }
}

fn union(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for v in existing.iter().chain(incoming.iter()) {
        if !v.trim().is_empty() && !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

fn union_keep_newest(slot: &mut Vec<String>, incoming: &[String], cap: usize) {
    let fresh = union(&[], incoming);
    let older: Vec<String> = slot.iter().filter(|v| !fresh.contains(v)).cloned().collect();
    let mut merged = union(&older, &fresh);
    if merged.len() > cap {
        merged.drain(..merged.len() - cap);
    }
    *slot = merged;
}

fn union_keep_oldest(slot: &mut Vec<String>, incoming: &[String], cap: usize) {
    let mut merged = union(slot, incoming);
    merged.truncate(cap);
    *slot = merged;
}

// ========================= Extraction =========================

/// Pulls facts out of recent user messages. Never fails: any problem yields empty facts.
pub struct FactExtractor<'a, L: LanguageModel + ?Sized> {
    model: &'a L,
}

impl<'a, L: LanguageModel + ?Sized> FactExtractor<'a, L> {
    pub fn new(model: &'a L) -> Self {
        Self { model }
    }

    pub async fn extract(&self, history: &[Message]) -> ContactFacts {
        let Some(recent) = recent_user_text(history) else {
            debug!("not enough user text for fact extraction");
            return ContactFacts::default();
        };
        match self.try_extract(&recent).await {
            Ok(facts) => facts,
            Err(err) => {
                warn!(error = %err, "fact extraction failed");
                ContactFacts::default()
            }
        }
    }

    async fn try_extract(&self, recent: &str) -> Result<ContactFacts, AgentError> {
        let prompt = format!(
            "You're a smart fact extractor. Read the conversation below and extract the user's:\n\
             - name\n- job\n- hobbies\n- interests\n- location\n- emotion\n- relationship\n- sarcasm\n- bonus notes\n\n\
             ONLY include clearly implied facts. Output valid JSON.\n\nCONVERSATION:\n{recent}"
        );
        let params = CompletionParams { role: ModelRole::Extraction, temperature: 0.2, max_tokens: None };
        let raw = self.model.complete(EXTRACTOR_SYSTEM, &prompt, params).await?;
        parse_facts(&raw)
    }
}

fn recent_user_text(history: &[Message]) -> Option<String> {
    let texts: Vec<&str> = history
        .iter()
        .filter(|m| m.sender == Sender::User)
        .map(|m| m.text.trim())
        .filter(|t| !t.is_empty())
        .collect();
    let start = texts.len().saturating_sub(RECENT_USER_MESSAGES);
    let recent = texts[start..].join("\n");
    (recent.chars().count() >= MIN_SIGNAL_CHARS).then_some(recent)
}

pub fn strip_code_fence(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```") {
        s = rest.strip_prefix("json").or_else(|| rest.strip_prefix("JSON")).unwrap_or(rest);
    }
    if let Some(rest) = s.trim_end().strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Decode model output into lowercased facts. Unknown keys are ignored.
pub fn parse_facts(raw: &str) -> Result<ContactFacts, AgentError> {
    let v: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| AgentError::Decode(format!("facts json: {e}")))?;
    if !v.is_object() {
        return Err(AgentError::Decode("facts json is not an object".into()));
    }
    Ok(ContactFacts {
        name: scalar(&v, "name"),
        job: scalar(&v, "job"),
        location: scalar(&v, "location"),
        hobbies: list(&v, "hobbies"),
        interests: list(&v, "interests"),
        notes: list(&v, "notes").into_iter().chain(list(&v, "bonus_notes")).collect(),
        emotion: scalar(&v, "emotion"),
        relationship: scalar(&v, "relationship"),
        sarcasm: scalar(&v, "sarcasm"),
    })
}

fn as_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_lowercase(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn scalar(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(as_text)
}

fn list(v: &Value, key: &str) -> Vec<String> {
    match v.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(as_text).collect(),
        Some(other) => as_text(other).into_iter().collect(),
        None => Vec::new(),
    }
}
