use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub const EXEMPLARS_PER_REPLY: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    pub input: String,
    pub reply: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExemplarBank {
    items: Vec<Exemplar>,
}

impl ExemplarBank {
    pub fn new(items: Vec<Exemplar>) -> Self {
        Self { items }
    }

    /// JSONL, one `{input, reply}` per line. Bad lines are skipped; a missing file is an empty bank.
    pub async fn load(path: &Path) -> Self {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "example bank unavailable");
                return Self::default();
            }
        };
        let bank = Self::from_jsonl(&raw);
        info!(path = %path.display(), count = bank.len(), "example bank loaded");
        bank
    }

    pub fn from_jsonl(raw: &str) -> Self {
        let items = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Exemplar>(l).ok())
            .collect();
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Exchanges whose input contains any word of `inbound`; the head of the bank when none do.
    pub fn find_relevant(&self, inbound: &str) -> Vec<&Exemplar> {
        let words: Vec<String> = inbound.split_whitespace().map(str::to_lowercase).collect();
        let hits: Vec<&Exemplar> = self
            .items
            .iter()
            .filter(|ex| {
                let input = ex.input.to_lowercase();
                words.iter().any(|w| input.contains(w.as_str()))
            })
            .take(EXEMPLARS_PER_REPLY)
            .collect();
        if hits.is_empty() {
            self.items.iter().take(EXEMPLARS_PER_REPLY).collect()
        } else {
            hits
        }
    }

    pub fn few_shot(&self, inbound: &str) -> String {
        self.find_relevant(inbound)
            .iter()
            .map(|ex| format!("them: {}\nyou: {}", ex.input.to_lowercase(), ex.reply.to_lowercase()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> ExemplarBank {
        let raw = [
            r#"{"input": "what are you doing", "reply": "just chilling hbu"}"#,
            r#"{"input": "Do you like dogs", "reply": "i love dogs"}"#,
            "not json",
            "",
            r#"{"input": "good morning", "reply": "morning sleepyhead"}"#,
        ]
        .join("\n");
        ExemplarBank::from_jsonl(&raw)
    }

    #[test]
    fn skips_malformed_lines() {
        assert_eq!(bank().len(), 3);
    }

    #[test]
    fn matches_on_shared_words() {
        let b = bank();
        let hits = b.find_relevant("DOGS rule");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].reply, "i love dogs");
    }

    #[test]
    fn falls_back_to_head_of_bank() {
        let b = bank();
        let hits = b.find_relevant("zzz");
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].input, "what are you doing");
        assert_eq!(b.find_relevant("").len(), 3);
    }

    #[test]
    fn few_shot_is_lowercased_transcript() {
        let shot = bank().few_shot("dogs");
        assert_eq!(shot, "them: do you like dogs\nyou: i love dogs");
    }

    #[tokio::test]
    async fn missing_file_is_empty_bank() {
        let b = ExemplarBank::load(Path::new("/definitely/not/here.jsonl")).await;
        assert!(b.is_empty());
        assert_eq!(b.few_shot("hey"), "");
    }
}
