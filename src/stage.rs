use serde::{Deserialize, Serialize};
use std::fmt;

use crate::conversation::{Message, Sender};

pub const DEFAULT_MARKERS: &[&str] = &[
    "cute", "hot", "kiss", "sexy", "babe", "baby", "gorgeous", "pic", "pics", "ur pretty",
    "you look", "😍", "😏", "🔥", "😉",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Friendly,
    Comfortable,
    Flirty,
}

impl Stage {
    pub fn from_match_count(count: usize) -> Self {
        match count {
            0 => Stage::Friendly,
            1 | 2 => Stage::Comfortable,
            _ => Stage::Flirty,
        }
    }

    /// Tone instruction handed to the model.
    pub fn tone(self) -> &'static str {
        match self {
            Stage::Flirty => "you're cute and playful.",
            Stage::Comfortable => "you're warm and curious.",
            Stage::Friendly => "you're polite and a little shy.",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Friendly => "friendly",
            Stage::Comfortable => "comfortable",
            Stage::Flirty => "flirty",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct StageClassifier {
    markers: Vec<String>,
}

impl Default for StageClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_MARKERS.iter().map(|m| m.to_string()))
    }
}

impl StageClassifier {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let markers = markers
            .into_iter()
            .map(|m| m.into().to_lowercase())
            .filter(|m| !m.trim().is_empty())
            .collect();
        Self { markers }
    }

    pub fn match_count(&self, history: &[Message]) -> usize {
        history
            .iter()
            .filter(|m| m.sender == Sender::User)
            .filter(|m| {
                let text = m.text.to_lowercase();
                self.markers.iter().any(|k| text.contains(k.as_str()))
            })
            .count()
    }

    pub fn classify(&self, history: &[Message]) -> Stage {
        Stage::from_match_count(self.match_count(history))
    }
}
