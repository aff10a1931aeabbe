use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Sentinel text standing in for an image attachment in a thread.
pub const PHOTO_MARKER: &str = "[photo]";

pub const HISTORY_CAP: usize = 100;

// ========================= Core Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Bot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { text: text.into(), sender: Sender::User, timestamp: None }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self { text: text.into(), sender: Sender::Bot, timestamp: None }
    }

    pub fn is_photo(&self) -> bool {
        self.text.trim() == PHOTO_MARKER
    }

    /// Identity of a message for history dedup: sender plus trimmed, lowercased text.
    pub fn dedup_key(&self) -> (Sender, String) {
        (self.sender, self.text.trim().to_lowercase())
    }
}

/// Normalized per-contact key. Anything that does not look like a handle collapses to `unknown`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(String);

impl ContactId {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(raw: &str) -> Self {
        let t = raw.trim().trim_start_matches('@').to_lowercase();
        let valid = !t.is_empty()
            && t.len() < 30
            && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Self(t)
        } else {
            Self(Self::UNKNOWN.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct ConversationSnapshot {
    pub contact: ContactId,
    pub messages: Vec<Message>,
    pub image_path: Option<PathBuf>,
}

impl ConversationSnapshot {
    pub fn new(contact: ContactId, messages: Vec<Message>) -> Self {
        Self { contact, messages, image_path: None }
    }

    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }

    pub fn user_messages(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.messages.iter().filter(|m| m.sender == Sender::User)
    }

    pub fn last_two_user(&self) -> (Option<&Message>, Option<&Message>) {
        let mut it = self.user_messages().rev();
        let last = it.next();
        let prev = it.next();
        (last, prev)
    }

    pub fn last_text(&self) -> &str {
        self.messages.last().map(|m| m.text.as_str()).unwrap_or("")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastReply {
    pub text: String,
    #[serde(default)]
    pub chunks: Vec<String>,
}

impl LastReply {
    pub fn new(text: &str, chunks: &[String]) -> Self {
        Self { text: text.trim().to_string(), chunks: chunks.to_vec() }
    }

    /// A bot bubble is ours if it shows the whole reply or the last chunk we typed.
    pub fn matches(&self, on_screen: &str) -> bool {
        let shown = on_screen.trim();
        if shown.is_empty() {
            return false;
        }
        shown == self.text.trim()
            || self.chunks.last().map(|c| c.trim() == shown).unwrap_or(false)
    }
}

// ========================= Novelty Guard =========================

/// `false` only when the last bot bubble is our last reply and nothing from the user follows it.
pub fn should_reply(snapshot: &ConversationSnapshot, last_reply: Option<&LastReply>) -> bool {
    let last_bot = snapshot.messages.iter().rposition(|m| m.sender == Sender::Bot);
    let last_user = snapshot.messages.iter().rposition(|m| m.sender == Sender::User);

    let Some(bot_idx) = last_bot else {
        return true;
    };
    let answered = last_user.map(|u| u <= bot_idx).unwrap_or(true);
    let ours = last_reply
        .map(|r| r.matches(&snapshot.messages[bot_idx].text))
        .unwrap_or(false);
    !(answered && ours)
}

// ========================= History Merge =========================

/// Union of `existing` and `incoming` keeping the first occurrence of every key, then the newest
/// `HISTORY_CAP` entries.
pub fn merge_history(existing: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut seen: HashSet<(Sender, String)> = HashSet::new();
    let mut merged: Vec<Message> = existing
        .iter()
        .chain(incoming.iter())
        .filter(|m| seen.insert(m.dedup_key()))
        .cloned()
        .collect();
    if merged.len() > HISTORY_CAP {
        merged.drain(..merged.len() - HISTORY_CAP);
    }
    merged
}
