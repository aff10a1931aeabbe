use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;
use tracing::info;

use crate::agent::{AgentError, CompletionParams, LanguageModel, ModelRole};
use crate::conversation::{ConversationSnapshot, Message, Sender};
use crate::exemplars::ExemplarBank;
use crate::facts::ContactFacts;
use crate::stage::Stage;

pub const DEFAULT_PERSONA: &str = "you are texting casually in your dms.";

static LEADING_YOU: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*you\s*:\s*").expect("static regex"));
static LEADING_THEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(he|she|them)\s*:\s*").expect("static regex"));
static ANY_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(you|he|she|them)\s*:\s*").expect("static regex"));
static RECIPROCAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(hbu|wbu|how about you)\b").expect("static regex"));
static TRAILING_RECIPROCAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(hbu|wbu|how about you)[?.! ]*$").expect("static regex"));
static INTERROGATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(do|does|are|what|why|how|where)\b").expect("static regex"));

// ========================= Dispatch =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyPath<'a> {
    PhotoOnly { image: &'a Path },
    PhotoWithCaption { image: &'a Path, caption: &'a str },
    TextOnly,
}

impl ReplyPath<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            ReplyPath::PhotoOnly { .. } => "photo_only",
            ReplyPath::PhotoWithCaption { .. } => "photo_with_caption",
            ReplyPath::TextOnly => "text_only",
        }
    }
}

impl fmt::Display for ReplyPath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// PhotoOnly beats PhotoWithCaption beats TextOnly. Photo paths need a captured image.
pub fn select_path(snapshot: &ConversationSnapshot) -> ReplyPath<'_> {
    let (last, prev) = snapshot.last_two_user();
    let Some(image) = snapshot.image_path.as_deref() else {
        return ReplyPath::TextOnly;
    };
    match (last, prev) {
        (Some(last), _) if last.is_photo() => ReplyPath::PhotoOnly { image },
        (Some(last), Some(prev)) if prev.is_photo() => ReplyPath::PhotoWithCaption {
            image,
            caption: last.text.as_str(),
        },
        _ => ReplyPath::TextOnly,
    }
}

pub fn history_window(user_turns: usize) -> usize {
    if user_turns > 40 {
        30
    } else if user_turns > 20 {
        20
    } else {
        10
    }
}

/// Tail of the merged history, sized by engagement. The newest on-screen message is always last.
pub fn context_window(history: &[Message], snapshot: &ConversationSnapshot) -> Vec<Message> {
    let turns = history.iter().filter(|m| m.sender == Sender::User).count();
    let depth = history_window(turns);
    let mut window: Vec<Message> = history[history.len().saturating_sub(depth)..].to_vec();
    if let Some(newest) = snapshot.messages.last() {
        let present = window.last().map(|m| m.dedup_key() == newest.dedup_key()).unwrap_or(false);
        if !present {
            if window.len() >= depth {
                window.remove(0);
            }
            window.push(newest.clone());
        }
    }
    window
}

fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| match m.sender {
            Sender::User => format!("them: {}", m.text.to_lowercase()),
            Sender::Bot => format!("you: {}", m.text.to_lowercase()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ========================= Generation =========================

pub struct ReplyContext<'a> {
    pub snapshot: &'a ConversationSnapshot,
    pub history: &'a [Message],
    pub stage: Stage,
    pub facts: &'a ContactFacts,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedReply {
    pub path: &'static str,
    pub text: String,
}

pub struct ReplyGenerator<'a, L: LanguageModel + ?Sized> {
    model: &'a L,
    exemplars: &'a ExemplarBank,
    persona: &'a str,
}

impl<'a, L: LanguageModel + ?Sized> ReplyGenerator<'a, L> {
    pub fn new(model: &'a L, exemplars: &'a ExemplarBank, persona: &'a str) -> Self {
        Self { model, exemplars, persona }
    }

    pub async fn generate(&self, ctx: &ReplyContext<'_>) -> Result<GeneratedReply, AgentError> {
        let path = select_path(ctx.snapshot);
        info!(contact = %ctx.snapshot.contact, path = %path, stage = %ctx.stage, "generating reply");
        let text = match path {
            ReplyPath::PhotoOnly { image } => self.photo_reply(image, ctx).await?,
            ReplyPath::PhotoWithCaption { image, caption } => {
                self.captioned_photo_reply(image, caption, ctx).await?
            }
            ReplyPath::TextOnly => self.text_reply(ctx).await?,
        };
        if text.trim().is_empty() {
            return Err(AgentError::Model("empty reply".into()));
        }
        Ok(GeneratedReply { path: path.label(), text })
    }

    async fn photo_reply(&self, image: &Path, ctx: &ReplyContext<'_>) -> Result<String, AgentError> {
        let system = format!(
            "{} {} you're texting back after seeing a photo.\n\
             1) name what the image actually shows (\"that's a ps5 controller\")\n\
             2) react casually (\"that's cool!\")\n\
             3) relate to yourself or ask a light follow-up (\"i've always wanted to try one\")\n\
             always keep it lowercase, short, and playful.",
            self.persona,
            ctx.stage.tone()
        );
        let params = CompletionParams { role: ModelRole::Chat, temperature: 0.7, max_tokens: Some(60) };
        let raw = self.model.complete_vision(&system, image, None, params).await?;
        Ok(sanitize_photo_reply(&raw, ""))
    }

    async fn captioned_photo_reply(
        &self,
        image: &Path,
        caption: &str,
        ctx: &ReplyContext<'_>,
    ) -> Result<String, AgentError> {
        let system = format!(
            "{} {} you're texting back after seeing a photo with a caption.\n\
             1) name the image (\"that's a ps5 controller\")\n\
             2) react to the caption (\"you watch sunsets when you're lonely? that's poetic.\")\n\
             3) relate or follow-up (\"where's your favorite spot?\")\n\
             keep it lowercase, short, playful.",
            self.persona,
            ctx.stage.tone()
        );
        let params = CompletionParams { role: ModelRole::Chat, temperature: 0.7, max_tokens: Some(100) };
        let raw = self.model.complete_vision(&system, image, Some(caption), params).await?;
        Ok(sanitize_photo_reply(&raw, caption))
    }

    async fn text_reply(&self, ctx: &ReplyContext<'_>) -> Result<String, AgentError> {
        let (last, _) = ctx.snapshot.last_two_user();
        let inbound = last.map(|m| m.text.as_str()).unwrap_or_else(|| ctx.snapshot.last_text());

        let few = self.exemplars.few_shot(inbound);
        let window = context_window(ctx.history, ctx.snapshot);
        let mut user = String::new();
        if !few.is_empty() {
            user.push_str(&few);
            user.push_str("\n\n");
        }
        if !ctx.facts.is_empty() {
            user.push_str("what you know about them:\n");
            user.push_str(&ctx.facts.summary());
            user.push_str("\n\n");
        }
        user.push_str(&transcript(&window));

        let system = format!("{} {} use lowercase and keep it short.", self.persona, ctx.stage.tone());
        let params = CompletionParams { role: ModelRole::Chat, temperature: 0.9, max_tokens: Some(100) };
        let raw = self.model.complete(&system, &user, params).await?;
        Ok(sanitize_reply(&raw, inbound))
    }
}

// ========================= Sanitizing =========================

pub fn sanitize_reply(raw: &str, inbound: &str) -> String {
    let trimmed = raw.trim();
    let without_you = LEADING_YOU.replace(trimmed, "");
    let mut reply = LEADING_THEM.replace(&without_you, "").trim().to_string();

    if RECIPROCAL.is_match(inbound) {
        reply = TRAILING_RECIPROCAL.replace(&reply, "").trim().to_string();
    }

    reply = collapse_doubled(&reply);
    ensure_question_mark(&reply)
}

/// Photo replies may carry speaker tags anywhere and are always lowercase.
pub fn sanitize_photo_reply(raw: &str, inbound: &str) -> String {
    let unlabeled = ANY_LABEL.replace_all(raw.trim(), "");
    sanitize_reply(&unlabeled.to_lowercase(), inbound)
}

const STUTTERED: &[&str] = &["you"];

fn core(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()
}

fn ends_sentence(word: &str) -> bool {
    word.ends_with(|c: char| matches!(c, '.' | '!' | '?'))
}

/// `you you` becomes `you`, `hiking and hiking` becomes `hiking`. Never across a sentence end.
pub fn collapse_doubled(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        let c = core(word);
        if c.is_empty() {
            out.push(word);
            continue;
        }
        if let Some(last) = out.last_mut() {
            if !ends_sentence(last) && core(last) == c && STUTTERED.contains(&c.as_str()) {
                *last = word;
                continue;
            }
        }
        let n = out.len();
        if n >= 2
            && core(out[n - 1]) == "and"
            && !ends_sentence(out[n - 1])
            && !ends_sentence(out[n - 2])
            && core(out[n - 2]) == c
        {
            out.pop();
            if let Some(last) = out.last_mut() {
                *last = word;
            }
            continue;
        }
        out.push(word);
    }
    out.join(" ")
}

fn ensure_question_mark(reply: &str) -> String {
    if !INTERROGATIVE.is_match(reply) || reply.ends_with('?') {
        return reply.to_string();
    }
    let body = reply.trim_end_matches(|c: char| matches!(c, '.' | '!' | ' '));
    format!("{body}?")
}
