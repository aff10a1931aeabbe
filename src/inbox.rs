use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static AGE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*([mhd])").expect("static regex"));

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPreview {
    pub index: usize,
    #[serde(default)]
    pub preview_text: Option<String>,
    #[serde(default)]
    pub has_photo: bool,
    #[serde(default)]
    pub unread: bool,
    /// Raw age label such as `5m` or `2h`.
    #[serde(default)]
    pub age: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Empty,
    Read,
    TooOld { minutes: u32 },
}

impl Eligibility {
    pub fn is_eligible(self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

pub fn parse_minutes_ago(label: &str) -> Option<u32> {
    let caps = AGE_TOKEN.captures(label)?;
    // all digits, so the only parse failure is overflow
    let n: u64 = caps[1].parse().unwrap_or(u64::MAX);
    let minutes = match &caps[2] {
        "m" => n,
        "h" => n.saturating_mul(60),
        _ => n.saturating_mul(1440),
    };
    Some(u32::try_from(minutes).unwrap_or(u32::MAX))
}

/// Unknown age never disqualifies; a known age over `max_age_minutes` does.
pub fn check_eligibility(preview: &ConversationPreview, max_age_minutes: u32) -> Eligibility {
    let has_text = preview
        .preview_text
        .as_deref()
        .map(|t| !t.trim().is_empty())
        .unwrap_or(false);
    if !has_text && !preview.has_photo {
        return Eligibility::Empty;
    }
    if !preview.unread {
        return Eligibility::Read;
    }
    match preview.age.as_deref().and_then(parse_minutes_ago) {
        Some(minutes) if minutes > max_age_minutes => Eligibility::TooOld { minutes },
        _ => Eligibility::Eligible,
    }
}
