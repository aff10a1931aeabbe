use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::facts::ScalarPolicy;
use crate::reply::DEFAULT_PERSONA;
use crate::stage::DEFAULT_MARKERS;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxSelectors {
    pub conversation: String,
    pub preview_text: String,
    pub preview_photo: String,
    pub preview_time: String,
    /// Computed `color` of an unread preview.
    pub unread_color: String,
    pub message_row: String,
    pub message_text: String,
    /// Class fragment present on rows we sent.
    pub own_message_class: String,
    pub message_image: String,
    pub avatar_testid: String,
    pub username: String,
    pub textbox: String,
}

impl Default for InboxSelectors {
    fn default() -> Self {
        Self {
            conversation: r#"div[data-testid="conversation"]"#.into(),
            preview_text: r#"span[data-testid="tweetText"]"#.into(),
            preview_photo: "span.css-1jxf684".into(),
            preview_time: "time".into(),
            unread_color: "rgb(231, 233, 234)".into(),
            message_row: r#"div[role="presentation"]"#.into(),
            message_text: r#"div[data-testid="tweetText"], div[dir="auto"]"#.into(),
            own_message_class: "r-vhj8yc".into(),
            message_image: r#"[data-testid="image"] img"#.into(),
            avatar_testid: "DM_Conversation_Avatar".into(),
            username: "h2#detail-header span".into(),
            textbox: r#"div[role="textbox"]"#.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub api_base: String,
    pub profile_id: String,
    pub headless: bool,
    /// Connect straight to this DevTools endpoint instead of starting a profile.
    pub ws_endpoint: Option<String>,
    pub inbox_url: String,
    pub viewport: (u32, u32),
    pub poll_interval_secs: u64,
    pub max_age_minutes: u32,
    pub chunk_delay_ms: u64,
    pub element_timeout_ms: u64,
    pub data_dir: PathBuf,
    pub examples_file: PathBuf,
    pub persona: String,
    pub stage_markers: Vec<String>,
    /// Thread rows whose text contains any of these are not messages (buttons, labels).
    pub ignored_fragments: Vec<String>,
    pub scalar_policy: ScalarPolicy,
    pub selectors: InboxSelectors,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:50325".into(),
            profile_id: String::new(),
            headless: false,
            ws_endpoint: None,
            inbox_url: "https://x.com/messages".into(),
            viewport: (1400, 900),
            poll_interval_secs: 30,
            max_age_minutes: 30,
            chunk_delay_ms: 1000,
            element_timeout_ms: 10_000,
            data_dir: PathBuf::from("."),
            examples_file: PathBuf::from("./rag/examples.jsonl"),
            persona: DEFAULT_PERSONA.into(),
            stage_markers: DEFAULT_MARKERS.iter().map(|m| m.to_string()).collect(),
            ignored_fragments: Vec::new(),
            scalar_policy: ScalarPolicy::default(),
            selectors: InboxSelectors::default(),
        }
    }
}

impl BotConfig {
    pub fn load() -> Result<Self> {
        let path = env::var("DM_PILOT_CONFIG").map(PathBuf::from).ok();
        let mut cfg = match path {
            Some(p) => Self::from_file(&p)?,
            None if Path::new("config.json").exists() => Self::from_file(Path::new("config.json"))?,
            None => Self::default(),
        };
        cfg.apply_env(|k| env::var(k).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |k: &str| get(k).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("ADSPOWER_PROFILE_ID") {
            self.profile_id = v;
        }
        if let Some(v) = non_empty("ADSPOWER_API_BASE") {
            self.api_base = v;
        }
        if let Some(v) = non_empty("CHROME_WS_URL") {
            self.ws_endpoint = Some(v);
        }
        if let Some(v) = non_empty("DM_PILOT_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
    }

    /// Missing identifiers are fatal before any cycle runs.
    pub fn validate(&self) -> Result<()> {
        let has_ws = self.ws_endpoint.as_deref().map(|w| !w.trim().is_empty()).unwrap_or(false);
        if self.profile_id.trim().is_empty() && !has_ws {
            bail!("profile_id missing (set ADSPOWER_PROFILE_ID or CHROME_WS_URL)");
        }
        if self.inbox_url.trim().is_empty() {
            bail!("inbox_url missing");
        }
        if self.viewport.0 == 0 || self.viewport.1 == 0 {
            bail!("viewport must be non-zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_need_an_identifier() {
        let cfg = BotConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = BotConfig::from_json(r#"{"profile_id": "k12m7j0v", "max_age_minutes": 15, "selectors": {"textbox": "textarea"}}"#).unwrap();
        assert_eq!(cfg.profile_id, "k12m7j0v");
        assert_eq!(cfg.max_age_minutes, 15);
        assert_eq!(cfg.poll_interval_secs, 30);
        assert_eq!(cfg.selectors.textbox, "textarea");
        assert_eq!(cfg.selectors.conversation, InboxSelectors::default().conversation);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = BotConfig::from_json(r#"{"profile_id": "from_file"}"#).unwrap();
        let env: HashMap<&str, &str> = [("ADSPOWER_PROFILE_ID", "from_env"), ("CHROME_WS_URL", "  ")].into();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.profile_id, "from_env");
        assert!(cfg.ws_endpoint.is_none());
    }

    #[test]
    fn ws_endpoint_alone_is_enough() {
        let mut cfg = BotConfig::default();
        cfg.apply_env(|k| (k == "CHROME_WS_URL").then(|| "ws://127.0.0.1:9222/devtools/browser/x".to_string()));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_scalar_policy_is_rejected() {
        assert!(BotConfig::from_json(r#"{"scalar_policy": "sometimes"}"#).is_err());
        let cfg = BotConfig::from_json(r#"{"scalar_policy": "latest_wins"}"#).unwrap();
        assert_eq!(cfg.scalar_policy, ScalarPolicy::LatestWins);
    }
}
