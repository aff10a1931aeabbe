use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs as async_fs;
use tracing::{debug, error, info, warn};

use crate::browser::Browser;
use crate::chunker::prepare_chunks;
use crate::config::{BotConfig, InboxSelectors};
use crate::conversation::{
    merge_history, should_reply, ContactId, ConversationSnapshot, LastReply, Message, Sender,
    PHOTO_MARKER,
};
use crate::exemplars::ExemplarBank;
use crate::facts::{ContactFacts, FactExtractor, ScalarPolicy};
use crate::inbox::{check_eligibility, ConversationPreview};
use crate::reply::{ReplyContext, ReplyGenerator};
use crate::stage::StageClassifier;

// ========================= Core Types =========================

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("driver error: {0}")]
    Driver(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("memory error: {0}")]
    Memory(String),
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Chat,
    Extraction,
}

#[derive(Clone, Copy, Debug)]
pub struct CompletionParams {
    pub role: ModelRole,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct VisibleThread {
    pub messages: Vec<Message>,
    pub image_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    Idle,
    Replied {
        contact: ContactId,
        path: String,
        reply: LastReply,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub inspected: usize,
    pub eligible: usize,
    pub already_answered: usize,
    pub outcome: CycleOutcome,
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Inbox: Send + Sync {
    async fn open_inbox(&self) -> Result<(), AgentError>;
    async fn conversation_previews(&self) -> Result<Vec<ConversationPreview>, AgentError>;
    async fn open_conversation(&self, preview: &ConversationPreview) -> Result<(), AgentError>;
    async fn extract_visible_messages(&self) -> Result<VisibleThread, AgentError>;
    /// Handle of the open conversation, or `unknown`.
    async fn current_username(&self) -> String;
    async fn send_text_chunk(&self, text: &str) -> Result<(), AgentError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        params: CompletionParams,
    ) -> Result<String, AgentError>;

    async fn complete_vision(
        &self,
        system: &str,
        image: &Path,
        caption: Option<&str>,
        params: CompletionParams,
    ) -> Result<String, AgentError>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn load_history(&self, contact: &ContactId) -> Result<Vec<Message>, AgentError>;
    async fn merge_and_save_history(
        &self,
        contact: &ContactId,
        new_messages: &[Message],
    ) -> Result<Vec<Message>, AgentError>;
    async fn load_facts(&self, contact: &ContactId) -> Result<ContactFacts, AgentError>;
    async fn merge_and_save_facts(
        &self,
        contact: &ContactId,
        partial: &ContactFacts,
        policy: ScalarPolicy,
    ) -> Result<ContactFacts, AgentError>;
    async fn load_last_reply(&self) -> Result<Option<LastReply>, AgentError>;
    async fn save_last_reply(&self, reply: &LastReply) -> Result<(), AgentError>;
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_age_minutes: u32,
    pub chunk_delay: Duration,
    pub poll_interval: Duration,
    pub persona: String,
    pub scalar_policy: ScalarPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from(&BotConfig::default())
    }
}

impl From<&BotConfig> for AgentConfig {
    fn from(cfg: &BotConfig) -> Self {
        Self {
            max_age_minutes: cfg.max_age_minutes,
            chunk_delay: cfg.chunk_delay(),
            poll_interval: cfg.poll_interval(),
            persona: cfg.persona.clone(),
            scalar_policy: cfg.scalar_policy,
        }
    }
}

pub struct Agent<I, L, M>
where
    I: Inbox,
    L: LanguageModel,
    M: MemoryStore,
{
    inbox: I,
    model: L,
    memory: M,
    cfg: AgentConfig,
    classifier: StageClassifier,
    exemplars: ExemplarBank,
}

impl<I, L, M> Agent<I, L, M>
where
    I: Inbox,
    L: LanguageModel,
    M: MemoryStore,
{
    pub fn new(inbox: I, model: L, memory: M, cfg: AgentConfig) -> Self {
        Self {
            inbox,
            model,
            memory,
            cfg,
            classifier: StageClassifier::default(),
            exemplars: ExemplarBank::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: StageClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_exemplars(mut self, exemplars: ExemplarBank) -> Self {
        self.exemplars = exemplars;
        self
    }

    pub fn inbox(&self) -> &I {
        &self.inbox
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub async fn run(&self) {
        let mut last_reply = match self.memory.load_last_reply().await {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "could not load last reply; starting without one");
                None
            }
        };
        loop {
            if let Err(err) = self.step(&mut last_reply).await {
                error!(error = %err, "cycle failed");
            }
            debug!(secs = self.cfg.poll_interval.as_secs(), "sleeping");
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    pub async fn step(&self, last_reply: &mut Option<LastReply>) -> Result<CycleReport, AgentError> {
        let report = self.run_cycle(last_reply.as_ref()).await?;
        match &report.outcome {
            CycleOutcome::Replied { contact, reply, .. } => {
                if let Err(err) = self.memory.save_last_reply(reply).await {
                    warn!(contact = %contact, error = %err, "could not persist last reply");
                }
                *last_reply = Some(reply.clone());
                info!(cycle = %report.cycle_id, contact = %contact, "replied successfully");
            }
            CycleOutcome::Idle => {
                info!(cycle = %report.cycle_id, inspected = report.inspected, "no unread messages found");
            }
        }
        Ok(report)
    }

    /// Scan the inbox and answer at most one conversation.
    pub async fn run_cycle(&self, last_reply: Option<&LastReply>) -> Result<CycleReport, AgentError> {
        let cycle_id = nanoid!();
        self.inbox.open_inbox().await?;
        let previews = self.inbox.conversation_previews().await?;
        let mut report = CycleReport {
            cycle_id,
            inspected: previews.len(),
            eligible: 0,
            already_answered: 0,
            outcome: CycleOutcome::Idle,
        };

        for preview in &previews {
            let verdict = check_eligibility(preview, self.cfg.max_age_minutes);
            if !verdict.is_eligible() {
                debug!(index = preview.index, verdict = ?verdict, "preview skipped");
                continue;
            }
            report.eligible += 1;
            info!(cycle = %report.cycle_id, index = preview.index, "opening conversation");
            self.inbox.open_conversation(preview).await?;

            let thread = self.inbox.extract_visible_messages().await?;
            let username = self.inbox.current_username().await;
            let mut snapshot = ConversationSnapshot::new(ContactId::new(&username), thread.messages);
            snapshot.image_path = thread.image_path;
            info!(contact = %snapshot.contact, messages = snapshot.messages.len(), "conversation read");

            if !should_reply(&snapshot, last_reply) {
                info!(contact = %snapshot.contact, "no new user message since last reply");
                report.already_answered += 1;
                discard_image(&snapshot).await;
                continue;
            }

            let outcome = self.respond(&snapshot).await;
            discard_image(&snapshot).await;
            report.outcome = outcome?;
            return Ok(report);
        }
        Ok(report)
    }

    async fn respond(&self, snapshot: &ConversationSnapshot) -> Result<CycleOutcome, AgentError> {
        let contact = &snapshot.contact;
        info!(contact = %contact, "new user message detected");

        let saved = self.memory.load_history(contact).await.unwrap_or_else(|err| {
            warn!(contact = %contact, error = %err, "history unavailable");
            Vec::new()
        });
        let history = merge_history(&saved, &snapshot.messages);

        let stage = self.classifier.classify(&snapshot.messages);
        let facts = self.update_facts(contact, &snapshot.messages).await;

        let generator = ReplyGenerator::new(&self.model, &self.exemplars, &self.cfg.persona);
        let ctx = ReplyContext { snapshot, history: &history, stage, facts: &facts };
        let generated = generator.generate(&ctx).await?;

        let chunks = prepare_chunks(&generated.text);
        if chunks.is_empty() {
            return Err(AgentError::Model(format!("nothing sendable in reply {:?}", generated.text)));
        }
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.cfg.chunk_delay).await;
            }
            self.inbox.send_text_chunk(chunk).await?;
            debug!(contact = %contact, chunk = i, "chunk sent");
        }

        if let Err(err) = self.memory.merge_and_save_history(contact, &snapshot.messages).await {
            warn!(contact = %contact, error = %err, "could not persist history");
        }
        info!(contact = %contact, path = generated.path, chunks = chunks.len(), stage = %stage, "reply sent");
        Ok(CycleOutcome::Replied {
            contact: contact.clone(),
            path: generated.path.to_string(),
            reply: LastReply::new(&generated.text, &chunks),
        })
    }

    async fn update_facts(&self, contact: &ContactId, messages: &[Message]) -> ContactFacts {
        let extracted = FactExtractor::new(&self.model).extract(messages).await;
        if !extracted.is_empty() {
            match self
                .memory
                .merge_and_save_facts(contact, &extracted, self.cfg.scalar_policy)
                .await
            {
                Ok(facts) => return facts,
                Err(err) => warn!(contact = %contact, error = %err, "could not persist facts"),
            }
        }
        self.memory.load_facts(contact).await.unwrap_or_default()
    }
}

async fn discard_image(snapshot: &ConversationSnapshot) {
    if let Some(path) = &snapshot.image_path {
        if let Err(err) = async_fs::remove_file(path).await {
            debug!(path = %path.display(), error = %err, "could not remove captured photo");
        }
    }
}

// ========================= Chromium Adapter =========================

const CAPTURE_ATTR: &str = "data-dm-pilot-photo";

#[derive(Debug, Deserialize)]
struct RawThread {
    messages: Vec<RawMessage>,
    #[serde(default)]
    user_photo: bool,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    text: String,
    mine: bool,
}

pub struct ChromiumInbox {
    browser: Browser,
    selectors: InboxSelectors,
    inbox_url: String,
    ignored_fragments: Vec<String>,
    capture_dir: PathBuf,
    element_timeout: Duration,
}

impl ChromiumInbox {
    pub async fn connect(ws_url: &str, cfg: &BotConfig) -> Result<Self, AgentError> {
        if ws_url.trim().is_empty() {
            return Err(AgentError::Config("empty websocket endpoint".into()));
        }
        let browser = Browser::connect(ws_url, cfg.viewport)
            .await
            .map_err(|e| AgentError::Driver(e.to_string()))?;
        Ok(Self {
            browser,
            selectors: cfg.selectors.clone(),
            inbox_url: cfg.inbox_url.clone(),
            ignored_fragments: cfg.ignored_fragments.clone(),
            capture_dir: cfg.data_dir.join("temp"),
            element_timeout: cfg.element_timeout(),
        })
    }

    fn js_str(s: &str) -> String {
        serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
    }

    fn is_ignored(&self, text: &str) -> bool {
        self.ignored_fragments.iter().any(|f| !f.is_empty() && text.contains(f.as_str()))
    }

    pub async fn capture_image(&self) -> Result<PathBuf, AgentError> {
        let selector = format!("[{CAPTURE_ATTR}]");
        if let Err(err) = self
            .browser
            .evaluate::<bool>(
                "(() => { const s = document.createElement('style'); \
                 s.innerHTML = '* { transition: none !important; animation: none !important; }'; \
                 document.head.appendChild(s); return true; })()",
            )
            .await
        {
            debug!(error = %err, "could not disable page animations");
        }
        let bytes = self
            .browser
            .screenshot_element(&selector)
            .await
            .map_err(|e| AgentError::Driver(format!("photo capture: {e}")))?;
        async_fs::create_dir_all(&self.capture_dir)
            .await
            .map_err(|e| AgentError::Memory(format!("create_dir: {e}")))?;
        let path = self.capture_dir.join(format!("{}-photo.jpg", nanoid!()));
        async_fs::write(&path, &bytes)
            .await
            .map_err(|e| AgentError::Memory(format!("write: {e}")))?;
        info!(path = %path.display(), "captured message photo");
        Ok(path)
    }
}

#[async_trait]
impl Inbox for ChromiumInbox {
    async fn open_inbox(&self) -> Result<(), AgentError> {
        info!(url = %self.inbox_url, "navigating to inbox");
        self.browser
            .goto(&self.inbox_url)
            .await
            .map_err(|e| AgentError::Driver(e.to_string()))?;
        self.browser.wait_for_stable(Duration::from_millis(1000)).await;
        Ok(())
    }

    async fn conversation_previews(&self) -> Result<Vec<ConversationPreview>, AgentError> {
        let s = &self.selectors;
        let js = format!(
            r#"(() => {{
                const rows = Array.from(document.querySelectorAll({conv}));
                return rows.map((row, index) => {{
                    const text = row.querySelector({text});
                    const photo = row.querySelector({photo});
                    const el = text || photo;
                    const time = row.querySelector({time});
                    return {{
                        index,
                        preview_text: text ? (text.innerText || '').trim() : null,
                        has_photo: !!photo,
                        unread: el ? window.getComputedStyle(el).color === {unread} : false,
                        age: time ? (time.textContent || '').trim() : null,
                    }};
                }});
            }})()"#,
            conv = Self::js_str(&s.conversation),
            text = Self::js_str(&s.preview_text),
            photo = Self::js_str(&s.preview_photo),
            time = Self::js_str(&s.preview_time),
            unread = Self::js_str(&s.unread_color),
        );
        self.browser
            .evaluate::<Vec<ConversationPreview>>(&js)
            .await
            .map_err(|e| AgentError::Driver(format!("previews: {e}")))
    }

    async fn open_conversation(&self, preview: &ConversationPreview) -> Result<(), AgentError> {
        let rows = self
            .browser
            .find_all(&self.selectors.conversation)
            .await
            .map_err(|e| AgentError::Driver(e.to_string()))?;
        let row = rows
            .get(preview.index)
            .ok_or_else(|| AgentError::NotFound(format!("conversation row {}", preview.index)))?;
        self.browser
            .open_element(row)
            .await
            .map_err(|e| AgentError::Driver(format!("open conversation: {e}")))?;

        let body = self
            .selectors
            .message_text
            .split(',')
            .map(|sel| format!("{} {}", self.selectors.message_row, sel.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let found = self
            .browser
            .wait_for(&body, self.element_timeout)
            .await
            .map_err(|e| AgentError::Driver(e.to_string()))?;
        if found.is_none() {
            return Err(AgentError::NotFound(format!("message list ({body})")));
        }
        self.browser.wait_for_stable(Duration::from_millis(1000)).await;
        Ok(())
    }

    async fn extract_visible_messages(&self) -> Result<VisibleThread, AgentError> {
        let s = &self.selectors;
        // Tags the newest inbound photo so it can be screenshotted afterwards.
        let js = format!(
            r#"(() => {{
                const attr = {attr};
                document.querySelectorAll('[' + attr + ']').forEach(e => e.removeAttribute(attr));
                const rows = Array.from(document.querySelectorAll({row}));
                const isMine = (row) => String(row.className || '').includes({own});
                const photos = Array.from(document.querySelectorAll({img})).filter(img => {{
                    if (img.closest('[data-testid=' + JSON.stringify({avatar}) + ']')) return false;
                    const r = img.getBoundingClientRect();
                    return r.width >= 100 && r.height >= 100 && img.complete && img.naturalWidth > 0 && img.naturalHeight > 0;
                }});
                let pick = null;
                for (const img of photos) {{
                    const row = rows.find(r => r.contains(img));
                    if (row && !isMine(row)) pick = img;
                }}
                const messages = [];
                for (const row of rows) {{
                    const mine = isMine(row);
                    if (pick && row.contains(pick)) {{
                        messages.push({{ text: {marker}, mine }});
                    }}
                    const t = row.querySelector({text});
                    const text = t ? (t.innerText || '').trim() : '';
                    if (text) messages.push({{ text, mine }});
                }}
                if (pick) pick.setAttribute(attr, '1');
                return {{ messages, user_photo: !!pick }};
            }})()"#,
            attr = Self::js_str(CAPTURE_ATTR),
            row = Self::js_str(&s.message_row),
            own = Self::js_str(&s.own_message_class),
            img = Self::js_str(&s.message_image),
            avatar = Self::js_str(&s.avatar_testid),
            marker = Self::js_str(PHOTO_MARKER),
            text = Self::js_str(&s.message_text),
        );
        let raw = self
            .browser
            .evaluate::<RawThread>(&js)
            .await
            .map_err(|e| AgentError::Driver(format!("thread: {e}")))?;

        let messages: Vec<Message> = raw
            .messages
            .into_iter()
            .filter(|m| !self.is_ignored(&m.text))
            .map(|m| Message {
                text: m.text,
                sender: if m.mine { Sender::Bot } else { Sender::User },
                timestamp: None,
            })
            .collect();
        debug!(count = messages.len(), user_photo = raw.user_photo, "thread extracted");

        let image_path = if raw.user_photo {
            match self.capture_image().await {
                Ok(p) => Some(p),
                Err(err) => {
                    warn!(error = %err, "failed to capture photo; replying to text only");
                    None
                }
            }
        } else {
            None
        };
        Ok(VisibleThread { messages, image_path })
    }

    async fn current_username(&self) -> String {
        let probe = self
            .browser
            .wait_for(&self.selectors.username, Duration::from_millis(5000))
            .await;
        if !matches!(probe, Ok(Some(_))) {
            return ContactId::UNKNOWN.to_string();
        }
        let js = format!(
            r#"(() => Array.from(document.querySelectorAll({sel})).map(s => (s.textContent || '').trim()))()"#,
            sel = Self::js_str(&self.selectors.username),
        );
        let spans = self.browser.evaluate::<Vec<String>>(&js).await.unwrap_or_default();
        spans
            .iter()
            .map(|s| ContactId::new(s))
            .find(|c| !c.is_unknown())
            .map(|c| c.as_str().to_string())
            .unwrap_or_else(|| ContactId::UNKNOWN.to_string())
    }

    async fn send_text_chunk(&self, text: &str) -> Result<(), AgentError> {
        let textbox = self
            .browser
            .wait_for(&self.selectors.textbox, self.element_timeout)
            .await
            .map_err(|e| AgentError::Driver(e.to_string()))?
            .ok_or_else(|| AgentError::NotFound(format!("textbox ({})", self.selectors.textbox)))?;
        self.browser
            .type_into(&textbox, text)
            .await
            .map_err(|e| AgentError::Driver(format!("send: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeInbox {
        previews: Vec<ConversationPreview>,
        // (username, thread) per preview index
        threads: Arc<Mutex<Vec<(String, Vec<Message>)>>>,
        current: Arc<Mutex<usize>>,
        image: Option<PathBuf>,
        sent: Arc<Mutex<Vec<String>>>,
        opened: Arc<Mutex<Vec<usize>>>,
        fail_send: bool,
    }

    impl FakeInbox {
        fn with_thread(messages: Vec<Message>) -> Self {
            Self::with_threads(vec![("Alex_99", messages)])
        }

        fn with_threads(threads: Vec<(&str, Vec<Message>)>) -> Self {
            let previews = (0..threads.len())
                .map(|index| ConversationPreview {
                    index,
                    preview_text: Some("hey".into()),
                    has_photo: false,
                    unread: true,
                    age: Some("2m".into()),
                })
                .collect();
            let threads = threads.into_iter().map(|(u, m)| (u.to_string(), m)).collect();
            Self { previews, threads: Arc::new(Mutex::new(threads)), ..Default::default() }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        fn opened(&self) -> Vec<usize> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Inbox for FakeInbox {
        async fn open_inbox(&self) -> Result<(), AgentError> {
            Ok(())
        }

        async fn conversation_previews(&self) -> Result<Vec<ConversationPreview>, AgentError> {
            Ok(self.previews.clone())
        }

        async fn open_conversation(&self, preview: &ConversationPreview) -> Result<(), AgentError> {
            self.opened.lock().unwrap().push(preview.index);
            *self.current.lock().unwrap() = preview.index;
            Ok(())
        }

        async fn extract_visible_messages(&self) -> Result<VisibleThread, AgentError> {
            let idx = *self.current.lock().unwrap();
            let messages = self.threads.lock().unwrap()[idx].1.clone();
            Ok(VisibleThread { messages, image_path: self.image.clone() })
        }

        async fn current_username(&self) -> String {
            let idx = *self.current.lock().unwrap();
            self.threads.lock().unwrap()[idx].0.clone()
        }

        async fn send_text_chunk(&self, text: &str) -> Result<(), AgentError> {
            if self.fail_send {
                return Err(AgentError::NotFound("textbox".into()));
            }
            let idx = *self.current.lock().unwrap();
            self.sent.lock().unwrap().push(text.to_string());
            self.threads.lock().unwrap()[idx].1.push(Message::bot(text));
            Ok(())
        }
    }

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, AgentError>>>,
        facts: String,
        vision_calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, AgentError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                facts: r#"{"name": "Alex", "hobbies": ["Climbing"]}"#.into(),
                vision_calls: Mutex::new(0),
            }
        }

        fn next(&self) -> Result<String, AgentError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::Model("script exhausted".into())))
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _system: &str, _user: &str, params: CompletionParams) -> Result<String, AgentError> {
            match params.role {
                ModelRole::Extraction => Ok(self.facts.clone()),
                ModelRole::Chat => self.next(),
            }
        }

        async fn complete_vision(
            &self,
            _system: &str,
            _image: &Path,
            _caption: Option<&str>,
            _params: CompletionParams,
        ) -> Result<String, AgentError> {
            *self.vision_calls.lock().unwrap() += 1;
            self.next()
        }
    }

    fn quick_cfg() -> AgentConfig {
        AgentConfig { chunk_delay: Duration::from_millis(0), ..AgentConfig::default() }
    }

    #[tokio::test]
    async fn replies_once_and_then_stays_quiet() {
        let inbox = FakeInbox::with_thread(vec![Message::user("hey, i'm alex and i love climbing")]);
        let model = ScriptedModel::new(vec![Ok("you: hey alex. what do you climb".into())]);
        let agent = Agent::new(inbox.clone(), model, InMemoryStore::default(), quick_cfg());

        let mut marker = None;
        let first = agent.step(&mut marker).await.unwrap();
        match &first.outcome {
            CycleOutcome::Replied { contact, path, reply } => {
                assert_eq!(contact.as_str(), "alex_99");
                assert_eq!(path, "text_only");
                assert_eq!(reply.text, "hey alex. what do you climb");
                assert_eq!(reply.chunks, vec!["hey alex".to_string(), "what do you climb".to_string()]);
            }
            other => panic!("expected a reply, got {other:?}"),
        }
        assert_eq!(inbox.sent(), vec!["hey alex", "what do you climb"]);
        assert!(marker.is_some());

        let second = agent.step(&mut marker).await.unwrap();
        assert_eq!(second.outcome, CycleOutcome::Idle);
        assert_eq!(second.already_answered, 1);
        assert_eq!(inbox.sent().len(), 2);

        let stored = agent.memory().load_last_reply().await.unwrap();
        assert_eq!(stored, marker);
    }

    #[tokio::test]
    async fn persists_history_and_facts() {
        let inbox = FakeInbox::with_thread(vec![Message::user("hey, i'm alex and i love climbing")]);
        let model = ScriptedModel::new(vec![Ok("nice to meet you".into())]);
        let agent = Agent::new(inbox, model, InMemoryStore::default(), quick_cfg());

        agent.step(&mut None).await.unwrap();
        let contact = ContactId::new("alex_99");
        let history = agent.memory().load_history(&contact).await.unwrap();
        assert_eq!(history, vec![Message::user("hey, i'm alex and i love climbing")]);
        let facts = agent.memory().load_facts(&contact).await.unwrap();
        assert_eq!(facts.name.as_deref(), Some("alex"));
        assert_eq!(facts.hobbies, vec!["climbing".to_string()]);
    }

    #[tokio::test]
    async fn model_failure_aborts_without_touching_the_marker() {
        let inbox = FakeInbox::with_thread(vec![Message::user("hello there friend")]);
        let model = ScriptedModel::new(vec![Err(AgentError::Model("timeout".into()))]);
        let agent = Agent::new(inbox.clone(), model, InMemoryStore::default(), quick_cfg());

        let previous = Some(LastReply::new("older reply", &[]));
        let mut marker = previous.clone();
        assert!(agent.step(&mut marker).await.is_err());
        assert_eq!(marker, previous);
        assert!(inbox.sent().is_empty());
        assert!(agent.memory().load_last_reply().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_failure_leaves_marker_alone() {
        let mut inbox = FakeInbox::with_thread(vec![Message::user("hello there friend")]);
        inbox.fail_send = true;
        let model = ScriptedModel::new(vec![Ok("hi".into())]);
        let agent = Agent::new(inbox, model, InMemoryStore::default(), quick_cfg());

        let mut marker = None;
        let err = agent.step(&mut marker).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
        assert!(marker.is_none());
    }

    #[tokio::test]
    async fn only_the_first_novel_conversation_is_answered() {
        let inbox = FakeInbox::with_threads(vec![
            ("first_one", vec![Message::user("hello there friend")]),
            ("second_one", vec![Message::user("anyone around tonight")]),
        ]);
        let model = ScriptedModel::new(vec![Ok("hi".into()), Ok("yes".into())]);
        let agent = Agent::new(inbox.clone(), model, InMemoryStore::default(), quick_cfg());

        let report = agent.step(&mut None).await.unwrap();
        assert_eq!(inbox.opened(), vec![0]);
        assert_eq!(report.eligible, 1);
        assert_eq!(report.already_answered, 0);
        match report.outcome {
            CycleOutcome::Replied { contact, .. } => assert_eq!(contact.as_str(), "first_one"),
            other => panic!("expected a reply, got {other:?}"),
        }
        assert_eq!(inbox.sent(), vec!["hi"]);
    }

    #[tokio::test]
    async fn answered_conversation_is_skipped_for_the_next_novel_one() {
        let inbox = FakeInbox::with_threads(vec![
            ("done_already", vec![Message::user("hey"), Message::bot("hey you")]),
            ("still_waiting", vec![Message::user("you up?")]),
        ]);
        let model = ScriptedModel::new(vec![Ok("always".into())]);
        let agent = Agent::new(inbox.clone(), model, InMemoryStore::default(), quick_cfg());

        let mut marker = Some(LastReply::new("hey you", &[]));
        let report = agent.step(&mut marker).await.unwrap();
        assert_eq!(inbox.opened(), vec![0, 1]);
        assert_eq!(report.eligible, 2);
        assert_eq!(report.already_answered, 1);
        match &report.outcome {
            CycleOutcome::Replied { contact, .. } => assert_eq!(contact.as_str(), "still_waiting"),
            other => panic!("expected a reply, got {other:?}"),
        }
        assert_eq!(inbox.sent(), vec!["always"]);
        assert_eq!(marker.map(|m| m.text), Some("always".to_string()));
    }

    #[tokio::test]
    async fn ineligible_previews_are_never_opened() {
        let mut inbox = FakeInbox::with_thread(vec![Message::user("hey")]);
        inbox.previews = vec![
            ConversationPreview { index: 0, preview_text: Some("old".into()), unread: true, age: Some("3h".into()), ..Default::default() },
            ConversationPreview { index: 1, preview_text: Some("read".into()), unread: false, ..Default::default() },
            ConversationPreview { index: 2, preview_text: None, has_photo: false, unread: true, ..Default::default() },
        ];
        let model = ScriptedModel::new(vec![]);
        let agent = Agent::new(inbox.clone(), model, InMemoryStore::default(), quick_cfg());

        let report = agent.step(&mut None).await.unwrap();
        assert_eq!(report.inspected, 3);
        assert_eq!(report.eligible, 0);
        assert_eq!(report.outcome, CycleOutcome::Idle);
        assert!(inbox.opened().is_empty());
    }

    #[tokio::test]
    async fn photo_goes_through_vision_and_file_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("p.jpg");
        std::fs::write(&image, b"jpeg").unwrap();

        let mut inbox = FakeInbox::with_thread(vec![Message::user("look"), Message::user(PHOTO_MARKER)]);
        inbox.image = Some(image.clone());
        let model = ScriptedModel::new(vec![Ok("You: omg is that your cat".into())]);
        let agent = Agent::new(inbox.clone(), model, InMemoryStore::default(), quick_cfg());

        let report = agent.step(&mut None).await.unwrap();
        match report.outcome {
            CycleOutcome::Replied { path, reply, .. } => {
                assert_eq!(path, "photo_only");
                assert_eq!(reply.text, "omg is that your cat");
            }
            other => panic!("expected a reply, got {other:?}"),
        }
        assert_eq!(*agent.model.vision_calls.lock().unwrap(), 1);
        assert!(!image.exists());
    }
}
