use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::path::Path;
use tracing::debug;

use crate::agent::{AgentError, CompletionParams, LanguageModel, ModelRole};

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_base: String, // e.g. "https://api.openai.com/v1"
    pub api_key: String,
    pub chat_model: String,
    pub fact_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            chat_model: env::var("OPENAI_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            fact_model: env::var("OPENAI_FACT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        }
    }
}

impl OpenAiConfig {
    fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Chat => &self.chat_model,
            ModelRole::Extraction => &self.fact_model,
        }
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    cfg: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(cfg: OpenAiConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    pub async fn chat(&self, messages: Value, params: CompletionParams) -> Result<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let mut req = json!({
            "model": self.cfg.model_for(params.role),
            "messages": messages,
            "temperature": params.temperature,
        });
        if let Some(max) = params.max_tokens {
            req["max_tokens"] = json!(max);
        }

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("OpenAI error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse OpenAI response JSON")?;
        Self::parse_output(&v)
    }

    fn parse_output(v: &Value) -> Result<String> {
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(|x| x.as_str())
            .context("missing choices[0].message.content")?;
        Ok(content.trim().to_string())
    }

    async fn image_data_url(image: &Path) -> Result<String> {
        let bytes = tokio::fs::read(image)
            .await
            .with_context(|| format!("failed to read image {}", image.display()))?;
        let mime = match image.extension().and_then(|e| e.to_str()) {
            Some("png") => "image/png",
            _ => "image/jpeg",
        };
        Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, system: &str, user: &str, params: CompletionParams) -> Result<String, AgentError> {
        let messages = json!([
            { "role": "system", "content": system },
            { "role": "user", "content": user }
        ]);
        debug!(role = ?params.role, "text completion");
        self.chat(messages, params)
            .await
            .map_err(|e| AgentError::Model(format!("{e:#}")))
    }

    async fn complete_vision(
        &self,
        system: &str,
        image: &Path,
        caption: Option<&str>,
        params: CompletionParams,
    ) -> Result<String, AgentError> {
        let url = Self::image_data_url(image)
            .await
            .map_err(|e| AgentError::Model(format!("{e:#}")))?;
        let mut content = vec![json!({ "type": "image_url", "image_url": { "url": url } })];
        if let Some(caption) = caption {
            content.push(json!({ "type": "text", "text": format!("caption: {caption}") }));
        }
        let messages = json!([
            { "role": "system", "content": system },
            { "role": "user", "content": content }
        ]);
        debug!(role = ?params.role, captioned = caption.is_some(), "vision completion");
        self.chat(messages, params)
            .await
            .map_err(|e| AgentError::Model(format!("{e:#}")))
    }
}
