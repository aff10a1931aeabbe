use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Clone)]
pub struct ProfileClient {
    http: Client,
    api_base: String,
}

impl ProfileClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self { http: Client::new(), api_base: api_base.into().trim_end_matches('/').to_string() }
    }

    pub async fn start(&self, profile_id: &str, headless: bool) -> Result<String> {
        info!(profile = profile_id, headless, "starting browser profile");
        let url = format!("{}/api/v1/browser/start", self.api_base);
        let resp = self
            .http
            .get(url)
            .query(&[("user_id", profile_id), ("headless", if headless { "1" } else { "0" })])
            .send()
            .await
            .context("profile manager unreachable")?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("profile start failed {}: {}", status, text);
        }
        let env: Envelope = serde_json::from_str(&text).context("failed to parse profile start response")?;
        if env.code != 0 {
            bail!("profile start failed: {}", if env.msg.is_empty() { text } else { env.msg });
        }
        Self::ws_endpoint(&env.data)
            .with_context(|| format!("no websocket endpoint in start data: {}", env.data))
    }

    /// Best effort; failures are logged only.
    pub async fn stop(&self, profile_id: &str) {
        info!(profile = profile_id, "stopping browser profile");
        let url = format!("{}/api/v1/browser/stop", self.api_base);
        match self.http.get(url).query(&[("user_id", profile_id)]).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(profile = profile_id, status = %resp.status(), "profile stop rejected"),
            Err(err) => warn!(profile = profile_id, error = %err, "profile stop failed"),
        }
    }

    fn ws_endpoint(data: &Value) -> Option<String> {
        let ws = data.get("ws")?;
        ws.as_str()
            .or_else(|| ws.get("puppeteer").and_then(|p| p.as_str()))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}
