use anyhow::{Context, Result};
use dm_pilot::agent::AgentError;
use dm_pilot::exemplars::ExemplarBank;
use dm_pilot::stage::StageClassifier;
use dm_pilot::{Agent, AgentConfig, BotConfig, ChromiumInbox, DiskMemoryStore, OpenAiClient, OpenAiConfig, ProfileClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = BotConfig::load()?;
    let model = OpenAiClient::new(OpenAiConfig::default())?;
    let exemplars = ExemplarBank::load(&cfg.examples_file).await;

    let profiles = ProfileClient::new(cfg.api_base.clone());
    let (ws, started_profile) = match cfg.ws_endpoint.as_deref().filter(|w| !w.trim().is_empty()) {
        Some(ws) => (ws.to_string(), false),
        None => {
            let ws = profiles
                .start(&cfg.profile_id, cfg.headless)
                .await
                .map_err(|e| AgentError::Profile(format!("{e:#}")))?;
            (ws, true)
        }
    };
    info!(ws = %ws, "connecting to browser");

    let inbox = match ChromiumInbox::connect(&ws, &cfg).await {
        Ok(inbox) => inbox,
        Err(err) => {
            if started_profile {
                profiles.stop(&cfg.profile_id).await;
            }
            return Err(err).context("could not attach to browser");
        }
    };
    let agent = Agent::new(inbox, model, DiskMemoryStore::new(&cfg.data_dir), AgentConfig::from(&cfg))
        .with_classifier(StageClassifier::new(cfg.stage_markers.clone()))
        .with_exemplars(exemplars);

    info!(inbox = %cfg.inbox_url, every_secs = cfg.poll_interval_secs, "watching inbox");
    tokio::select! {
        _ = agent.run() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                warn!(error = %err, "signal handler failed");
            }
            info!("shutting down");
        }
    }

    if started_profile {
        profiles.stop(&cfg.profile_id).await;
    }
    Ok(())
}
