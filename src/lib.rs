pub mod agent;
pub mod browser;
pub mod chunker;
pub mod config;
pub mod conversation;
pub mod exemplars;
pub mod facts;
pub mod inbox;
pub mod llm;
pub mod memory;
pub mod profile;
pub mod reply;
pub mod stage;

pub use agent::{Agent, AgentConfig, AgentError, ChromiumInbox, CycleOutcome, CycleReport};
pub use browser::Browser;
pub use config::BotConfig;
pub use llm::{OpenAiClient, OpenAiConfig};
pub use memory::{DiskMemoryStore, InMemoryStore};
pub use profile::ProfileClient;
