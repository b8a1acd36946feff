use std::time::Duration;

use anyhow::{bail, Result};
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub webhook: WebhookConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub schema_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared secrets; a delivery signed with any of them is accepted.
    pub secrets: Vec<String>,
    pub max_age_secs: i64,
    pub network: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub heartbeat_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_builder = Self::defaults()?
            .add_source(config::File::with_name("config.toml").required(false))
            // local overrides, not checked in
            .add_source(config::File::with_name("config.local").required(false))
            // ACTIVITY_WEBHOOK__SECRETS=a,b style overrides
            .add_source(
                config::Environment::with_prefix("ACTIVITY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("webhook.secrets")
                    .try_parsing(true),
            );

        Self::from_builder(config_builder)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("database.schema_path", "init.sql")?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("webhook.secrets", Vec::<String>::new())?
            .set_default("webhook.max_age_secs", 300)?
            .set_default("webhook.network", "ethereum-mainnet")?
            .set_default("stream.heartbeat_secs", 30)?)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.webhook.secrets.iter().all(|s| s.trim().is_empty()) {
            bail!("webhook.secrets must contain at least one non-empty secret");
        }
        if self.webhook.max_age_secs <= 0 {
            bail!("webhook.max_age_secs must be positive");
        }
        if self.stream.heartbeat_secs == 0 {
            bail!("stream.heartbeat_secs must be positive");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.stream.heartbeat_secs)
    }
}
