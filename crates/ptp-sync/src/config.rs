use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ptp_adapters::{HtmlSourceSettings, PriceLocale, ResultSelectors};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "tracker.yaml";
pub const MAX_PAGE_COUNT: u32 = 10;
pub const MAX_INTERVAL_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        "invalid_config"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub query: String,
    #[serde(default = "default_page_count")]
    pub page_count: u32,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    #[serde(default = "default_true")]
    pub auto_run: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            query: "iPhone 13".to_string(),
            page_count: default_page_count(),
            interval_minutes: default_interval_minutes(),
            auto_run: true,
        }
    }
}

impl CollectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.trim().is_empty() {
            return Err(ConfigError::new("collection.query", "must not be empty"));
        }
        if !(1..=MAX_PAGE_COUNT).contains(&self.page_count) {
            return Err(ConfigError::new(
                "collection.page_count",
                format!("must be between 1 and {MAX_PAGE_COUNT}, got {}", self.page_count),
            ));
        }
        if !(1..=MAX_INTERVAL_MINUTES).contains(&self.interval_minutes) {
            return Err(ConfigError::new(
                "collection.interval_minutes",
                format!(
                    "must be between 1 and {MAX_INTERVAL_MINUTES}, got {}",
                    self.interval_minutes
                ),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.interval_minutes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold_percent: Decimal,
    #[serde(default)]
    pub recipient: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_percent: default_threshold(),
            recipient: None,
        }
    }
}

impl AlertConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold_percent <= Decimal::ZERO || self.threshold_percent > Decimal::ONE_HUNDRED {
            return Err(ConfigError::new(
                "alerts.threshold_percent",
                format!("must be in (0, 100], got {}", self.threshold_percent),
            ));
        }
        let has_recipient = self
            .recipient
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty());
        if self.enabled && !has_recipient {
            return Err(ConfigError::new(
                "alerts.recipient",
                "required when alerts are enabled",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSourceConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub search: HtmlSourceSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    Html(HtmlSourceConfig),
    Fixture { path: PathBuf },
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self::Html(HtmlSourceConfig {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            search: HtmlSourceSettings {
                base_url: "https://www.google.com/search".to_string(),
                query_param: "q".to_string(),
                offset_param: "start".to_string(),
                results_per_page: 20,
                extra_params: vec![
                    ("tbm".to_string(), "shop".to_string()),
                    ("hl".to_string(), "pt-BR".to_string()),
                ],
                selectors: ResultSelectors::default(),
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelSettings {
    #[default]
    Log,
    Webhook {
        url: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    /// STARTTLS relay; the password is read from the `password_env` variable.
    Smtp {
        #[serde(default = "default_smtp_server")]
        server: String,
        #[serde(default = "default_smtp_port")]
        port: u16,
        sender: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default = "default_smtp_password_env")]
        password_env: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl ChannelSettings {
    fn smtp_from(sender: String) -> Self {
        Self::Smtp {
            server: default_smtp_server(),
            port: default_smtp_port(),
            sender,
            username: None,
            password_env: default_smtp_password_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub locale: PriceLocale,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub channel: ChannelSettings,
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.collection.validate()?;
        self.alerts.validate()?;
        match &self.channel {
            ChannelSettings::Log => {}
            ChannelSettings::Webhook { url, .. } => {
                if url.trim().is_empty() {
                    return Err(ConfigError::new("channel.url", "must not be empty"));
                }
            }
            ChannelSettings::Smtp { server, sender, .. } => {
                if server.trim().is_empty() {
                    return Err(ConfigError::new("channel.server", "must not be empty"));
                }
                if !sender.contains('@') {
                    return Err(ConfigError::new("channel.sender", "must be an e-mail address"));
                }
            }
        }
        Ok(())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing tracker config yaml")
    }

    /// Reads `path` when it exists (defaults otherwise), applies `PTP_*`
    /// environment overrides and validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let path = std::env::var("PTP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(path)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(query) = lookup("PTP_QUERY") {
            self.collection.query = query;
        }
        if let Some(pages) = parse_env(&lookup, "PTP_PAGE_COUNT") {
            self.collection.page_count = pages;
        }
        if let Some(minutes) = parse_env(&lookup, "PTP_INTERVAL_MINUTES") {
            self.collection.interval_minutes = minutes;
        }
        if let Some(enabled) = lookup("PTP_ALERTS_ENABLED") {
            self.alerts.enabled = matches!(enabled.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(threshold) = parse_env(&lookup, "PTP_ALERT_THRESHOLD") {
            self.alerts.threshold_percent = threshold;
        }
        if let Some(recipient) = lookup("PTP_ALERT_RECIPIENT") {
            self.alerts.recipient = Some(recipient);
        }
        if let Some(url) = lookup("PTP_WEBHOOK_URL") {
            self.channel = ChannelSettings::Webhook {
                url,
                timeout_secs: default_timeout_secs(),
            };
        }
        if let Some(address) = lookup("PTP_SMTP_SENDER") {
            match &mut self.channel {
                ChannelSettings::Smtp { sender, .. } => *sender = address,
                other => *other = ChannelSettings::smtp_from(address),
            }
        }
        if let ChannelSettings::Smtp { server, port, .. } = &mut self.channel {
            if let Some(host) = lookup("PTP_SMTP_SERVER") {
                *server = host;
            }
            if let Some(value) = parse_env(&lookup, "PTP_SMTP_PORT") {
                *port = value;
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn default_page_count() -> u32 {
    2
}

fn default_interval_minutes() -> u32 {
    15
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> Decimal {
    Decimal::from(15)
}

fn default_user_agent() -> String {
    "ptp-bot/0.1".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_smtp_server() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_password_env() -> String {
    "PTP_SMTP_PASSWORD".to_string()
}
