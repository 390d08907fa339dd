use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::coordinator::Options;
use crate::feed;
use crate::notifications::{self, Viewer};
use crate::twitter;

const DEFAULT_ENV_PREFIX: &str = "BIRDFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub twitter: TwitterConfig,
    #[serde(default)]
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TwitterConfig {
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub api_base: String,
    #[serde(default)]
    pub user_stream_url: String,
    #[serde(default)]
    pub filter_stream_url: String,
    #[serde(default)]
    pub screen_name: String,
    #[serde(default)]
    pub user_id: String,
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            bearer_token: String::new(),
            user_agent: default_user_agent(),
            api_base: String::new(),
            user_stream_url: String::new(),
            filter_stream_url: String::new(),
            screen_name: String::new(),
            user_id: String::new(),
        }
    }
}

fn default_user_agent() -> String {
    format!("birdfeed/{}", crate::VERSION)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedsConfig {
    #[serde(default = "default_home_count")]
    pub home_count: u32,
    #[serde(default = "default_search_count")]
    pub search_count: u32,
    #[serde(default = "default_list_count")]
    pub list_count: u32,
    #[serde(default = "default_mentions_count")]
    pub mentions_count: u32,
    #[serde(default = "default_list_poll_count")]
    pub list_poll_count: u32,
    #[serde(default = "default_list_poll_interval", with = "humantime_serde")]
    pub list_poll_interval: Duration,
    #[serde(default = "default_pump_interval", with = "humantime_serde")]
    pub pump_interval: Duration,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            home_count: default_home_count(),
            search_count: default_search_count(),
            list_count: default_list_count(),
            mentions_count: default_mentions_count(),
            list_poll_count: default_list_poll_count(),
            list_poll_interval: default_list_poll_interval(),
            pump_interval: default_pump_interval(),
        }
    }
}

fn default_home_count() -> u32 {
    20
}

fn default_search_count() -> u32 {
    100
}

fn default_list_count() -> u32 {
    500
}

fn default_mentions_count() -> u32 {
    20
}

fn default_list_poll_count() -> u32 {
    10
}

fn default_list_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_pump_interval() -> Duration {
    Duration::from_millis(250)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationsConfig {
    #[serde(default = "default_notifications_enabled")]
    pub enabled: bool,
    #[serde(default = "default_notifications_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_reposts_count")]
    pub reposts_count: u32,
    #[serde(default = "default_reposters_count")]
    pub reposters_count: u32,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: default_notifications_enabled(),
            poll_interval: default_notifications_poll_interval(),
            reposts_count: default_reposts_count(),
            reposters_count: default_reposters_count(),
        }
    }
}

fn default_notifications_enabled() -> bool {
    true
}

fn default_notifications_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_reposts_count() -> u32 {
    2
}

fn default_reposters_count() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "birdfeed=info".into()
}

impl Config {
    /// The signed-in account, when both halves are configured.
    pub fn viewer(&self) -> Option<Viewer> {
        let id = self.twitter.user_id.trim();
        let screen_name = self.twitter.screen_name.trim().trim_start_matches('@');
        if id.is_empty() || screen_name.is_empty() {
            return None;
        }
        Some(Viewer {
            id: id.to_string(),
            screen_name: screen_name.to_string(),
        })
    }

    pub fn coordinator_options(&self) -> Options {
        let feeds = &self.feeds;
        let notes = &self.notifications;
        Options {
            feeds: feed::Settings {
                home_count: feeds.home_count,
                search_count: feeds.search_count,
                list_count: feeds.list_count,
                mentions_count: feeds.mentions_count,
                list_poll_count: feeds.list_poll_count,
                list_poll_interval: feeds.list_poll_interval,
            },
            notifications: notifications::Settings {
                poll_interval: notes.poll_interval,
                reposts_count: notes.reposts_count,
                reposters_count: notes.reposters_count,
            },
            viewer: self.viewer(),
        }
    }

    pub fn client_config(&self) -> twitter::ClientConfig {
        let non_empty = |value: &str| {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        };
        twitter::ClientConfig {
            user_agent: self.twitter.user_agent.clone(),
            api_base: non_empty(&self.twitter.api_base),
            user_stream_url: non_empty(&self.twitter.user_stream_url),
            filter_stream_url: non_empty(&self.twitter.filter_stream_url),
            http_client: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.twitter.bearer_token.trim().is_empty(),
            "config: twitter.bearer_token is required (set it in {} or {}_TWITTER__BEARER_TOKEN)",
            default_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "config.yaml".into()),
            DEFAULT_ENV_PREFIX
        );
        anyhow::ensure!(
            !self.feeds.list_poll_interval.is_zero(),
            "config: feeds.list_poll_interval must be positive"
        );
        anyhow::ensure!(
            !self.notifications.poll_interval.is_zero(),
            "config: notifications.poll_interval must be positive"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    let path = options.config_file.clone().or_else(default_path);
    if let Some(path) = path {
        if path.exists() {
            let from_file = read_config_file(&path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    let twitter = other.twitter;
    for (slot, value) in [
        (&mut base.twitter.bearer_token, twitter.bearer_token),
        (&mut base.twitter.user_agent, twitter.user_agent),
        (&mut base.twitter.api_base, twitter.api_base),
        (&mut base.twitter.user_stream_url, twitter.user_stream_url),
        (&mut base.twitter.filter_stream_url, twitter.filter_stream_url),
        (&mut base.twitter.screen_name, twitter.screen_name),
        (&mut base.twitter.user_id, twitter.user_id),
    ] {
        if !value.is_empty() {
            *slot = value;
        }
    }

    let feeds = other.feeds;
    for (slot, value) in [
        (&mut base.feeds.home_count, feeds.home_count),
        (&mut base.feeds.search_count, feeds.search_count),
        (&mut base.feeds.list_count, feeds.list_count),
        (&mut base.feeds.mentions_count, feeds.mentions_count),
        (&mut base.feeds.list_poll_count, feeds.list_poll_count),
    ] {
        if value != 0 {
            *slot = value;
        }
    }
    base.feeds.list_poll_interval = feeds.list_poll_interval;
    base.feeds.pump_interval = feeds.pump_interval;

    let notes = other.notifications;
    base.notifications.enabled = notes.enabled;
    base.notifications.poll_interval = notes.poll_interval;
    if notes.reposts_count != 0 {
        base.notifications.reposts_count = notes.reposts_count;
    }
    if notes.reposters_count != 0 {
        base.notifications.reposters_count = notes.reposters_count;
    }

    if !other.log.filter.is_empty() {
        base.log.filter = other.log.filter;
    }

    base
}

/// Overrides are applied on top of the merged file, so only the keys that
/// are actually set in the environment change anything.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    let map: HashMap<String, String> = env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&upper_prefix)
                .map(|stripped| (stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect();

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "twitter.bearer_token" => cfg.twitter.bearer_token = value,
        "twitter.user_agent" => cfg.twitter.user_agent = value,
        "twitter.api_base" => cfg.twitter.api_base = value,
        "twitter.user_stream_url" => cfg.twitter.user_stream_url = value,
        "twitter.filter_stream_url" => cfg.twitter.filter_stream_url = value,
        "twitter.screen_name" => cfg.twitter.screen_name = value,
        "twitter.user_id" => cfg.twitter.user_id = value,
        "feeds.home_count" => set_count(&mut cfg.feeds.home_count, &value),
        "feeds.search_count" => set_count(&mut cfg.feeds.search_count, &value),
        "feeds.list_count" => set_count(&mut cfg.feeds.list_count, &value),
        "feeds.mentions_count" => set_count(&mut cfg.feeds.mentions_count, &value),
        "feeds.list_poll_count" => set_count(&mut cfg.feeds.list_poll_count, &value),
        "feeds.list_poll_interval" => set_duration(&mut cfg.feeds.list_poll_interval, &value),
        "feeds.pump_interval" => set_duration(&mut cfg.feeds.pump_interval, &value),
        "notifications.enabled" => {
            cfg.notifications.enabled = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "notifications.poll_interval" => {
            set_duration(&mut cfg.notifications.poll_interval, &value)
        }
        "notifications.reposts_count" => set_count(&mut cfg.notifications.reposts_count, &value),
        "notifications.reposters_count" => {
            set_count(&mut cfg.notifications.reposters_count, &value)
        }
        "log.filter" => cfg.log.filter = value,
        _ => {}
    }
}

fn set_count(slot: &mut u32, value: &str) {
    if let Ok(parsed) = value.trim().parse::<u32>() {
        if parsed > 0 {
            *slot = parsed;
        }
    }
}

fn set_duration(slot: &mut Duration, value: &str) {
    if let Ok(duration) = humantime::parse_duration(value.trim()) {
        *slot = duration;
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("birdfeed").join("config.yaml"))
}
