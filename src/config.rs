use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::RetryBackoffPolicy;
use crate::events::EventKind;
use crate::topic;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_subscribe_ack_timeout_ms")]
    pub subscribe_ack_timeout_ms: u64,
    #[serde(default = "default_request_channel_capacity")]
    pub request_channel_capacity: usize,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    #[serde(default)]
    pub deliver_retained: bool,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            subscribe_ack_timeout_ms: default_subscribe_ack_timeout_ms(),
            request_channel_capacity: default_request_channel_capacity(),
            max_packet_size: default_max_packet_size(),
            deliver_retained: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = RetryBackoffPolicy::bus_default();
        Self {
            initial_ms: policy.initial_ms,
            max_ms: policy.max_ms,
            factor: policy.factor,
            jitter: policy.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
    #[serde(default = "default_allow_client_publish")]
    pub allow_client_publish: bool,
    #[serde(default)]
    pub site_ids: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            base_path: default_base_path(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
            allow_client_publish: default_allow_client_publish(),
            site_ids: Vec::new(),
        }
    }
}

/// Bus filters feeding the fixed `events/*` websocket paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_text_topic")]
    pub text: String,
    #[serde(default = "default_intent_topic")]
    pub intent: String,
    #[serde(default = "default_wake_topic")]
    pub wake: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            text: default_text_topic(),
            intent: default_intent_topic(),
            wake: default_wake_topic(),
        }
    }
}

impl TopicsConfig {
    pub fn pattern(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Text => &self.text,
            EventKind::Intent => &self.intent,
            EventKind::Wake => &self.wake,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(
        &mut self,
        mqtt_host: Option<&str>,
        mqtt_port: Option<u16>,
        bind: Option<&str>,
    ) -> Result<()> {
        if let Some(host) = mqtt_host {
            self.mqtt.host = host.to_owned();
        }
        if let Some(port) = mqtt_port {
            self.mqtt.port = port;
        }
        if let Some(bind) = bind {
            self.server.bind = bind.to_owned();
        }
        self.validate()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("HERMES_WS_MQTT_HOST") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.mqtt.host = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("HERMES_WS_MQTT_PORT") {
            if let Ok(n) = v.trim().parse::<u16>() {
                self.mqtt.port = n;
            }
        }
        if let Ok(v) = env::var("HERMES_WS_MQTT_CLIENT_ID") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.mqtt.client_id = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("HERMES_WS_MQTT_USERNAME") {
            self.mqtt.username = non_empty(&v);
        }
        if let Ok(v) = env::var("HERMES_WS_MQTT_PASSWORD") {
            self.mqtt.password = non_empty(&v);
        }
        if let Ok(v) = env::var("HERMES_WS_DELIVER_RETAINED") {
            self.mqtt.deliver_retained = parse_bool(&v);
        }
        if let Ok(v) = env::var("HERMES_WS_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("HERMES_WS_BASE_PATH") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.base_path = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("HERMES_WS_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.server.outbound_queue_capacity = n.max(1);
            }
        }
        if let Ok(v) = env::var("HERMES_WS_ALLOW_CLIENT_PUBLISH") {
            self.server.allow_client_publish = parse_bool(&v);
        }
        if let Ok(v) = env::var("HERMES_WS_SITE_IDS") {
            self.server.site_ids = split_csv(&v);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            anyhow::bail!("mqtt.host must not be empty");
        }
        if self.mqtt.port == 0 {
            anyhow::bail!("mqtt.port must be > 0");
        }
        if self.mqtt.client_id.trim().is_empty() {
            anyhow::bail!("mqtt.client_id must not be empty");
        }
        if self.mqtt.keep_alive_secs < 5 {
            anyhow::bail!("mqtt.keep_alive_secs must be >= 5");
        }
        if self.mqtt.connect_timeout_ms == 0 {
            anyhow::bail!("mqtt.connect_timeout_ms must be > 0");
        }
        if self.mqtt.request_channel_capacity == 0 {
            anyhow::bail!("mqtt.request_channel_capacity must be > 0");
        }
        if self.mqtt.max_packet_size < 1024 {
            anyhow::bail!("mqtt.max_packet_size must be >= 1024");
        }
        if self.mqtt.reconnect.initial_ms == 0 {
            anyhow::bail!("mqtt.reconnect.initial_ms must be > 0");
        }
        if self.mqtt.reconnect.max_ms < self.mqtt.reconnect.initial_ms {
            anyhow::bail!("mqtt.reconnect.max_ms must be >= mqtt.reconnect.initial_ms");
        }
        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            anyhow::bail!("mqtt.username and mqtt.password must be set together");
        }
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if !self.server.base_path.starts_with('/') {
            anyhow::bail!("server.base_path must start with '/'");
        }
        if self.server.outbound_queue_capacity == 0 {
            anyhow::bail!("server.outbound_queue_capacity must be > 0");
        }
        for (name, filter) in [
            ("topics.text", &self.topics.text),
            ("topics.intent", &self.topics.intent),
            ("topics.wake", &self.topics.wake),
        ] {
            topic::validate_filter(filter).with_context(|| format!("{name} is not a valid filter"))?;
        }
        Ok(())
    }
}

fn non_empty(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_mqtt_host() -> String {
    "localhost".to_owned()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "hermes-ws-gateway".to_owned()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_subscribe_ack_timeout_ms() -> u64 {
    2_000
}

fn default_request_channel_capacity() -> usize {
    64
}

fn default_max_packet_size() -> u32 {
    1024 * 1024
}

fn default_server_bind() -> String {
    "127.0.0.1:12101".to_owned()
}

fn default_base_path() -> String {
    "/api/".to_owned()
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_shutdown_drain_ms() -> u64 {
    1_000
}

fn default_allow_client_publish() -> bool {
    true
}

fn default_text_topic() -> String {
    "hermes/asr/textCaptured".to_owned()
}

fn default_intent_topic() -> String {
    "hermes/intent/#".to_owned()
}

fn default_wake_topic() -> String {
    "hermes/hotword/+/detected".to_owned()
}
