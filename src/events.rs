//! Hermes bus payloads and the canonical JSON frames sent to websocket clients.
//!
//! Each known event type has its own wire model and its own conversion into a
//! canonical frame. The conversion is chosen by the bus filter a handler was
//! registered for, never by sniffing the payload.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};
use crate::topic;

/// One message as received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Text,
    Intent,
    Wake,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Text, EventKind::Intent, EventKind::Wake];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Intent => "intent",
            Self::Wake => "wake",
        }
    }

    pub fn from_path_segment(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "intent" => Some(Self::Intent),
            "wake" => Some(Self::Wake),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Hermes wire models

fn default_site_id() -> String {
    "default".to_owned()
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AsrTextCaptured {
    text: String,
    #[serde(default)]
    likelihood: f64,
    #[serde(default)]
    seconds: f64,
    #[serde(default = "default_site_id")]
    site_id: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    wakeword_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NluIntent {
    input: String,
    intent: IntentName,
    #[serde(default)]
    slots: Option<Vec<Slot>>,
    #[serde(default = "default_site_id")]
    site_id: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    raw_input: Option<String>,
    #[serde(default)]
    wakeword_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentName {
    intent_name: String,
    #[serde(default = "default_confidence")]
    confidence_score: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Slot {
    #[serde(default)]
    entity: String,
    #[serde(default)]
    value: Value,
    slot_name: String,
    #[serde(default, alias = "raw_value")]
    raw_value: String,
    #[serde(default)]
    range: Option<SlotRange>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlotRange {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    end: i64,
    #[serde(default, alias = "raw_start")]
    raw_start: Option<i64>,
    #[serde(default, alias = "raw_end")]
    raw_end: Option<i64>,
}

impl Slot {
    /// Hermes slot values are `{kind, value}` objects; clients want the inner value.
    fn plain_value(&self) -> Value {
        match &self.value {
            Value::Object(map) => map.get("value").cloned().unwrap_or(Value::Null),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HotwordDetected {
    model_id: String,
    #[serde(default)]
    model_version: String,
    #[serde(default = "default_model_type")]
    model_type: String,
    #[serde(default = "default_confidence")]
    current_sensitivity: f64,
    #[serde(default = "default_site_id")]
    site_id: String,
    #[serde(default)]
    session_id: Option<String>,
}

fn default_model_type() -> String {
    "personal".to_owned()
}

// ---------------------------------------------------------------------------
// Canonical frames

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextCapturedEvent {
    pub text: String,
    pub likelihood: f64,
    pub seconds: f64,
    pub site_id: String,
    pub session_id: Option<String>,
    pub wakeword_id: Option<String>,
}

/// Rhasspy-style intent dictionary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentEvent {
    pub intent: IntentSummary,
    pub entities: Vec<IntentEntity>,
    pub slots: Map<String, Value>,
    pub text: String,
    pub raw_text: String,
    pub tokens: Vec<String>,
    pub raw_tokens: Vec<String>,
    #[serde(rename = "wakewordId")]
    pub wakeword_id: Option<String>,
    #[serde(rename = "siteId")]
    pub site_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentSummary {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentEntity {
    pub entity: String,
    pub value: Value,
    pub raw_value: String,
    pub source: String,
    pub start: i64,
    pub raw_start: i64,
    pub end: i64,
    pub raw_end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeEvent {
    pub wakeword_id: String,
    pub site_id: String,
    pub session_id: Option<String>,
    pub model_id: String,
    pub model_version: String,
    pub model_type: String,
    pub current_sensitivity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub topic: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_encoding: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    TextCaptured(TextCapturedEvent),
    Intent(IntentEvent),
    Wake(WakeEvent),
    Raw(RawMessage),
}

impl CanonicalEvent {
    pub fn site_id(&self) -> Option<&str> {
        match self {
            Self::TextCaptured(event) => Some(&event.site_id),
            Self::Intent(event) => Some(&event.site_id),
            Self::Wake(event) => Some(&event.site_id),
            Self::Raw(_) => None,
        }
    }

    /// Serialized websocket text frame.
    pub fn to_frame(&self) -> Result<String> {
        let text = match self {
            Self::TextCaptured(event) => serde_json::to_string(event)?,
            Self::Intent(event) => serde_json::to_string(event)?,
            Self::Wake(event) => serde_json::to_string(event)?,
            Self::Raw(message) => serde_json::to_string(message)?,
        };
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Normalization

/// `pattern` is the bus filter the envelope was received on.
pub fn normalize_event(kind: EventKind, pattern: &str, envelope: &Envelope) -> Result<CanonicalEvent> {
    match kind {
        EventKind::Text => {
            let message: AsrTextCaptured = decode(kind, envelope)?;
            Ok(CanonicalEvent::TextCaptured(TextCapturedEvent {
                text: message.text,
                likelihood: message.likelihood,
                seconds: message.seconds,
                site_id: message.site_id,
                session_id: message.session_id,
                wakeword_id: message.wakeword_id,
            }))
        }
        EventKind::Intent => {
            let message: NluIntent = decode(kind, envelope)?;
            if message.intent.intent_name.trim().is_empty() {
                return Err(malformed(kind, envelope, "intentName is empty".to_owned()));
            }
            Ok(CanonicalEvent::Intent(intent_to_rhasspy(message)))
        }
        EventKind::Wake => {
            let message: HotwordDetected = decode(kind, envelope)?;
            let wakeword_id = topic::capture(pattern, &envelope.topic)
                .and_then(|levels| levels.first().map(|level| (*level).to_owned()))
                .unwrap_or_else(|| message.model_id.clone());
            Ok(CanonicalEvent::Wake(WakeEvent {
                wakeword_id,
                site_id: message.site_id,
                session_id: message.session_id,
                model_id: message.model_id,
                model_version: message.model_version,
                model_type: message.model_type,
                current_sensitivity: message.current_sensitivity,
            }))
        }
    }
}

/// Wraps any bus message as `{topic, payload}` without interpreting it.
pub fn passthrough(envelope: &Envelope) -> CanonicalEvent {
    let (payload, payload_encoding) = match serde_json::from_slice::<Value>(&envelope.payload) {
        Ok(value) => (value, None),
        Err(_) => match std::str::from_utf8(&envelope.payload) {
            Ok(text) => (Value::String(text.to_owned()), None),
            Err(_) => (
                Value::String(base64::engine::general_purpose::STANDARD.encode(&envelope.payload)),
                Some("base64"),
            ),
        },
    };
    CanonicalEvent::Raw(RawMessage {
        topic: envelope.topic.clone(),
        payload,
        payload_encoding,
    })
}

fn intent_to_rhasspy(message: NluIntent) -> IntentEvent {
    let slots = message.slots.unwrap_or_default();
    let entities = slots
        .iter()
        .map(|slot| {
            let range = slot.range.as_ref();
            IntentEntity {
                entity: slot.slot_name.clone(),
                value: slot.plain_value(),
                raw_value: slot.raw_value.clone(),
                source: slot.entity.clone(),
                start: range.map_or(0, |r| r.start),
                raw_start: range.map_or(0, |r| r.raw_start.unwrap_or(r.start)),
                end: range.map_or(0, |r| r.end),
                raw_end: range.map_or(0, |r| r.raw_end.unwrap_or(r.end)),
            }
        })
        .collect();
    let slot_values = slots
        .iter()
        .map(|slot| (slot.slot_name.clone(), slot.plain_value()))
        .collect::<Map<_, _>>();

    let raw_text = message.raw_input.clone().unwrap_or_default();
    let raw_tokens = message
        .raw_input
        .as_deref()
        .filter(|raw| !raw.is_empty())
        .unwrap_or(message.input.as_str())
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect();

    IntentEvent {
        intent: IntentSummary {
            name: message.intent.intent_name,
            confidence: message.intent.confidence_score,
        },
        entities,
        slots: slot_values,
        tokens: message
            .input
            .split_whitespace()
            .map(ToOwned::to_owned)
            .collect(),
        text: message.input,
        raw_text,
        raw_tokens,
        wakeword_id: message.wakeword_id,
        site_id: message.site_id,
        session_id: message.session_id,
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: EventKind, envelope: &Envelope) -> Result<T> {
    serde_json::from_slice(&envelope.payload)
        .map_err(|err| malformed(kind, envelope, err.to_string()))
}

fn malformed(kind: EventKind, envelope: &Envelope, reason: String) -> GatewayError {
    GatewayError::MalformedEvent {
        kind: kind.as_str(),
        topic: envelope.topic.clone(),
        reason,
    }
}
