use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("bus connection to {host}:{port} failed: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("malformed {kind} event on {topic}: {reason}")]
    MalformedEvent {
        kind: &'static str,
        topic: String,
        reason: String,
    },

    #[error("unknown subscription path: {0}")]
    UnknownSubscription(String),

    #[error("invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("broker rejected subscription to {0}")]
    SubscribeRejected(String),

    #[error("bus request failed: {0}")]
    Bus(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rumqttc::v5::ClientError> for GatewayError {
    fn from(err: rumqttc::v5::ClientError) -> Self {
        Self::Bus(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
