//! One websocket connection bound to one subscription.
//!
//! A session registers its outbound queue with the router, runs a writer task
//! that drains the queue onto the socket, and reads client frames until the
//! client goes away, the router marks it as a slow consumer, or the server
//! shuts down. Every exit path deregisters from the router first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::error::GatewayError;
use crate::events::EventKind;
use crate::router::{ConnId, SubscriptionKey, TopicRouter};
use crate::topic;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(250);

/// Resolves a request path such as `/api/events/intent` or
/// `/api/mqtt/hermes%2Fintent%2F%23` to a subscription key.
pub fn parse_subscription_path(
    base_path: &str,
    request_path: &str,
) -> crate::error::Result<SubscriptionKey> {
    let unknown = || GatewayError::UnknownSubscription(request_path.to_owned());
    let path = request_path
        .split_once('?')
        .map_or(request_path, |(path, _)| path);
    let rest = path
        .strip_prefix(base_path.trim_end_matches('/'))
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(unknown)?;

    if let Some(encoded) = rest.strip_prefix("mqtt/") {
        let filter = urlencoding::decode(encoded).map_err(|_| GatewayError::InvalidTopic {
            topic: encoded.to_owned(),
            reason: "not valid UTF-8 after percent-decoding",
        })?;
        topic::validate_filter(&filter)?;
        return Ok(SubscriptionKey::Raw(filter.into_owned()));
    }

    rest.strip_prefix("events/")
        .map(|name| name.trim_end_matches('/'))
        .and_then(EventKind::from_path_segment)
        .map(SubscriptionKey::Event)
        .ok_or_else(unknown)
}

/// Shared by every session of one server.
pub struct SessionContext {
    pub router: Arc<TopicRouter>,
    pub bus: Arc<dyn MessageBus>,
    pub queue_capacity: usize,
    pub shutdown_drain: Duration,
    pub allow_client_publish: bool,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ClientClosed,
    SlowConsumer,
    Shutdown,
}

#[derive(Debug, Deserialize)]
struct ClientPublish {
    topic: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: ConnId,
    pub key: SubscriptionKey,
    pub remote_addr: SocketAddr,
}

impl Session {
    /// Runs until the connection ends. `cancel` is this connection's token; the
    /// router fires it when the outbound queue overflows.
    pub async fn run(
        self,
        ws: WebSocketStream<TcpStream>,
        ctx: Arc<SessionContext>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (mut write, mut read) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(ctx.queue_capacity.max(1));

        if let Err(err) = ctx
            .router
            .register(self.conn_id, &self.key, out_tx.clone(), cancel.clone())
            .await
        {
            let close = Message::Close(Some(close_frame(1011, "subscription failed")));
            let _ = timeout(CLOSE_TIMEOUT, write.send(close)).await;
            return Err(err).with_context(|| {
                format!("connection {} could not subscribe to {}", self.conn_id, self.key)
            });
        }
        info!(
            "connection {} from {} subscribed to {} ({} listening)",
            self.conn_id,
            self.remote_addr,
            self.key,
            ctx.router.subscriber_count(&self.key)
        );
        let writer = tokio::spawn(write_frames(write, out_rx));

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let end = if ctx.shutdown.is_cancelled() {
                        SessionEnd::Shutdown
                    } else {
                        SessionEnd::SlowConsumer
                    };
                    break end;
                }
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.handle_client_frame(&text, &ctx).await,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = out_tx.try_send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) | None => break SessionEnd::ClientClosed,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("connection {} read failed: {err}", self.conn_id);
                        break SessionEnd::ClientClosed;
                    }
                },
            }
        };

        ctx.router.unregister(self.conn_id, &self.key).await;
        drop(out_tx);
        match end {
            SessionEnd::Shutdown => {
                drain_and_close(
                    writer,
                    ctx.shutdown_drain,
                    Some(close_frame(1001, "server shutting down")),
                )
                .await;
            }
            SessionEnd::ClientClosed => drain_and_close(writer, CLOSE_TIMEOUT, None).await,
            SessionEnd::SlowConsumer => writer.abort(),
        }
        info!("connection {} on {} closed ({end:?})", self.conn_id, self.key);
        Ok(())
    }

    async fn handle_client_frame(&self, text: &str, ctx: &SessionContext) {
        if !matches!(self.key, SubscriptionKey::Raw(_)) || !ctx.allow_client_publish {
            debug!("ignoring inbound frame on connection {}", self.conn_id);
            return;
        }
        let request: ClientPublish = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(err) => {
                warn!("invalid publish frame on connection {}: {err}", self.conn_id);
                return;
            }
        };
        if topic::is_wildcard(&request.topic) {
            warn!(
                "connection {} tried publishing to wildcard topic {}",
                self.conn_id, request.topic
            );
            return;
        }

        let payload = match request.payload {
            Value::String(text) => text.into_bytes(),
            other => other.to_string().into_bytes(),
        };
        match ctx.bus.publish(&request.topic, payload).await {
            Ok(()) => debug!("connection {} published to {}", self.conn_id, request.topic),
            Err(err) => warn!(
                "publish to {} from connection {} failed: {err}",
                request.topic, self.conn_id
            ),
        }
    }
}

async fn write_frames(mut write: WsSink, mut out_rx: mpsc::Receiver<Message>) -> WsSink {
    while let Some(message) = out_rx.recv().await {
        if let Err(err) = write.send(message).await {
            debug!("websocket send failed: {err}");
            break;
        }
    }
    write
}

/// Lets the writer flush what is queued, then closes the socket. The writer is
/// aborted if it does not finish within `wait`.
async fn drain_and_close(
    mut writer: JoinHandle<WsSink>,
    wait: Duration,
    frame: Option<CloseFrame<'static>>,
) {
    match timeout(wait, &mut writer).await {
        Ok(Ok(mut write)) => {
            let closing = async {
                match frame {
                    Some(frame) => write.send(Message::Close(Some(frame))).await,
                    None => write.close().await,
                }
            };
            if let Ok(Err(err)) = timeout(CLOSE_TIMEOUT, closing).await {
                debug!("websocket close failed: {err}");
            }
        }
        Ok(Err(err)) => debug!("websocket writer ended abnormally: {err}"),
        Err(_) => {
            debug!("websocket drain timed out after {}ms", wait.as_millis());
            writer.abort();
        }
    }
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}
