use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::ServerConfig;
use crate::router::{SubscriptionKey, TopicRouter};
use crate::session::{parse_subscription_path, Session, SessionContext};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Accepts websocket connections and hands each one to a [`Session`].
pub struct GatewayServer {
    server: ServerConfig,
    router: Arc<TopicRouter>,
    bus: Arc<dyn MessageBus>,
}

struct ServerState {
    base_path: String,
    next_conn_id: AtomicU64,
    sessions: Arc<SessionContext>,
}

impl GatewayServer {
    pub fn new(server: ServerConfig, router: Arc<TopicRouter>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            server,
            router,
            bus,
        }
    }

    pub async fn run_forever(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serves until `shutdown` resolves, then closes every connection with
    /// 1001 after letting queued frames drain.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.server.bind)
            .await
            .with_context(|| {
                format!("failed binding websocket listener on {}", self.server.bind)
            })?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!(
            "websocket gateway listening on ws://{bound_addr}{}",
            self.server.base_path
        );

        let root = CancellationToken::new();
        let shutdown_drain = Duration::from_millis(self.server.shutdown_drain_ms);
        let state = Arc::new(ServerState {
            base_path: self.server.base_path.clone(),
            next_conn_id: AtomicU64::new(1),
            sessions: Arc::new(SessionContext {
                router: self.router.clone(),
                bus: self.bus.clone(),
                queue_capacity: self.server.outbound_queue_capacity,
                shutdown_drain,
                allow_client_publish: self.server.allow_client_publish,
                shutdown: root.clone(),
            }),
        });
        let mut sessions = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let state = state.clone();
                            let cancel = root.child_token();
                            sessions.spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, state, cancel).await {
                                    debug!("connection from {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("websocket accept failed: {err}");
                        }
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            warn!("connection task panicked: {err}");
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(
            "shutting down; closing {} connection(s) across {} raw topic(s)",
            sessions.len(),
            self.router.raw_topic_count()
        );
        root.cancel();
        let deadline = shutdown_drain + SHUTDOWN_GRACE;
        let drained = timeout(deadline, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "connections still open after {}ms; aborting",
                deadline.as_millis()
            );
            sessions.abort_all();
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) -> Result<()> {
    let bus = state.sessions.bus.clone();
    let base_path = state.base_path.as_str();
    let mut resolved: Option<SubscriptionKey> = None;
    let callback = |request: &Request, response: Response| {
        let path = request.uri().path();
        let key = match parse_subscription_path(base_path, path) {
            Ok(key) => key,
            Err(err) => {
                debug!("rejecting {path} from {remote_addr}: {err}");
                return Err(error_response(StatusCode::NOT_FOUND, err.to_string()));
            }
        };
        if !bus.is_ready() {
            debug!("rejecting {path} from {remote_addr}: bus not ready");
            return Err(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "message bus is not connected".to_owned(),
            ));
        }
        resolved = Some(key);
        Ok(response)
    };

    let ws = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        upgraded = timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)) => {
            upgraded
                .context("websocket handshake timed out")?
                .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?
        }
    };
    let key = resolved.ok_or_else(|| anyhow!("handshake finished without a subscription"))?;

    let session = Session {
        conn_id: state.next_conn_id.fetch_add(1, Ordering::Relaxed),
        key,
        remote_addr,
    };
    session.run(ws, state.sessions.clone(), cancel).await
}

fn error_response(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}
