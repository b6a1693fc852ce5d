//! WebSocket listener.
//!
//! Binds the listening socket, accepts clients, performs the WebSocket
//! handshake and drives one task per connection that feeds events to an
//! [`EchoHandler`].

use crate::config::Config;
use crate::connection::{Connection, ConnectionId};
use crate::echo::{Action, EchoHandler, Event, Handler};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, AcquireError, Semaphore};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

/// How long a client may take to complete the WebSocket upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a peer to finish the close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a reply may wait on a client that is not reading
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for connections before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
    #[error("connection limit closed: {0}")]
    ConnectionLimit(#[from] AcquireError),
}

/// Server instance
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    ws_config: WebSocketConfig,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Fails if the address is invalid or already in use.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(&config.listen)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: config.listen.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);
        ws_config.max_frame_size = Some(config.max_frame_size);

        info!("WebSocket server is listening on ws://{}", local_addr);

        Ok(Server {
            listener,
            local_addr,
            ws_config,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// On shutdown, open connections are sent a "going away" close frame
    /// and this returns once every connection task has finished.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut next_id: u64 = 0;
        tokio::pin!(shutdown);

        loop {
            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!(error = %e, "Connection task failed");
                }
            }

            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => permit?,
            };

            let (stream, peer) = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        accept_failed(&e).await;
                        continue;
                    }
                },
            };

            next_id += 1;
            let id = ConnectionId::new(next_id);
            let ws_config = self.ws_config.clone();
            let stop = stop_rx.clone();
            debug!(conn = %id, peer = %peer, "Accepted TCP connection");

            tasks.spawn(async move {
                serve_connection(stream, peer, id, ws_config, stop).await;
                drop(permit);
            });
        }

        info!(open = tasks.len(), "Shutting down, closing open connections");
        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    error!(error = %e, "Connection task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Connections did not close in time, aborting");
            tasks.shutdown().await;
        }
        info!("Server stopped");

        Ok(())
    }
}

/// Log a failed accept and pause so a persistent error (e.g. EMFILE)
/// does not spin the loop.
async fn accept_failed(err: &std::io::Error) {
    error!(error = %err, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

/// Handshake with one client, then pump its frames through an
/// [`EchoHandler`] until it goes away.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    ws_config: WebSocketConfig,
    mut stop: watch::Receiver<bool>,
) {
    let handshake = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        accept_async_with_config(stream, Some(ws_config)),
    );
    let ws = tokio::select! {
        result = handshake => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!(conn = %id, peer = %peer, error = %e, "WebSocket handshake failed");
                return;
            }
            Err(_) => {
                warn!(conn = %id, peer = %peer, "WebSocket handshake timed out");
                return;
            }
        },
        _ = stop.changed() => {
            debug!(conn = %id, peer = %peer, "Shutdown before handshake completed");
            return;
        }
    };

    let mut conn = Connection::new(id, peer);
    let mut handler = EchoHandler::new();
    drive(ws, &mut conn, &mut handler, &mut stop).await;
}

/// Feed every event of `ws` to `handler` in arrival order.
///
/// A reply is fully sent before the next frame is read.
async fn drive<S, H>(
    mut ws: WebSocketStream<S>,
    conn: &mut Connection,
    handler: &mut H,
    stop: &mut watch::Receiver<bool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    H: Handler,
{
    handler.handle(conn, Event::Connected);

    // Only a close handshake in progress is worth draining.
    let mut closing = false;

    while conn.is_open() {
        let next = tokio::select! {
            next = ws.next() => next,
            _ = stop.changed() => {
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                };
                match tokio::time::timeout(CLOSE_TIMEOUT, ws.close(Some(frame))).await {
                    Ok(Ok(())) => closing = true,
                    Ok(Err(e)) => {
                        debug!(conn = %conn.id(), error = %e, "Close frame not delivered");
                    }
                    Err(_) => debug!(conn = %conn.id(), "Close frame not delivered in time"),
                }
                if conn.close() {
                    handler.handle(conn, Event::Closed(None));
                }
                break;
            }
        };

        match next {
            Some(Ok(Message::Close(frame))) => {
                closing = true;
                if conn.close() {
                    handler.handle(conn, Event::Closed(frame));
                }
            }
            Some(Ok(message)) => {
                if message.is_text() || message.is_binary() {
                    conn.record_message();
                }
                if let Action::Reply(reply) = handler.handle(conn, Event::Message(message)) {
                    match tokio::time::timeout(SEND_TIMEOUT, ws.send(reply)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => fail(conn, handler, e),
                        Err(_) => {
                            warn!(conn = %conn.id(), "Client not reading, dropping connection");
                            if conn.close() {
                                handler.handle(conn, Event::Closed(None));
                            }
                        }
                    }
                }
            }
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                if conn.close() {
                    handler.handle(conn, Event::Closed(None));
                }
            }
            Some(Err(e)) => fail(conn, handler, e),
        }
    }

    if closing {
        // Let the library flush its half of the close handshake.
        let drain = async { while let Some(Ok(_)) = ws.next().await {} };
        if tokio::time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
            debug!(conn = %conn.id(), "Peer did not finish close handshake");
        }
    }
}

fn fail<H: Handler>(conn: &mut Connection, handler: &mut H, err: WsError) {
    handler.handle(conn, Event::Error(err));
    if conn.close() {
        handler.handle(conn, Event::Closed(None));
    }
}
