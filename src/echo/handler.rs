//! Echo handler: reacts to connection events.

use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use super::format::{log_error, reply_text};
use crate::connection::Connection;

/// Something that happened on a connection.
#[derive(Debug)]
pub enum Event {
    /// Handshake completed.
    Connected,
    /// A complete message arrived. Close frames are reported as `Closed`.
    Message(Message),
    /// The connection is gone, with the peer's close frame if it sent one.
    Closed(Option<CloseFrame<'static>>),
    /// The transport failed. A `Closed` event follows.
    Error(WsError),
}

/// What the driver should do after an event.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Send this message back on the same connection.
    Reply(Message),
    Ignore,
}

/// Per-connection event handler.
///
/// The connection driver calls `handle` once per event, in order, and
/// finishes the returned action before reading the next frame.
pub trait Handler {
    fn handle(&mut self, conn: &Connection, event: Event) -> Action;
}

/// Answers every data message with `"You said: " + payload`.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl EchoHandler {
    pub fn new() -> Self {
        EchoHandler
    }

    fn on_message(&self, conn: &Connection, message: Message) -> Action {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => {
                debug!(conn = %conn.id(), len = data.len(), "Binary frame, decoding as text");
                String::from_utf8_lossy(&data).into_owned()
            }
            // Pings are answered by the WebSocket layer.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Close(_) => {
                return Action::Ignore;
            }
        };

        info!(conn = %conn.id(), "Received: {}", text);
        Action::Reply(Message::Text(reply_text(&text)))
    }
}

impl Handler for EchoHandler {
    fn handle(&mut self, conn: &Connection, event: Event) -> Action {
        match event {
            Event::Connected => {
                info!(conn = %conn.id(), peer = %conn.peer(), "New client connected");
                Action::Ignore
            }
            Event::Message(message) => self.on_message(conn, message),
            Event::Closed(frame) => {
                match frame {
                    Some(frame) => info!(
                        conn = %conn.id(),
                        code = u16::from(frame.code),
                        reason = %frame.reason,
                        messages = conn.messages(),
                        "Client disconnected"
                    ),
                    None => info!(
                        conn = %conn.id(),
                        messages = conn.messages(),
                        "Client disconnected"
                    ),
                }
                Action::Ignore
            }
            Event::Error(err) => {
                log_error(&err);
                Action::Ignore
            }
        }
    }
}
