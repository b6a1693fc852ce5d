//! Per-client connection state.
//!
//! A `Connection` is created once the WebSocket handshake succeeds and
//! lives until the client closes, the transport fails, or the server
//! shuts down. Nothing here is shared between connections.

use std::fmt;
use std::net::SocketAddr;

/// Identifier assigned by the listener, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Handshake done, frames flow both ways.
    Open,
    /// Closed by the peer, by an error, or by shutdown. Terminal.
    Closed,
}

/// A single accepted client session.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnState,
    messages: u64,
}

impl Connection {
    /// Create a new connection in the open state.
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: ConnState::Open,
            messages: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    /// Number of data messages received so far.
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Count one inbound data message.
    pub fn record_message(&mut self) {
        self.messages += 1;
    }

    /// Mark the connection closed.
    ///
    /// Returns `true` only on the transition from open, so callers can
    /// report the disconnect exactly once.
    pub fn close(&mut self) -> bool {
        let was_open = self.is_open();
        self.state = ConnState::Closed;
        was_open
    }
}
