//! Echo protocol over WebSocket.
//!
//! Every inbound text frame is answered with exactly one text frame
//! carrying the same payload behind a fixed prefix:
//!
//! ```text
//! Client: hello
//! Server: You said: hello
//!
//! Client: (empty)
//! Server: You said:
//! ```
//!
//! Binary frames are decoded as UTF-8, replacing invalid sequences, and
//! answered the same way. Ping, pong and close control frames are left
//! to the WebSocket layer.
//!
//! Connection events reach the protocol through the [`Handler`] trait as
//! one [`Event`] value per occurrence; the handler answers with an
//! [`Action`] that the connection driver carries out.

pub mod format;
pub mod handler;

pub use format::{format_message, log_error, reply_text, REPLY_PREFIX};
pub use handler::{Action, EchoHandler, Event, Handler};
