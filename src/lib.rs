//! ws-echo: a minimal WebSocket echo server.
//!
//! Every text message a client sends comes back prefixed with
//! `"You said: "`. Connections are independent; nothing is shared or
//! persisted between them.

pub mod config;
pub mod connection;
pub mod echo;
pub mod server;

pub use config::Config;
pub use server::{Server, ServerError};
