//! Message formatting and error reporting helpers.

use serde::Serialize;
use tracing::error;

/// Prefix put in front of every echoed payload.
pub const REPLY_PREFIX: &str = "You said: ";

/// Build the echo reply for `payload`.
pub fn reply_text(payload: &str) -> String {
    let mut reply = String::with_capacity(REPLY_PREFIX.len() + payload.len());
    reply.push_str(REPLY_PREFIX);
    reply.push_str(payload);
    reply
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
}

/// Wrap a message kind and its content into a JSON object string,
/// e.g. `{"type":"chat","content":"hi"}`.
pub fn format_message(kind: &str, content: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope { kind, content })
}

/// Report a WebSocket error at error level.
pub fn log_error(err: &dyn std::error::Error) {
    error!(error = %err, "WebSocket error");
}
