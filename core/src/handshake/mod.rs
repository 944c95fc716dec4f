// Client handshake protocol: a one-shot plaintext greeting
//
// Wire format on an already authenticated stream:
//   client → node:  "<anything> - <deviceName>"
//   node → client:  "Hello from Whoosh Backend, <deviceName>"
//
// The greeting is not a credential. The remote identity is always the one
// the transport authenticated, never anything inside the payload.

mod session;

pub use session::{
    accept_loop, client_hello, handle_stream, CloseReason, HandshakeSession, HandshakeState,
};

use libp2p::StreamProtocol;
use std::time::Duration;
use thiserror::Error;

/// Protocol id clients open streams under
pub const WHOOSH_CLIENT_PROTOCOL: StreamProtocol = StreamProtocol::new("/whoosh/client-hello/1.0");

/// Size of the single greeting read
pub const GREETING_BUFFER_SIZE: usize = 256;

const DEVICE_DELIMITER: &str = " - ";
const RESPONSE_PREFIX: &str = "Hello from Whoosh Backend, ";
const CLIENT_GREETING_PREFIX: &str = "Hello from Whoosh Client";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("failed to read greeting: {0}")]
    Read(String),
    #[error("no greeting within {0:?}")]
    GreetingTimeout(Duration),
    #[error("malformed greeting (no \" - \" delimiter): {0:?}")]
    MalformedGreeting(String),
    #[error("failed to write response: {0}")]
    Write(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("failed to open handshake stream: {0}")]
    Open(String),
    #[error("stream closed without a response")]
    NoResponse,
}

/// Extract the device name from a greeting: the field after the first
/// `" - "` delimiter. Invalid UTF-8 is replaced, not rejected.
pub fn parse_greeting(payload: &[u8]) -> Result<String, HandshakeError> {
    let text = String::from_utf8_lossy(payload);
    text.split(DEVICE_DELIMITER)
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| HandshakeError::MalformedGreeting(text.into_owned()))
}

/// The node's reply to a valid greeting
pub fn greeting_response(device_name: &str) -> String {
    format!("{}{}", RESPONSE_PREFIX, device_name)
}

/// Greeting sent by this node when it plays the client role
pub fn client_greeting(device_name: &str) -> String {
    format!("{}{}{}", CLIENT_GREETING_PREFIX, DEVICE_DELIMITER, device_name)
}
