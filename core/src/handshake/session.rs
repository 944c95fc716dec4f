// Per-stream handshake state machine
//
//   AwaitingGreeting → Acknowledged → Draining → Closed
//
// Every path ends in Closed, and the stream is closed on the way out.

use super::{
    client_greeting, greeting_response, parse_greeting, HandshakeError, GREETING_BUFFER_SIZE,
};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, StreamExt};
use libp2p::PeerId;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingGreeting,
    Acknowledged,
    Draining,
    Closed,
}

/// How a session reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream after the greeting exchange
    Graceful,
    /// Peer closed the stream without sending anything
    ClosedBeforeGreeting,
    Failed(HandshakeError),
}

/// State of one accepted handshake stream
#[derive(Debug, Clone)]
pub struct HandshakeSession {
    pub peer_id: PeerId,
    pub device_name: Option<String>,
    pub greeting_completed: bool,
    pub state: HandshakeState,
    /// Messages received after the greeting, logged and otherwise ignored
    pub additional_messages: usize,
    pub close_reason: Option<CloseReason>,
}

impl HandshakeSession {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            device_name: None,
            greeting_completed: false,
            state: HandshakeState::AwaitingGreeting,
            additional_messages: 0,
            close_reason: None,
        }
    }

    async fn drive<S>(&mut self, stream: &mut S, greeting_timeout: Duration) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; GREETING_BUFFER_SIZE];

        let n = match tokio::time::timeout(greeting_timeout, stream.read(&mut buf)).await {
            Err(_) => return CloseReason::Failed(HandshakeError::GreetingTimeout(greeting_timeout)),
            Ok(Err(e)) => return CloseReason::Failed(HandshakeError::Read(e.to_string())),
            Ok(Ok(0)) => return CloseReason::ClosedBeforeGreeting,
            Ok(Ok(n)) => n,
        };

        let device_name = match parse_greeting(&buf[..n]) {
            Ok(device_name) => device_name,
            Err(e) => return CloseReason::Failed(e),
        };
        tracing::debug!("Handshake from {} as {:?}", self.peer_id, device_name);

        let response = greeting_response(&device_name);
        self.device_name = Some(device_name);
        if let Err(e) = write_flushed(stream, response.as_bytes()).await {
            return CloseReason::Failed(HandshakeError::Write(e.to_string()));
        }
        self.greeting_completed = true;
        self.state = HandshakeState::Acknowledged;

        self.state = HandshakeState::Draining;
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => return CloseReason::Graceful,
                Ok(n) => {
                    self.additional_messages += 1;
                    tracing::info!(
                        "Additional message from {}: {}",
                        self.peer_id,
                        String::from_utf8_lossy(&buf[..n])
                    );
                }
                Err(e) => return CloseReason::Failed(HandshakeError::Stream(e.to_string())),
            }
        }
    }

    fn close(&mut self, reason: CloseReason) {
        match &reason {
            CloseReason::Graceful => tracing::info!(
                "Client {} completed handshake and closed connection gracefully",
                self.peer_id
            ),
            CloseReason::ClosedBeforeGreeting => {
                tracing::warn!("Client {} closed the stream before greeting", self.peer_id)
            }
            CloseReason::Failed(e @ HandshakeError::MalformedGreeting(_)) => {
                tracing::warn!("❌ Rejected handshake from {}: {}", self.peer_id, e)
            }
            CloseReason::Failed(e @ HandshakeError::Write(_)) => tracing::error!(
                "❌ Error sending handshake response to {}: {}",
                self.peer_id,
                e
            ),
            CloseReason::Failed(e @ HandshakeError::Stream(_)) => {
                tracing::error!("❌ Error reading from {}: {}", self.peer_id, e)
            }
            CloseReason::Failed(e) => {
                tracing::error!("❌ Error reading handshake from {}: {}", self.peer_id, e)
            }
        }
        self.state = HandshakeState::Closed;
        self.close_reason = Some(reason);
    }
}

async fn write_flushed<S>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}

/// Run the handshake on one accepted stream until it closes. The stream is
/// closed before returning, whichever way the session ended.
pub async fn handle_stream<S>(
    peer_id: PeerId,
    mut stream: S,
    greeting_timeout: Duration,
) -> HandshakeSession
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = HandshakeSession::new(peer_id);
    let reason = session.drive(&mut stream, greeting_timeout).await;
    session.close(reason);

    if let Err(e) = stream.close().await {
        tracing::debug!("Closing handshake stream from {}: {}", peer_id, e);
    }
    session
}

/// Accept handshake streams forever, one isolated task per stream
pub async fn accept_loop(mut incoming: libp2p_stream::IncomingStreams, greeting_timeout: Duration) {
    while let Some((peer_id, stream)) = incoming.next().await {
        tracing::debug!("Handshake stream opened by {}", peer_id);
        tokio::spawn(handle_stream(peer_id, stream, greeting_timeout));
    }
    tracing::info!("Handshake protocol handler stopped");
}

/// Client side: send our greeting, read the single response and close
pub async fn client_hello<S>(stream: &mut S, device_name: &str) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_flushed(stream, client_greeting(device_name).as_bytes())
        .await
        .map_err(|e| HandshakeError::Write(e.to_string()))?;

    let mut buf = [0u8; GREETING_BUFFER_SIZE];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| HandshakeError::Read(e.to_string()))?;

    if let Err(e) = stream.close().await {
        tracing::debug!("Closing handshake stream: {}", e);
    }

    if n == 0 {
        return Err(HandshakeError::NoResponse);
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}
