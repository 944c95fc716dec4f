// Handshake sessions over a scripted in-memory stream

use futures::{AsyncRead, AsyncWrite};
use libp2p::PeerId;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use whoosh_core::handshake::{client_hello, handle_stream, CloseReason, HandshakeState};
use whoosh_core::HandshakeError;

const TIMEOUT: Duration = Duration::from_secs(30);

enum Step {
    Data(&'static [u8]),
    Fail(io::ErrorKind),
    /// Never becomes readable
    Stall,
}

/// Plays back scripted reads (EOF once the script runs out) and records
/// everything written
#[derive(Default)]
struct ScriptedStream {
    reads: VecDeque<Step>,
    written: Vec<u8>,
    fail_writes: bool,
    closed: bool,
}

impl ScriptedStream {
    fn new(reads: impl IntoIterator<Item = Step>) -> Self {
        Self {
            reads: reads.into_iter().collect(),
            ..Default::default()
        }
    }

    fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    fn written(&self) -> String {
        String::from_utf8(self.written.clone()).unwrap()
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(Step::Stall) = self.reads.front() {
            return Poll::Pending;
        }
        match self.reads.pop_front() {
            Some(Step::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Poll::Ready(Ok(n))
            }
            Some(Step::Fail(kind)) => Poll::Ready(Err(io::Error::new(kind, "scripted failure"))),
            Some(Step::Stall) => unreachable!(),
            None => Poll::Ready(Ok(0)),
        }
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_writes {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        self.written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed = true;
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_valid_greeting_gets_exact_response() {
    let peer = PeerId::random();
    let mut stream = ScriptedStream::new([Step::Data(b"X - device42")]);

    let session = handle_stream(peer, &mut stream, TIMEOUT).await;

    assert_eq!(stream.written(), "Hello from Whoosh Backend, device42");
    assert!(stream.closed);
    assert_eq!(session.peer_id, peer);
    assert_eq!(session.device_name.as_deref(), Some("device42"));
    assert!(session.greeting_completed);
    assert_eq!(session.state, HandshakeState::Closed);
    assert_eq!(session.close_reason, Some(CloseReason::Graceful));
}

#[tokio::test]
async fn test_malformed_greeting_fails_session_and_closes_stream() {
    let mut stream = ScriptedStream::new([Step::Data(b"hello there")]);

    let session = handle_stream(PeerId::random(), &mut stream, TIMEOUT).await;

    assert!(stream.written.is_empty());
    assert!(stream.closed);
    assert!(!session.greeting_completed);
    assert_eq!(session.state, HandshakeState::Closed);
    assert!(matches!(
        session.close_reason,
        Some(CloseReason::Failed(HandshakeError::MalformedGreeting(_)))
    ));
}

#[tokio::test]
async fn test_first_read_error() {
    let mut stream = ScriptedStream::new([Step::Fail(io::ErrorKind::ConnectionReset)]);

    let session = handle_stream(PeerId::random(), &mut stream, TIMEOUT).await;

    assert!(stream.closed);
    assert!(stream.written.is_empty());
    assert!(matches!(
        session.close_reason,
        Some(CloseReason::Failed(HandshakeError::Read(_)))
    ));
}

#[tokio::test]
async fn test_peer_closes_before_greeting() {
    let mut stream = ScriptedStream::new([]);

    let session = handle_stream(PeerId::random(), &mut stream, TIMEOUT).await;

    assert!(stream.closed);
    assert_eq!(session.close_reason, Some(CloseReason::ClosedBeforeGreeting));
    assert!(!session.greeting_completed);
}

#[tokio::test]
async fn test_write_failure_fails_session() {
    let mut stream = ScriptedStream::new([Step::Data(b"X - device42")]).failing_writes();

    let session = handle_stream(PeerId::random(), &mut stream, TIMEOUT).await;

    assert!(stream.closed);
    assert!(!session.greeting_completed);
    assert!(matches!(
        session.close_reason,
        Some(CloseReason::Failed(HandshakeError::Write(_)))
    ));
}

#[tokio::test]
async fn test_additional_messages_are_drained_until_close() {
    let mut stream = ScriptedStream::new([
        Step::Data(b"Hello from Whoosh Client - laptop"),
        Step::Data(b"ping"),
        Step::Data(b"still here"),
    ]);

    let session = handle_stream(PeerId::random(), &mut stream, TIMEOUT).await;

    // Only the greeting is answered
    assert_eq!(stream.written(), "Hello from Whoosh Backend, laptop");
    assert_eq!(session.additional_messages, 2);
    assert_eq!(session.close_reason, Some(CloseReason::Graceful));
}

#[tokio::test]
async fn test_error_while_draining() {
    let mut stream = ScriptedStream::new([
        Step::Data(b"X - phone"),
        Step::Fail(io::ErrorKind::ConnectionAborted),
    ]);

    let session = handle_stream(PeerId::random(), &mut stream, TIMEOUT).await;

    assert!(stream.closed);
    assert!(session.greeting_completed);
    assert!(matches!(
        session.close_reason,
        Some(CloseReason::Failed(HandshakeError::Stream(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let mut stream = ScriptedStream::new([Step::Stall]);

    let session = handle_stream(PeerId::random(), &mut stream, TIMEOUT).await;

    assert!(stream.closed);
    assert_eq!(
        session.close_reason,
        Some(CloseReason::Failed(HandshakeError::GreetingTimeout(TIMEOUT)))
    );
}

#[tokio::test]
async fn test_client_hello_sends_greeting_and_returns_response() {
    let mut stream = ScriptedStream::new([Step::Data(b"Hello from Whoosh Backend, laptop")]);

    let response = client_hello(&mut stream, "laptop").await.unwrap();

    assert_eq!(response, "Hello from Whoosh Backend, laptop");
    assert_eq!(stream.written(), "Hello from Whoosh Client - laptop");
    assert!(stream.closed);
}

#[tokio::test]
async fn test_client_hello_without_response() {
    let mut stream = ScriptedStream::new([]);
    assert_eq!(
        client_hello(&mut stream, "laptop").await,
        Err(HandshakeError::NoResponse)
    );
}
