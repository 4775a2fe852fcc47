//! NUL-delimited pipe transport.
//!
//! The browser's `--remote-debugging-pipe` mode exchanges JSON messages
//! over a reader/writer pair, each message terminated by a `\0` byte.
//!
//! ```text
//! {"id":1,"method":"Browser.getVersion"}\0{"id":2,...}\0
//! ```
//!
//! # Failure Handling
//!
//! The pipe carries text only, so it fails the way a WebSocket fails on a
//! bad text frame.
//!
//! | Condition | Event | Close |
//! |-----------|-------|-------|
//! | message is not UTF-8 | [`Error::InvalidPayload`] | 1007, local |
//! | buffered bytes exceed the limit | [`Error::MessageTooBig`] | 1009, local |
//! | EOF or I/O error | I/O error if any | 1006, remote |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::options::DEFAULT_MAX_MESSAGE_SIZE;
use crate::wire::CloseCode;

use super::{
    CloseInfo, ConnectionState, EventSender, Lifecycle, Transport, TransportEvent,
    TransportEvents, TransportKind,
};

// ============================================================================
// Constants
// ============================================================================

/// Message terminator.
const DELIMITER: u8 = 0;

/// Initial capacity of the read buffer.
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Boxed reading half.
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writing half.
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Internal commands for the event loop.
enum PipeCommand {
    Send {
        message: String,
        done: oneshot::Sender<Result<()>>,
    },
    Close,
}

// ============================================================================
// PipeSource
// ============================================================================

/// Where a pipe transport gets its streams from.
pub enum PipeSource {
    /// Already open streams, such as a child process's fds.
    Streams {
        /// Messages from the browser.
        reader: PipeReader,
        /// Messages to the browser.
        writer: PipeWriter,
    },
    /// A Unix domain socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Debug for PipeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streams { .. } => f.write_str("PipeSource::Streams"),
            #[cfg(unix)]
            Self::Unix(path) => f.debug_tuple("PipeSource::Unix").field(path).finish(),
        }
    }
}

impl PipeSource {
    /// Wraps an existing reader/writer pair.
    #[must_use]
    pub fn streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::Streams {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Opens the source and starts a transport on it that accepts messages
    /// of at most `max_message_size` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] if the socket path cannot be connected.
    pub async fn open(self, max_message_size: usize) -> Result<(PipeTransport, TransportEvents)> {
        match self {
            Self::Streams { reader, writer } => Ok(PipeTransport::with_max_message_size(
                reader,
                writer,
                max_message_size,
            )),
            #[cfg(unix)]
            Self::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(&path)
                    .await
                    .map_err(|e| Error::connection(format!("{}: {e}", path.display())))?;
                let (reader, writer) = stream.into_split();
                Ok(PipeTransport::with_max_message_size(
                    reader,
                    writer,
                    max_message_size,
                ))
            }
        }
    }
}

// ============================================================================
// PipeTransport
// ============================================================================

/// Transport over a NUL-delimited stream pair.
#[derive(Clone)]
pub struct PipeTransport {
    command_tx: mpsc::UnboundedSender<PipeCommand>,
    lifecycle: Arc<Lifecycle>,
}

impl fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeTransport")
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl PipeTransport {
    /// Starts a transport on `reader` and `writer` with the default
    /// message size limit.
    ///
    /// Spawns the event loop task internally.
    #[must_use]
    pub fn new<R, W>(reader: R, writer: W) -> (Self, TransportEvents)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_max_message_size(reader, writer, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Starts a transport that fails once an incoming message grows past
    /// `max_message_size` bytes.
    #[must_use]
    pub fn with_max_message_size<R, W>(
        reader: R,
        writer: W,
        max_message_size: usize,
    ) -> (Self, TransportEvents)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(Lifecycle::new(ConnectionState::Open));

        tokio::spawn(run_event_loop(
            reader,
            writer,
            max_message_size,
            command_rx,
            Arc::clone(&lifecycle),
            events_tx,
        ));

        debug!("Pipe transport open");
        (
            Self {
                command_tx,
                lifecycle,
            },
            events_rx,
        )
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Waits until the transport is closed.
    pub async fn closed(&self) -> CloseInfo {
        self.lifecycle.closed().await
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, message: String) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(Error::not_open(state));
        }
        if message.as_bytes().contains(&DELIMITER) {
            return Err(Error::invalid_payload("message contains a NUL byte"));
        }

        let (done, done_rx) = oneshot::channel();
        self.command_tx
            .send(PipeCommand::Send { message, done })
            .map_err(|_| Error::ConnectionClosed)?;
        done_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn close(&self) -> Result<()> {
        let _ = self.command_tx.send(PipeCommand::Close);
        self.lifecycle.closed().await;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }
}

// ============================================================================
// Event Loop
// ============================================================================

async fn run_event_loop<R, W>(
    mut reader: R,
    mut writer: W,
    max_message_size: usize,
    mut command_rx: mpsc::UnboundedReceiver<PipeCommand>,
    lifecycle: Arc<Lifecycle>,
    events_tx: EventSender,
) where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    // Bytes of `buf` already known to hold no delimiter.
    let mut scanned = 0usize;

    let info = 'run: loop {
        while let Some(offset) = buf[scanned..].iter().position(|b| *b == DELIMITER) {
            let chunk = buf.split_to(scanned + offset);
            buf.advance(1);
            scanned = 0;

            if chunk.len() > max_message_size {
                break 'run fail(
                    Error::message_too_big(chunk.len() as u64, max_message_size as u64),
                    &events_tx,
                );
            }
            match String::from_utf8(chunk.to_vec()) {
                Ok(text) => {
                    trace!(len = text.len(), "Pipe message received");
                    let _ = events_tx.send(TransportEvent::Message(text));
                }
                Err(_) => {
                    break 'run fail(
                        Error::invalid_payload("pipe message is not valid UTF-8"),
                        &events_tx,
                    );
                }
            }
        }
        scanned = buf.len();

        if buf.len() > max_message_size {
            break 'run fail(
                Error::message_too_big(buf.len() as u64, max_message_size as u64),
                &events_tx,
            );
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("Pipe stream ended");
                        break 'run CloseInfo::abnormal("pipe closed", true);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = events_tx.send(TransportEvent::Error(Error::Io(e)));
                        break 'run CloseInfo::abnormal(reason, true);
                    }
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(PipeCommand::Send { message, done }) => {
                        let _ = done.send(write_message(&mut writer, &message).await);
                    }
                    Some(PipeCommand::Close) | None => {
                        lifecycle.advance(ConnectionState::Closing);
                        break 'run CloseInfo::new(CloseCode::Normal, "", false);
                    }
                }
            }
        }
    };

    lifecycle.finish(info.clone());
    let _ = writer.shutdown().await;

    command_rx.close();
    while let Ok(command) = command_rx.try_recv() {
        if let PipeCommand::Send { done, .. } = command {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
    }

    debug!(code = %info.code, remote = info.remote, "Pipe event loop terminated");
    let _ = events_tx.send(TransportEvent::Closed(info));
}

/// Reports a fatal read error and returns the matching local close.
fn fail(e: Error, events_tx: &EventSender) -> CloseInfo {
    let code = e.close_code().unwrap_or(CloseCode::Protocol);
    let reason = e.to_string();
    warn!(error = %e, %code, "Failing pipe transport");
    let _ = events_tx.send(TransportEvent::Error(e));
    CloseInfo::new(code, reason, false)
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> Result<()> {
    writer.write_all(message.as_bytes()).await?;
    writer.write_all(&[DELIMITER]).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::duplex;

    #[tokio::test]
    async fn test_messages_split_on_nul() {
        let (browser_out, client_in) = duplex(4096);
        let (client_out, _browser_in) = duplex(4096);
        let (_transport, mut events) = PipeTransport::new(client_in, client_out);

        let mut browser_out = browser_out;
        browser_out
            .write_all(b"{\"id\":1}\0{\"method\":\"A.b\"}\0{\"id\"")
            .await
            .expect("write");

        for expected in ["{\"id\":1}", "{\"method\":\"A.b\"}"] {
            match events.recv().await {
                Some(TransportEvent::Message(text)) => assert_eq!(text, expected),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_appends_nul() {
        let (_browser_out, client_in) = duplex(4096);
        let (client_out, mut browser_in) = duplex(4096);
        let (transport, _events) = PipeTransport::new(client_in, client_out);

        transport.send("{\"id\":1}".to_string()).await.expect("send");

        let mut buf = vec![0u8; 9];
        browser_in.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"{\"id\":1}\0");
    }

    #[tokio::test]
    async fn test_eof_closes_remote() {
        let (browser_out, client_in) = duplex(4096);
        let (client_out, _browser_in) = duplex(4096);
        let (transport, mut events) = PipeTransport::new(client_in, client_out);

        drop(browser_out);

        match events.recv().await {
            Some(TransportEvent::Closed(info)) => {
                assert_eq!(info.code, CloseCode::Abnormal);
                assert!(info.remote);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_close_is_local_and_rejects_sends() {
        let (_browser_out, client_in) = duplex(4096);
        let (client_out, _browser_in) = duplex(4096);
        let (transport, _events) = PipeTransport::new(client_in, client_out);

        transport.close().await.expect("close");
        let info = transport.closed().await;
        assert_eq!(info.code, CloseCode::Normal);
        assert!(!info.remote);
        assert!(matches!(
            transport.send("x".into()).await,
            Err(Error::NotOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_source_streams_open() {
        let (_browser_out, client_in) = duplex(4096);
        let (client_out, _browser_in) = duplex(4096);
        let (transport, _events) = PipeSource::streams(client_in, client_out)
            .open(DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .expect("open");
        assert_eq!(transport.kind(), TransportKind::Pipe);
    }

    #[tokio::test]
    async fn test_oversized_message_without_delimiter_fails() {
        let (mut browser_out, client_in) = duplex(4096);
        let (client_out, _browser_in) = duplex(4096);
        let (transport, mut events) =
            PipeTransport::with_max_message_size(client_in, client_out, 64);

        // Arrives over several reads and never ends.
        for _ in 0..4 {
            browser_out.write_all(&[b'x'; 32]).await.expect("write");
        }

        match events.recv().await {
            Some(TransportEvent::Error(Error::MessageTooBig { size, limit })) => {
                assert!(size > 64);
                assert_eq!(limit, 64);
            }
            other => panic!("unexpected: {other:?}"),
        }
        match events.recv().await {
            Some(TransportEvent::Closed(info)) => {
                assert_eq!(info.code, CloseCode::TooBig);
                assert!(!info.remote);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_message_at_limit_is_delivered() {
        let (mut browser_out, client_in) = duplex(4096);
        let (client_out, _browser_in) = duplex(4096);
        let (_transport, mut events) =
            PipeTransport::with_max_message_size(client_in, client_out, 8);

        browser_out.write_all(b"{\"id\":1}\0").await.expect("write");

        match events.recv().await {
            Some(TransportEvent::Message(text)) => assert_eq!(text, "{\"id\":1}"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_fails_like_websocket_text() {
        let (mut browser_out, client_in) = duplex(4096);
        let (client_out, _browser_in) = duplex(4096);
        let (transport, mut events) = PipeTransport::new(client_in, client_out);

        browser_out
            .write_all(b"{\"id\":1}\0\xff\xfe\0{\"id\":2}\0")
            .await
            .expect("write");

        match events.recv().await {
            Some(TransportEvent::Message(text)) => assert_eq!(text, "{\"id\":1}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Error(Error::InvalidPayload { .. }))
        ));
        match events.recv().await {
            Some(TransportEvent::Closed(info)) => assert_eq!(info.code, CloseCode::InvalidPayload),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!transport.is_open());
    }
}
