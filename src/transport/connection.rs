//! WebSocket connection and event loop.
//!
//! This module owns one client WebSocket: the upgrade handshake, the frame
//! codec and the close handshake.
//!
//! # Event Loop
//!
//! The connection spawns a tokio task that handles:
//!
//! - Incoming bytes, decoded into messages and emitted in wire order
//! - PING replies and the close handshake
//! - Failing queued writes and emitting `Closed` once on exit
//!
//! Writes go through a queue to a second task that owns the write half.
//! Each message is written whole, so frames never interleave, and a peer
//! that stops reading cannot stall the read side.
//!
//! # Close Handshake
//!
//! | Trigger | Action | Result |
//! |---------|--------|--------|
//! | `close_with` while `Open` | send CLOSE, wait | peer CLOSE or timeout (1006) |
//! | peer CLOSE while `Open` | echo CLOSE | `Closed`, remote |
//! | framing error | send CLOSE with 1002/1007/1009 | `Closed`, no wait |
//! | EOF or I/O error | none | `Closed` 1006, remote |
//! | all handles dropped | send CLOSE 1001 | `Closed` |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::options::ConnectOptions;
use crate::wire::handshake::{self, HandshakeRequest};
use crate::wire::{CloseCode, CloseFrame, FrameCodec, Message, Role};

use super::{
    CloseInfo, ConnectionState, EventSender, Lifecycle, Transport, TransportEvent,
    TransportEvents, TransportKind,
};

// ============================================================================
// Constants
// ============================================================================

/// Initial capacity of the read buffer.
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write a message.
    Send {
        message: Message,
        done: oneshot::Sender<Result<()>>,
    },
    /// Start the close handshake.
    Close { code: CloseCode, reason: String },
}

/// Settings the event loop needs from [`ConnectOptions`].
#[derive(Debug, Clone, Copy)]
struct LoopConfig {
    fragment_size: Option<usize>,
    close_timeout: Duration,
}

// ============================================================================
// Connection
// ============================================================================

/// Client WebSocket connection.
///
/// Exists only after a validated handshake, so it starts `Open`.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync` and cheap to clone; clones share one
/// socket. When every clone is dropped the event loop sends CLOSE 1001.
#[derive(Clone)]
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// State shared with the event loop.
    lifecycle: Arc<Lifecycle>,
    /// Endpoint this connection was opened against.
    url: Arc<Url>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Opens a TCP connection to a `ws://` URL and performs the handshake.
    ///
    /// Both steps together are bounded by `options.handshake_timeout`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options are invalid
    /// - [`Error::Unsupported`] for any scheme other than `ws`
    /// - [`Error::ConnectionTimeout`] if establishment takes too long
    /// - [`Error::Connection`] if the TCP connection fails
    /// - [`Error::Handshake`] if the server rejects the upgrade
    pub async fn connect(url: &str, options: &ConnectOptions) -> Result<(Self, TransportEvents)> {
        options.validate()?;
        let url = Url::parse(url)?;

        if url.scheme() != "ws" {
            return Err(Error::unsupported(format!(
                "scheme {:?} is not supported, only ws://",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::connection(format!("URL has no host: {url}")))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let establish = async {
            debug!(%host, port, "Connecting");
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| Error::connection(format!("{host}:{port}: {e}")))?;
            stream.set_nodelay(true)?;
            Self::from_stream(stream, &url, options).await
        };

        timeout(options.handshake_timeout, establish)
            .await
            .map_err(|_| Error::connection_timeout(options.handshake_timeout_ms()))?
    }

    /// Performs the handshake over an existing stream.
    ///
    /// Spawns the event loop task once the handshake is validated.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if the handshake takes too long
    /// - [`Error::Handshake`] if the server rejects the upgrade
    pub async fn from_stream<S>(
        mut stream: S,
        url: &Url,
        options: &ConnectOptions,
    ) -> Result<(Self, TransportEvents)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        options.validate()?;

        let request = HandshakeRequest::new(url, &options.headers)?;
        let (_, leftover) =
            handshake::perform(&mut stream, &request, options.handshake_timeout).await?;

        let codec = FrameCodec::new(Role::Client)
            .with_limits(options.max_frame_size, options.max_message_size);
        let config = LoopConfig {
            fragment_size: options.fragment_size,
            close_timeout: options.close_timeout,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(Lifecycle::new(ConnectionState::Open));

        tokio::spawn(run_event_loop(
            stream,
            leftover,
            codec,
            config,
            command_rx,
            Arc::clone(&lifecycle),
            events_tx,
        ));

        debug!(url = %url, "WebSocket open");

        Ok((
            Self {
                command_tx,
                lifecycle,
                url: Arc::new(url.clone()),
            },
            events_rx,
        ))
    }

    /// Returns the endpoint URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Returns how the connection closed, once it has.
    #[inline]
    #[must_use]
    pub fn close_info(&self) -> Option<CloseInfo> {
        self.lifecycle.close_info()
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) -> CloseInfo {
        self.lifecycle.closed().await
    }

    /// Sends a text message.
    ///
    /// # Errors
    ///
    /// - [`Error::NotOpen`] if the state is not `Open`
    /// - [`Error::ConnectionClosed`] if the connection closed before the write
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_message(Message::Text(text.into())).await
    }

    /// Sends a binary message.
    ///
    /// # Errors
    ///
    /// Same as [`send_text`](Self::send_text).
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_message(Message::Binary(data.into())).await
    }

    /// Sends a PING.
    ///
    /// # Errors
    ///
    /// Same as [`send_text`](Self::send_text), plus [`Error::Protocol`] for a
    /// payload over 125 bytes.
    pub async fn ping(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_message(Message::Ping(data.into())).await
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(Error::not_open(state));
        }

        let (done, done_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Send { message, done })
            .map_err(|_| Error::ConnectionClosed)?;

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Starts the close handshake and waits until the connection is closed.
    ///
    /// Calling this on a connection that is already closing or closed just
    /// waits for the outcome.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if `code` may not be sent on the wire.
    pub async fn close_with(&self, code: CloseCode, reason: impl Into<String>) -> Result<CloseInfo> {
        if !code.is_sendable() {
            return Err(Error::protocol(format!("close code {code} cannot be sent")));
        }

        if self.state() == ConnectionState::Open {
            let _ = self.command_tx.send(ConnectionCommand::Close {
                code,
                reason: reason.into(),
            });
        }

        Ok(self.closed().await)
    }
}

#[async_trait]
impl Transport for Connection {
    async fn send(&self, message: String) -> Result<()> {
        self.send_text(message).await
    }

    async fn close(&self) -> Result<()> {
        self.close_with(CloseCode::Normal, "").await.map(|_| ())
    }

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Writing half plus the codec that frames for it.
struct Writer<S> {
    half: WriteHalf<S>,
    codec: FrameCodec,
    fragment_size: Option<usize>,
}

impl<S: AsyncWrite> Writer<S> {
    async fn write(&mut self, message: &Message) -> Result<()> {
        let mut buf = BytesMut::new();
        self.codec
            .encode_message(message, self.fragment_size, &mut buf)?;
        self.half.write_all(&buf).await?;
        self.half.flush().await?;
        trace!(len = buf.len(), "Frame bytes written");
        Ok(())
    }
}

/// One message for the writer task.
struct WriteJob {
    message: Message,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// Queue feeding the writer task. Writes leave in submission order.
struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriteQueue {
    fn submit(&self, message: Message, done: Option<oneshot::Sender<Result<()>>>) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(WriteJob { message, done })
            && let Some(done) = job.done
        {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
    }

    fn close(&self, code: CloseCode, reason: &str) {
        self.submit(Message::Close(Some(CloseFrame::new(code, reason))), None);
    }
}

/// Writes queued messages one at a time, then shuts the half down once the
/// queue is dropped.
async fn run_writer<S: AsyncWrite>(
    mut writer: Writer<S>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
) {
    while let Some(WriteJob { message, done }) = jobs.recv().await {
        let result = writer.write(&message).await;
        match done {
            Some(done) => {
                let _ = done.send(result);
            }
            None => {
                if let Err(e) = result {
                    debug!(error = %e, "Control write failed");
                }
            }
        }
    }

    let _ = writer.half.shutdown().await;
    trace!("Writer task finished");
}

/// Event loop that handles WebSocket I/O.
///
/// Reads stay here; writes run on their own task so a slow peer reader
/// never stalls PING replies or incoming messages.
async fn run_event_loop<S>(
    stream: S,
    leftover: BytesMut,
    codec: FrameCodec,
    config: LoopConfig,
    mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    lifecycle: Arc<Lifecycle>,
    events_tx: EventSender,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, write_half) = tokio::io::split(stream);
    let writer = Writer {
        half: write_half,
        codec: FrameCodec::new(codec.role()),
        fragment_size: config.fragment_size,
    };
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let mut writer_task = tokio::spawn(run_writer(writer, jobs_rx));
    let writes = WriteQueue { tx: jobs_tx };
    let mut codec = codec;

    let mut read_buf = leftover;
    read_buf.reserve(READ_BUFFER_CAPACITY);

    let mut close_deadline: Option<Instant> = None;
    let mut sent_close: Option<CloseInfo> = None;
    let mut commands_open = true;

    let info = 'run: loop {
        // Drain every complete message already buffered.
        loop {
            match codec.decode(&mut read_buf) {
                Ok(Some(message)) => {
                    if let Some(info) = handle_message(
                        message,
                        &writes,
                        &lifecycle,
                        &events_tx,
                        sent_close.as_ref(),
                    ) {
                        break 'run info;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    break 'run fail_connection(e, &writes, &lifecycle, &events_tx);
                }
            }
        }

        let deadline = close_deadline;

        tokio::select! {
            read = reader.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        debug!("WebSocket stream ended");
                        break 'run CloseInfo::abnormal("connection closed without a close frame", true);
                    }
                    Ok(n) => trace!(bytes = n, "Read"),
                    Err(e) => {
                        error!(error = %e, "WebSocket read error");
                        let reason = e.to_string();
                        let _ = events_tx.send(TransportEvent::Error(Error::Io(e)));
                        break 'run CloseInfo::abnormal(reason, true);
                    }
                }
            }

            command = command_rx.recv(), if commands_open => {
                match command {
                    Some(ConnectionCommand::Send { message, done }) => {
                        let state = lifecycle.state();
                        if state == ConnectionState::Open {
                            writes.submit(message, Some(done));
                        } else {
                            let _ = done.send(Err(Error::not_open(state)));
                        }
                    }

                    Some(ConnectionCommand::Close { code, reason }) => {
                        if lifecycle.advance(ConnectionState::Closing) {
                            debug!(%code, %reason, "Starting close handshake");
                            writes.close(code, &reason);
                            sent_close = Some(CloseInfo::new(code, reason, false));
                            close_deadline = Some(Instant::now() + config.close_timeout);
                        }
                    }

                    None => {
                        commands_open = false;
                        if lifecycle.advance(ConnectionState::Closing) {
                            debug!("All connection handles dropped");
                            writes.close(CloseCode::GoingAway, "");
                            break 'run CloseInfo::new(CloseCode::GoingAway, "", false);
                        }
                    }
                }
            }

            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!("Close handshake timed out");
                break 'run CloseInfo::abnormal("close handshake timed out", false);
            }
        }
    };

    lifecycle.finish(info.clone());

    // Let queued frames, the close frame included, reach the wire.
    drop(writes);
    if timeout(config.close_timeout, &mut writer_task).await.is_err() {
        warn!("Writer did not drain in time");
        writer_task.abort();
    }

    // Fail writes that were queued behind the close.
    command_rx.close();
    let mut failed = 0usize;
    while let Ok(command) = command_rx.try_recv() {
        if let ConnectionCommand::Send { done, .. } = command {
            let _ = done.send(Err(Error::ConnectionClosed));
            failed += 1;
        }
    }
    if failed > 0 {
        debug!(count = failed, "Failed queued writes on shutdown");
    }

    debug!(code = %info.code, reason = %info.reason, remote = info.remote, "Event loop terminated");
    let _ = events_tx.send(TransportEvent::Closed(info));
}

/// Handles one decoded message. Returns close info when the loop must end.
fn handle_message(
    message: Message,
    writes: &WriteQueue,
    lifecycle: &Lifecycle,
    events_tx: &EventSender,
    sent_close: Option<&CloseInfo>,
) -> Option<CloseInfo> {
    match message {
        Message::Text(text) => {
            trace!(len = text.len(), "Text message received");
            let _ = events_tx.send(TransportEvent::Message(text));
            None
        }

        Message::Binary(data) => {
            match String::from_utf8(data.to_vec()) {
                Ok(text) => {
                    let _ = events_tx.send(TransportEvent::Message(text));
                }
                Err(_) => warn!(len = data.len(), "Dropping non UTF-8 binary message"),
            }
            None
        }

        Message::Ping(data) => {
            if lifecycle.state() == ConnectionState::Open {
                writes.submit(Message::Pong(data), None);
            }
            None
        }

        Message::Pong(_) => {
            trace!("Pong received");
            None
        }

        Message::Close(frame) => {
            if let Some(local) = sent_close {
                debug!("Close handshake completed");
                let info = match frame {
                    Some(frame) => CloseInfo::new(frame.code, frame.reason, false),
                    None => local.clone(),
                };
                return Some(info);
            }

            lifecycle.advance(ConnectionState::Closing);
            debug!(frame = ?frame, "WebSocket closed by remote");

            // Echo the peer's status; an empty close gets an empty echo.
            let echo = frame.as_ref().map(|f| CloseFrame::new(f.code, ""));
            writes.submit(Message::Close(echo), None);

            Some(match frame {
                Some(frame) => CloseInfo::new(frame.code, frame.reason, true),
                None => CloseInfo::new(CloseCode::NoStatus, "", true),
            })
        }
    }
}

/// Fails the connection after a framing error.
fn fail_connection(
    e: Error,
    writes: &WriteQueue,
    lifecycle: &Lifecycle,
    events_tx: &EventSender,
) -> CloseInfo {
    let code = e.close_code().unwrap_or(CloseCode::Protocol);
    let reason = e.to_string();
    error!(error = %e, %code, "Failing WebSocket connection");

    if lifecycle.advance(ConnectionState::Closing) {
        writes.close(code, &reason);
    }

    let _ = events_tx.send(TransportEvent::Error(e));
    CloseInfo::new(code, reason, false)
}

// ============================================================================
// Tests
// ============================================================================
