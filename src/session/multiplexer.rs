//! Routing of one transport across many sessions.
//!
//! A dispatch task reads [`TransportEvent`]s in wire order and routes each
//! message by its `sessionId`: no id goes to the root session, a known id
//! goes to that child, anything else is logged and dropped.
//!
//! # Session Lifecycle
//!
//! ```text
//! Target.attachedToTarget ──► child created ──► sessionattached
//!                                   │
//!                                   ▼
//! Target.detachedFromTarget ──► child closed ──► sessiondetached
//! ```
//!
//! When the transport closes, every child is torn down, then the root.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispose::DisposableStack;
use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TargetId};
use crate::options::ConnectOptions;
use crate::protocol::event::{SESSION_ATTACHED, SESSION_DETACHED};
use crate::protocol::{Event, Incoming, ParsedEvent, TargetInfo};
use crate::transport::{
    PipeSource, Transport, TransportEvent, TransportEvents, TransportKind, select_transport,
};

use super::callbacks::{CommandHandle, PendingInfo};
use super::cdp::CdpSession;
use super::listeners::Subscription;

// ============================================================================
// Types
// ============================================================================

type SessionMap = Arc<RwLock<FxHashMap<SessionId, CdpSession>>>;

struct Shared {
    transport: Arc<dyn Transport>,
    root: CdpSession,
    sessions: SessionMap,
    manually_attached: Mutex<FxHashSet<TargetId>>,
    teardown: DisposableStack,
    closing: AtomicBool,
    tearing_down: AtomicBool,
    done: watch::Sender<bool>,
}

// ============================================================================
// SessionMultiplexer
// ============================================================================

/// Multiplexes CDP sessions over one transport.
///
/// # Example
///
/// ```no_run
/// use cdp_wire::{ConnectOptions, SessionMultiplexer};
///
/// # async fn example() -> cdp_wire::Result<()> {
/// let mux = SessionMultiplexer::connect(
///     "ws://127.0.0.1:9222/devtools/browser/id",
///     &ConnectOptions::default(),
///     None,
/// )
/// .await?;
///
/// let version = mux.root().call("Browser.getVersion", None).await?;
/// println!("{}", version["product"]);
///
/// mux.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionMultiplexer {
    shared: Arc<Shared>,
}

impl fmt::Debug for SessionMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMultiplexer")
            .field("transport", &self.shared.transport.kind())
            .field("sessions", &self.shared.sessions.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionMultiplexer {
    /// Connects to `endpoint` and starts routing.
    ///
    /// Falls back to `fallback` once when the socket attempt fails and
    /// [`ConnectOptions::fallback`] permits it.
    ///
    /// # Errors
    ///
    /// The transport selection error.
    pub async fn connect(
        endpoint: &str,
        options: &ConnectOptions,
        fallback: Option<PipeSource>,
    ) -> Result<Self> {
        let (transport, events) = select_transport(endpoint, options, fallback).await?;
        Ok(Self::new(transport, events, options))
    }

    /// Starts routing `events` from `transport`.
    ///
    /// Spawns the dispatch task internally.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        options: &ConnectOptions,
    ) -> Self {
        let root = CdpSession::root(Arc::clone(&transport));
        let sessions: SessionMap = Arc::default();
        let teardown = DisposableStack::new();

        // Children first, then the root.
        {
            let root = root.clone();
            teardown.defer(move || fold_errors(root.dispose()));
        }
        {
            let sessions = Arc::clone(&sessions);
            teardown.defer(move || {
                let children: Vec<CdpSession> = sessions.read().values().cloned().collect();
                let mut errors = Vec::new();
                for child in children {
                    errors.extend(child.dispose());
                }
                sessions.write().clear();
                fold_errors(errors)
            });
        }

        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            transport,
            root,
            sessions,
            manually_attached: Mutex::new(FxHashSet::default()),
            teardown,
            closing: AtomicBool::new(false),
            tearing_down: AtomicBool::new(false),
            done,
        });

        tokio::spawn(run_dispatch(
            Arc::downgrade(&shared),
            events,
            options.slow_mo,
        ));

        debug!(transport = ?shared.transport.kind(), "Session multiplexer started");
        Self { shared }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Returns the root session.
    #[inline]
    #[must_use]
    pub fn root(&self) -> CdpSession {
        self.shared.root.clone()
    }

    /// Returns the child session with `id`.
    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<CdpSession> {
        self.shared.sessions.read().get(id).cloned()
    }

    /// Returns every live child session.
    #[must_use]
    pub fn sessions(&self) -> Vec<CdpSession> {
        self.shared.sessions.read().values().cloned().collect()
    }

    /// Attaches to `target_id` and returns the new session.
    ///
    /// # Errors
    ///
    /// - [`Error::Command`] if the browser refuses to attach
    /// - [`Error::MalformedMessage`] if the result has no `sessionId`
    /// - [`Error::SessionNotFound`] if no session was registered for it
    pub async fn create_session(&self, target_id: &TargetId) -> Result<CdpSession> {
        self.shared
            .manually_attached
            .lock()
            .insert(target_id.clone());

        let result = self
            .shared
            .root
            .call(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id, "flatten": true })),
            )
            .await;

        self.shared.manually_attached.lock().remove(target_id);

        let value = result?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(SessionId::new)
            .ok_or_else(|| Error::malformed("Target.attachToTarget result has no sessionId"))?;

        self.session(&session_id)
            .ok_or(Error::session_not_found(session_id))
    }

    /// Returns `false` while `target_id` is being attached by
    /// [`create_session`](Self::create_session).
    #[must_use]
    pub fn is_auto_attached(&self, target_id: &TargetId) -> bool {
        !self.shared.manually_attached.lock().contains(target_id)
    }

    /// Detaches the child session with `id`.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] for an unknown id, or the detach error.
    pub async fn detach_session(&self, id: &SessionId) -> Result<()> {
        self.resolve(Some(id))?.detach().await
    }

    // ========================================================================
    // Commands and Events
    // ========================================================================

    /// Sends a command on `session`, or on the root when `None`.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] for an unknown id, or the send error.
    pub async fn send(
        &self,
        session: Option<&SessionId>,
        method: &str,
        params: Option<Value>,
    ) -> Result<CommandHandle> {
        self.resolve(session)?.send(method, params).await
    }

    /// Registers a listener on `session`, or on the root when `None`.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] for an unknown id.
    pub fn on<F>(&self, session: Option<&SessionId>, event: &str, listener: F) -> Result<Subscription>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Ok(self.resolve(session)?.on(event, listener))
    }

    /// Returns every pending command, per session.
    #[must_use]
    pub fn pending_commands(&self) -> Vec<(Option<SessionId>, PendingInfo)> {
        let mut all: Vec<(Option<SessionId>, PendingInfo)> = self
            .shared
            .root
            .pending_commands()
            .into_iter()
            .map(|info| (None, info))
            .collect();

        for session in self.sessions() {
            let id = session.id().cloned();
            all.extend(
                session
                    .pending_commands()
                    .into_iter()
                    .map(|info| (id.clone(), info)),
            );
        }
        all
    }

    fn resolve(&self, session: Option<&SessionId>) -> Result<CdpSession> {
        match session {
            None => Ok(self.root()),
            Some(id) => self
                .session(id)
                .ok_or_else(|| Error::session_not_found(id.clone())),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Returns the transport kind in use.
    #[inline]
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.shared.transport.kind()
    }

    /// Registers a cleanup action run after every session is torn down.
    pub fn defer<F>(&self, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.shared.teardown.defer(action);
    }

    /// Returns `true` once teardown has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.done.borrow()
    }

    /// Waits until teardown has completed.
    pub async fn closed(&self) {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Closes the transport and tears every session down.
    ///
    /// Idempotent. Resolves once teardown has completed; pending commands
    /// fail with [`Error::SessionClosed`]. Cleanup failures are logged.
    ///
    /// # Errors
    ///
    /// The transport's close error. Teardown runs regardless.
    pub async fn close(&self) -> Result<()> {
        let mut result = Ok(());
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            debug!("Closing session multiplexer");
            if let Err(e) = self.shared.transport.close().await {
                warn!(error = %e, "Transport close failed");
                result = Err(e);
            }
            self.shared.shutdown();
        }
        self.closed().await;
        result
    }
}

// ============================================================================
// Shared
// ============================================================================

impl Shared {
    fn route(&self, text: &str) {
        let incoming = match Incoming::parse(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(error = %e, len = text.len(), "Dropping malformed message");
                return;
            }
        };

        let session = match incoming.session_id() {
            None => self.root.clone(),
            Some(id) => match self.sessions.read().get(id) {
                Some(session) => session.clone(),
                None => {
                    warn!(session = %id, "Dropping message for unknown session");
                    return;
                }
            },
        };

        if let Incoming::Event(event) = &incoming {
            match event.parse() {
                ParsedEvent::AttachedToTarget {
                    session_id,
                    target_info,
                    ..
                } => self.attach(&session, session_id, &target_info),
                ParsedEvent::DetachedFromTarget { session_id, .. } => self.detach(&session_id),
                ParsedEvent::TargetCrashed { target_id, status } => {
                    warn!(target = %target_id, %status, "Target crashed");
                }
                ParsedEvent::Other => {}
            }
        }

        session.handle(incoming);
    }

    fn attach(&self, parent: &CdpSession, id: SessionId, target: &TargetInfo) {
        if self.teardown.is_disposed() {
            debug!(session = %id, "Ignoring attach during teardown");
            return;
        }

        let previous = self.sessions.write().remove(&id);
        if let Some(previous) = previous {
            warn!(session = %id, "Session id reused, closing previous session");
            previous.dispose();
        }

        let map = Arc::downgrade(&self.sessions);
        let key = id.clone();
        let child = CdpSession::child(
            id.clone(),
            target,
            parent,
            Arc::clone(&self.transport),
            move || {
                if let Some(map) = map.upgrade() {
                    map.write().remove(&key);
                }
            },
        );
        self.sessions.write().insert(id.clone(), child);

        debug!(
            session = %id,
            target = %target.target_id,
            target_type = %target.target_type,
            "Session attached"
        );

        let event = Event::new(
            SESSION_ATTACHED,
            json!({
                "sessionId": id,
                "targetId": target.target_id,
                "targetType": target.target_type,
            }),
        );
        self.emit_lifecycle(parent, &event);
    }

    fn detach(&self, id: &SessionId) {
        let session = self.sessions.read().get(id).cloned();
        let Some(session) = session else {
            debug!(session = %id, "Detach for unknown session");
            return;
        };

        let errors = session.dispose();
        if !errors.is_empty() {
            warn!(session = %id, failed = errors.len(), "Session teardown had failures");
        }
        debug!(session = %id, "Session detached");

        let event = Event::new(
            SESSION_DETACHED,
            json!({
                "sessionId": id,
                "targetId": session.target_id(),
                "targetType": session.target_type(),
            }),
        );
        match session.parent_session() {
            Some(parent) => self.emit_lifecycle(&parent, &event),
            None => {
                self.root.emit(&event);
            }
        }
    }

    /// Emits a lifecycle event on the root and, if different, the parent.
    fn emit_lifecycle(&self, parent: &CdpSession, event: &Event) {
        self.root.emit(event);
        if !parent.same_session(&self.root) {
            parent.emit(event);
        }
    }

    /// Runs teardown once and signals completion.
    fn shutdown(&self) {
        if self.tearing_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let errors = self.teardown.dispose();
        if errors.is_empty() {
            info!("Session multiplexer closed");
        } else {
            for e in &errors {
                warn!(error = %e, "Teardown failure");
            }
            info!(failed = errors.len(), "Session multiplexer closed with failures");
        }
        self.done.send_replace(true);
    }
}

// ============================================================================
// Dispatch
// ============================================================================

async fn run_dispatch(shared: Weak<Shared>, mut events: TransportEvents, slow_mo: Duration) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(text) => {
                if !slow_mo.is_zero() {
                    tokio::time::sleep(slow_mo).await;
                }
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.route(&text);
            }
            TransportEvent::Error(e) => {
                warn!(error = %e, "Transport error");
            }
            TransportEvent::Closed(info) => {
                debug!(%info, "Transport closed");
                break;
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.shutdown();
    }
}

fn fold_errors(errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.into_iter().next().unwrap_or(Error::ConnectionClosed)),
        n => {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            Err(Error::dispose(format!("{n} cleanup actions failed: {}", joined.join("; "))))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
