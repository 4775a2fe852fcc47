//! One logical CDP channel.
//!
//! The root session talks to the browser target and carries no session
//! id. Child sessions are created when the browser attaches to a target;
//! their requests carry the child's `sessionId` and go over the same
//! transport.
//!
//! # Teardown
//!
//! Closing a session runs its [`DisposableStack`] in this order:
//!
//! | Step | Effect |
//! |------|--------|
//! | 1 | Pending commands fail with [`Error::SessionClosed`], new sends are refused |
//! | 2 | `CDPSession.Disconnected` is emitted, then every listener is removed |
//! | 3 | The session leaves the routing table |
//!
//! Cleanup actions added with [`CdpSession::defer`] run before step 1.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::dispose::DisposableStack;
use crate::error::{Error, Result};
use crate::identifiers::{SessionId, SubscriptionId, TargetId};
use crate::protocol::event::SESSION_DISCONNECTED;
use crate::protocol::{Event, Incoming, Request, TargetInfo};
use crate::transport::Transport;

use super::callbacks::{CallbackRegistry, CommandHandle, PendingInfo};
use super::listeners::{EventStream, ListenerRegistry, Subscription};

// ============================================================================
// Constants
// ============================================================================

/// Target type of the root session.
pub const ROOT_TARGET_TYPE: &str = "browser";

// ============================================================================
// Types
// ============================================================================

/// Transport slot; emptied when the session closes.
type TransportSlot = Arc<RwLock<Option<Arc<dyn Transport>>>>;

struct SessionInner {
    id: Option<SessionId>,
    target_type: String,
    target_id: Option<TargetId>,
    parent: Option<Weak<SessionInner>>,
    root: Option<Weak<SessionInner>>,
    callbacks: CallbackRegistry,
    listeners: ListenerRegistry,
    transport: TransportSlot,
    teardown: DisposableStack,
}

// ============================================================================
// CdpSession
// ============================================================================

/// Handle to a CDP session. Cheap to clone.
#[derive(Clone)]
pub struct CdpSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for CdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdpSession")
            .field("id", &self.inner.id)
            .field("target_type", &self.inner.target_type)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl CdpSession {
    /// Creates the root session over `transport`.
    pub(crate) fn root(transport: Arc<dyn Transport>) -> Self {
        Self::build(
            None,
            ROOT_TARGET_TYPE.to_string(),
            None,
            None,
            None,
            transport,
            None,
        )
    }

    /// Creates a child session attached under `parent`.
    ///
    /// `on_remove` runs last during teardown and takes the session out of
    /// the routing table.
    pub(crate) fn child<F>(
        id: SessionId,
        target: &TargetInfo,
        parent: &CdpSession,
        transport: Arc<dyn Transport>,
        on_remove: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let root = match &parent.inner.root {
            Some(root) => Weak::clone(root),
            None => Arc::downgrade(&parent.inner),
        };
        Self::build(
            Some(id),
            target.target_type.clone(),
            Some(target.target_id.clone()),
            Some(Arc::downgrade(&parent.inner)),
            Some(root),
            transport,
            Some(Box::new(on_remove)),
        )
    }

    fn build(
        id: Option<SessionId>,
        target_type: String,
        target_id: Option<TargetId>,
        parent: Option<Weak<SessionInner>>,
        root: Option<Weak<SessionInner>>,
        transport: Arc<dyn Transport>,
        on_remove: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        let callbacks = CallbackRegistry::new(&target_type);
        let listeners = ListenerRegistry::new();
        let transport: TransportSlot = Arc::new(RwLock::new(Some(transport)));
        let teardown = DisposableStack::new();

        // Registered in reverse of the order they run.
        if let Some(on_remove) = on_remove {
            teardown.defer(move || {
                on_remove();
                Ok(())
            });
        }
        {
            let listeners = listeners.clone();
            let session_id = id.clone();
            teardown.defer(move || {
                let mut event = Event::new(SESSION_DISCONNECTED, json!({}));
                event.session_id = session_id;
                listeners.emit(&event);
                listeners.clear();
                Ok(())
            });
        }
        {
            let callbacks = callbacks.clone();
            let transport = Arc::clone(&transport);
            teardown.defer(move || {
                transport.write().take();
                callbacks.reject_all();
                Ok(())
            });
        }

        Self {
            inner: Arc::new(SessionInner {
                id,
                target_type,
                target_id,
                parent,
                root,
                callbacks,
                listeners,
                transport,
                teardown,
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the session id, `None` for the root session.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<&SessionId> {
        self.inner.id.as_ref()
    }

    /// Returns the type of the target behind the session.
    #[inline]
    #[must_use]
    pub fn target_type(&self) -> &str {
        &self.inner.target_type
    }

    /// Returns the target id, `None` for the root session.
    #[inline]
    #[must_use]
    pub fn target_id(&self) -> Option<&TargetId> {
        self.inner.target_id.as_ref()
    }

    /// Returns `true` for the root session.
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.inner.id.is_none()
    }

    /// Returns the session this one was attached under.
    ///
    /// `None` for the root session, or when the parent is gone.
    #[must_use]
    pub fn parent_session(&self) -> Option<CdpSession> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| CdpSession { inner })
    }

    /// Returns `true` once the session is torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.transport.read().is_none()
    }

    /// Returns the commands still awaiting a response.
    #[must_use]
    pub fn pending_commands(&self) -> Vec<PendingInfo> {
        self.inner.callbacks.pending()
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.listener_count()
    }

    /// Returns `true` if both handles refer to the same session.
    #[inline]
    #[must_use]
    pub fn same_session(&self, other: &CdpSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Sends a command and returns a handle to its result.
    ///
    /// Resolves once the request is written; await the handle for the
    /// response.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionClosed`] if the session is closed
    /// - The transport's error if the write fails; the pending entry is
    ///   removed
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<CommandHandle> {
        let transport = self
            .inner
            .transport
            .read()
            .clone()
            .ok_or_else(|| Error::session_closed(method, &self.inner.target_type))?;

        let handle = self.inner.callbacks.create(method)?;
        let message = Request::new(handle.id(), method, params, self.inner.id.clone()).to_json()?;

        trace!(
            id = %handle.id(),
            method,
            session = ?self.inner.id,
            "Sending command"
        );

        transport.send(message).await?;
        Ok(handle)
    }

    /// Sends a command and waits for its result.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`Error::Command`] when the browser
    /// answers with an error.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send(method, params).await?.await
    }

    /// Sends a command and deserializes its result.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus [`Error::Json`] if the result does not
    /// match `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Detaches the session from its target.
    ///
    /// The session closes when the browser confirms with
    /// `Target.detachedFromTarget`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsupported`] for the root session
    /// - [`Error::SessionClosed`] if the session is already closed
    pub async fn detach(&self) -> Result<()> {
        let Some(id) = &self.inner.id else {
            return Err(Error::unsupported("the root session cannot be detached"));
        };
        if self.is_closed() {
            return Err(Error::session_closed(
                "Target.detachFromTarget",
                &self.inner.target_type,
            ));
        }

        let root = self
            .inner
            .root
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| CdpSession { inner })
            .ok_or(Error::ConnectionClosed)?;

        debug!(session = %id, "Detaching session");
        root.call("Target.detachFromTarget", Some(json!({ "sessionId": id })))
            .await
            .map(|_| ())
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Registers a listener for `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.listeners.on(event, listener)
    }

    /// Returns a stream of `event` notifications.
    ///
    /// The stream ends when the session closes.
    pub fn subscribe(&self, event: &str) -> EventStream {
        self.inner.listeners.subscribe(event)
    }

    /// Removes a listener.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.off(id)
    }

    /// Registers a cleanup action run when the session closes.
    ///
    /// Runs immediately if the session is already closed.
    pub fn defer<F>(&self, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.inner.teardown.defer(action);
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Delivers a routed message: responses settle commands, events reach
    /// listeners.
    pub(crate) fn handle(&self, incoming: Incoming) {
        match incoming {
            Incoming::Response(response) => {
                self.inner.callbacks.resolve(response);
            }
            Incoming::Event(event) => {
                self.inner.listeners.emit(&event);
            }
        }
    }

    /// Emits a locally generated event.
    pub(crate) fn emit(&self, event: &Event) -> usize {
        self.inner.listeners.emit(event)
    }

    /// Tears the session down. Later calls return an empty list.
    pub(crate) fn dispose(&self) -> Vec<Error> {
        if !self.inner.teardown.is_disposed() {
            debug!(session = ?self.inner.id, target_type = %self.inner.target_type, "Closing session");
        }
        self.inner.teardown.dispose()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::protocol::Response;
    use crate::transport::TransportKind;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Value>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, message: String) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed);
            }
            self.sent
                .lock()
                .push(serde_json::from_str(&message).expect("json"));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Pipe
        }
    }

    fn target(id: &str, kind: &str) -> TargetInfo {
        serde_json::from_value(json!({
            "targetId": id,
            "type": kind,
            "title": "",
            "url": "about:blank",
            "attached": true
        }))
        .expect("target info")
    }

    fn response(id: u64, session: Option<&str>) -> Incoming {
        let mut value = json!({"id": id, "result": {"ok": true}});
        if let Some(session) = session {
            value["sessionId"] = json!(session);
        }
        Incoming::Response(serde_json::from_value::<Response>(value).expect("response"))
    }

    #[tokio::test]
    async fn test_root_send_has_no_session_id() {
        let transport = Arc::new(RecordingTransport::default());
        let root = CdpSession::root(transport.clone());

        let handle = root.send("Target.getTargets", None).await.expect("send");
        let sent = transport.sent.lock()[0].clone();
        assert_eq!(sent["id"], 1);
        assert_eq!(sent["method"], "Target.getTargets");
        assert_eq!(sent["params"], json!({}));
        assert!(sent.get("sessionId").is_none());

        root.handle(response(1, None));
        assert_eq!(handle.await.expect("result")["ok"], true);
    }

    #[tokio::test]
    async fn test_child_send_carries_session_id() {
        let transport = Arc::new(RecordingTransport::default());
        let root = CdpSession::root(transport.clone());
        let child = CdpSession::child(
            SessionId::new("S1"),
            &target("T1", "page"),
            &root,
            transport.clone(),
            || {},
        );

        let _handle = child.send("Page.enable", None).await.expect("send");
        assert_eq!(transport.sent.lock()[0]["sessionId"], "S1");
        assert!(child.parent_session().expect("parent").same_session(&root));
        assert_eq!(child.target_type(), "page");
    }

    #[tokio::test]
    async fn test_failed_write_removes_pending_entry() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail.store(true, Ordering::SeqCst);
        let root = CdpSession::root(transport);

        assert!(root.send("Browser.getVersion", None).await.is_err());
        assert!(root.pending_commands().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_order() {
        let transport = Arc::new(RecordingTransport::default());
        let root = CdpSession::root(transport.clone());
        let removed = Arc::new(AtomicBool::new(false));
        let removed_flag = Arc::clone(&removed);
        let child = CdpSession::child(
            SessionId::new("S1"),
            &target("T1", "page"),
            &root,
            transport,
            move || removed_flag.store(true, Ordering::SeqCst),
        );

        let pending = child.send("Runtime.evaluate", None).await.expect("send");

        let observed_pending = Arc::new(AtomicUsize::new(usize::MAX));
        let observed = Arc::clone(&observed_pending);
        let probe = child.clone();
        let routed = Arc::clone(&removed);
        child.on(SESSION_DISCONNECTED, move |_| {
            observed.store(probe.pending_commands().len(), Ordering::SeqCst);
            assert!(!routed.load(Ordering::SeqCst));
        });

        let errors = child.dispose();
        assert!(errors.is_empty());

        assert_eq!(observed_pending.load(Ordering::SeqCst), 0);
        assert!(removed.load(Ordering::SeqCst));
        assert_eq!(child.listener_count(), 0);
        assert!(child.is_closed());
        assert!(matches!(pending.await, Err(Error::SessionClosed { .. })));
        assert!(matches!(
            child.send("Runtime.evaluate", None).await,
            Err(Error::SessionClosed { .. })
        ));
        assert!(child.dispose().is_empty());
    }

    #[tokio::test]
    async fn test_root_cannot_detach() {
        let root = CdpSession::root(Arc::new(RecordingTransport::default()));
        assert!(matches!(root.detach().await, Err(Error::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_detach_sends_through_root() {
        let transport = Arc::new(RecordingTransport::default());
        let root = CdpSession::root(transport.clone());
        let child = CdpSession::child(
            SessionId::new("S9"),
            &target("T9", "iframe"),
            &root,
            transport.clone(),
            || {},
        );

        let detaching = tokio::spawn({
            let child = child.clone();
            async move { child.detach().await }
        });

        loop {
            if !transport.sent.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let sent = transport.sent.lock()[0].clone();
        assert_eq!(sent["method"], "Target.detachFromTarget");
        assert_eq!(sent["params"]["sessionId"], "S9");
        assert!(sent.get("sessionId").is_none());

        root.handle(response(1, None));
        detaching.await.expect("join").expect("detach");
    }

    #[tokio::test]
    async fn test_deferred_cleanup_runs_before_rejection() {
        let root = CdpSession::root(Arc::new(RecordingTransport::default()));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let probe = root.clone();
        root.defer(move || {
            assert!(!probe.is_closed());
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(root.dispose().is_empty());
        assert!(ran.load(Ordering::SeqCst));
    }
}
