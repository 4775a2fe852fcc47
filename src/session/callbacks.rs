//! Pending command correlation.
//!
//! Each session owns one [`CallbackRegistry`]. Ids start at 1, grow
//! strictly and are never reused, so a late response can never be matched
//! to a newer command.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::CommandId;
use crate::protocol::Response;

// ============================================================================
// Types
// ============================================================================

/// Slot a response is delivered into.
type ResultSender = oneshot::Sender<Result<Value>>;

/// A command awaiting its response.
struct PendingCommand {
    method: String,
    tx: ResultSender,
}

/// Guarded registry state.
struct RegistryState {
    next_id: u64,
    pending: FxHashMap<CommandId, PendingCommand>,
    closed: bool,
}

/// Diagnostic view of one pending command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    /// Command id.
    pub id: CommandId,
    /// Command method.
    pub method: String,
}

// ============================================================================
// CallbackRegistry
// ============================================================================

/// Correlates command ids with their result slots.
#[derive(Clone)]
pub struct CallbackRegistry {
    state: Arc<Mutex<RegistryState>>,
    target_type: Arc<str>,
}

impl CallbackRegistry {
    /// Creates an empty registry for a session over `target_type`.
    #[must_use]
    pub fn new(target_type: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                next_id: 1,
                pending: FxHashMap::default(),
                closed: false,
            })),
            target_type: Arc::from(target_type),
        }
    }

    /// Allocates an id and registers a pending command.
    ///
    /// # Errors
    ///
    /// [`Error::SessionClosed`] once [`reject_all`](Self::reject_all) has run.
    pub fn create(&self, method: &str) -> Result<CommandHandle> {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::session_closed(method, &*self.target_type));
            }
            let id = CommandId::new(state.next_id);
            state.next_id += 1;
            state.pending.insert(
                id,
                PendingCommand {
                    method: method.to_string(),
                    tx,
                },
            );
            id
        };

        trace!(%id, method, "Command registered");

        Ok(CommandHandle {
            id,
            method: method.to_string(),
            rx,
            registry: Arc::downgrade(&self.state),
            finished: false,
        })
    }

    /// Settles the pending command a response answers.
    ///
    /// Returns `false` if no command with that id is pending; the response
    /// is discarded.
    pub fn resolve(&self, response: Response) -> bool {
        let entry = self.state.lock().pending.remove(&response.id);

        match entry {
            Some(PendingCommand { method, tx }) => {
                let _ = tx.send(response.into_result(&method));
                true
            }
            None => {
                debug!(id = %response.id, "Response for unknown command discarded");
                false
            }
        }
    }

    /// Removes a pending command without settling it.
    pub fn remove(&self, id: CommandId) -> bool {
        self.state.lock().pending.remove(&id).is_some()
    }

    /// Rejects every pending command with a session-closed error and
    /// refuses new ones. Returns how many were rejected.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<PendingCommand> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain().map(|(_, pending)| pending).collect()
        };

        let count = drained.len();
        for PendingCommand { method, tx } in drained {
            let _ = tx.send(Err(Error::session_closed(method, &*self.target_type)));
        }

        if count > 0 {
            debug!(count, "Rejected pending commands");
        }
        count
    }

    /// Returns the pending commands ordered by id.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingInfo> {
        let mut list: Vec<PendingInfo> = self
            .state
            .lock()
            .pending
            .iter()
            .map(|(id, pending)| PendingInfo {
                id: *id,
                method: pending.method.clone(),
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    /// Returns the number of pending commands.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns `true` if nothing is pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once pending commands were rejected for good.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ============================================================================
// CommandHandle
// ============================================================================

/// Result handle of a sent command.
///
/// Resolves with the command's result. Dropping an unfinished handle
/// removes its pending entry, so a late response is discarded.
#[must_use = "a dropped handle abandons the command's result"]
pub struct CommandHandle {
    id: CommandId,
    method: String,
    rx: oneshot::Receiver<Result<Value>>,
    registry: Weak<Mutex<RegistryState>>,
    finished: bool,
}

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("finished", &self.finished)
            .finish()
    }
}

impl CommandHandle {
    /// Returns the command id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Returns the command method.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Waits for the result at most `limit`.
    ///
    /// # Errors
    ///
    /// [`Error::RequestTimeout`] on expiry; the pending entry is removed.
    pub async fn timeout(mut self, limit: Duration) -> Result<Value> {
        match tokio::time::timeout(limit, &mut self).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon();
                Err(Error::request_timeout(
                    self.id,
                    self.method.clone(),
                    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    fn abandon(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(state) = self.registry.upgrade()
            && state.lock().pending.remove(&self.id).is_some()
        {
            trace!(id = %self.id, method = %self.method, "Abandoned pending command");
        }
    }
}

impl Future for CommandHandle {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.finished = true;
                Poll::Ready(result.unwrap_or(Err(Error::ConnectionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        self.abandon();
    }
}

// ============================================================================
// Tests
// ============================================================================
