//! RPC correlation registry.
//!
//! Every outbound call registers an [`RpcMessageContext`] under a fresh
//! correlation id. Responses arrive on a separate read loop, possibly out of
//! order, and are matched back to the waiting caller by id. A context is
//! settled exactly once: with a response, a local error, or a remote-signalled
//! error. Settlement removes the context from the table under the table lock,
//! so concurrent settle, abort and timeout paths can never complete the same
//! call twice.
//!
//! Contexts are grouped by scope (one scope per connection). When a connection
//! is lost, [`RpcMessageRegistry::abort_scope_with_remote_error`] releases
//! every caller still waiting on that connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::messages::Envelope;

/// Value a pending call settles with.
pub type RpcOutcome = Result<Envelope, ProtocolError>;

/// One outstanding RPC call.
#[derive(Debug)]
pub struct RpcMessageContext {
    correlation_id: String,
    scope: String,
    slot: Mutex<Option<oneshot::Sender<RpcOutcome>>>,
}

impl RpcMessageContext {
    fn new(scope: &str) -> (Arc<Self>, oneshot::Receiver<RpcOutcome>) {
        let (tx, rx) = oneshot::channel();
        let context = Arc::new(Self {
            correlation_id: Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            slot: Mutex::new(Some(tx)),
        });
        (context, rx)
    }

    /// Correlation id of this call.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Scope (connection) that owns this call.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Returns true once the context has been settled.
    pub fn is_settled(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Settles the context with a response.
    ///
    /// Returns [`ProtocolError::InvalidRpcState`] if the context was already settled.
    pub fn set_response(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        self.settle(Ok(envelope))
    }

    /// Settles the context with a local failure.
    pub fn abort_with_error(&self, err: ProtocolError) -> Result<(), ProtocolError> {
        self.settle(Err(err))
    }

    /// Settles the context with a failure reported by the remote side.
    pub fn abort_with_remote_error(&self, message: &str) -> Result<(), ProtocolError> {
        self.settle(Err(ProtocolError::Remote {
            correlation_id: self.correlation_id.clone(),
            message: message.to_string(),
        }))
    }

    fn settle(&self, outcome: RpcOutcome) -> Result<(), ProtocolError> {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(tx) => {
                // The caller may have stopped waiting; that is not an error.
                let _ = tx.send(outcome);
                Ok(())
            }
            None => {
                error!(
                    correlation_id = %self.correlation_id,
                    scope = %self.scope,
                    "RPC context settled more than once"
                );
                Err(ProtocolError::InvalidRpcState {
                    correlation_id: self.correlation_id.clone(),
                })
            }
        }
    }
}

/// Concurrency-safe table of outstanding RPC calls.
///
/// Cloning the registry yields another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct RpcMessageRegistry {
    contexts: Arc<Mutex<HashMap<String, Arc<RpcMessageContext>>>>,
}

impl RpcMessageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle that registers and aborts calls within `scope`.
    pub fn scope(&self, scope: impl Into<String>) -> RpcScope {
        RpcScope {
            registry: self.clone(),
            id: scope.into(),
        }
    }

    /// Registers a new call in `scope` and returns the handle to await it.
    pub fn register(&self, scope: &str) -> PendingRpc {
        let (context, receiver) = RpcMessageContext::new(scope);
        self.table()
            .insert(context.correlation_id.clone(), Arc::clone(&context));

        debug!(correlation_id = %context.correlation_id, scope, "Registered RPC call");

        PendingRpc {
            context,
            receiver: Some(receiver),
            registry: self.clone(),
        }
    }

    /// Settles the call matching the envelope's correlation id.
    ///
    /// Returns `Ok(false)` when no call is waiting on that id, which happens when
    /// the caller already gave up or the call was settled elsewhere.
    pub fn set_response(&self, envelope: Envelope) -> Result<bool, ProtocolError> {
        match self.take(&envelope.correlation_id) {
            Some(context) => {
                context.set_response(envelope)?;
                Ok(true)
            }
            None => {
                debug!(
                    correlation_id = %envelope.correlation_id,
                    "Ignoring response for unknown correlation id"
                );
                Ok(false)
            }
        }
    }

    /// Settles the call `correlation_id` with a local failure. Unknown ids are ignored.
    pub fn abort_with_error(&self, correlation_id: &str, err: ProtocolError) -> bool {
        match self.take(correlation_id) {
            Some(context) => context.abort_with_error(err).is_ok(),
            None => false,
        }
    }

    /// Settles the call `correlation_id` with a remote failure. Unknown ids are ignored.
    pub fn abort_with_remote_error(&self, correlation_id: &str, message: &str) -> bool {
        match self.take(correlation_id) {
            Some(context) => context.abort_with_remote_error(message).is_ok(),
            None => false,
        }
    }

    /// Fails every call still pending in `scope`. Calls in other scopes are untouched.
    ///
    /// Returns the number of calls aborted.
    pub fn abort_scope_with_remote_error(&self, scope: &str, message: &str) -> usize {
        let drained: Vec<Arc<RpcMessageContext>> = {
            let mut table = self.table();
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, context)| context.scope == scope)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };

        let aborted = drained
            .iter()
            .filter(|context| context.abort_with_remote_error(message).is_ok())
            .count();

        if aborted > 0 {
            debug!(scope, aborted, reason = message, "Aborted pending RPC calls for scope");
        }
        aborted
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// Number of calls waiting for a response in `scope`.
    pub fn scope_pending_count(&self, scope: &str) -> usize {
        self.table()
            .values()
            .filter(|context| context.scope == scope)
            .count()
    }

    fn take(&self, correlation_id: &str) -> Option<Arc<RpcMessageContext>> {
        self.table().remove(correlation_id)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<RpcMessageContext>>> {
        // The table holds no invariant a panicking holder could break.
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry handle bound to one scope.
#[derive(Debug, Clone)]
pub struct RpcScope {
    registry: RpcMessageRegistry,
    id: String,
}

impl RpcScope {
    /// Scope identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The registry this scope belongs to.
    pub fn registry(&self) -> &RpcMessageRegistry {
        &self.registry
    }

    /// Registers a new call in this scope.
    pub fn register(&self) -> PendingRpc {
        self.registry.register(&self.id)
    }

    /// Fails every call still pending in this scope.
    pub fn abort_with_remote_error(&self, message: &str) -> usize {
        self.registry
            .abort_scope_with_remote_error(&self.id, message)
    }

    /// Number of calls waiting in this scope.
    pub fn pending_count(&self) -> usize {
        self.registry.scope_pending_count(&self.id)
    }
}

/// Caller-side handle to a registered call.
///
/// Dropping the handle before the call settles removes it from the registry.
#[derive(Debug)]
pub struct PendingRpc {
    context: Arc<RpcMessageContext>,
    receiver: Option<oneshot::Receiver<RpcOutcome>>,
    registry: RpcMessageRegistry,
}

impl PendingRpc {
    /// Correlation id to put on the outbound request.
    pub fn correlation_id(&self) -> &str {
        self.context.correlation_id()
    }

    /// The underlying context.
    pub fn context(&self) -> Arc<RpcMessageContext> {
        Arc::clone(&self.context)
    }

    /// Waits until the call settles.
    pub async fn wait(mut self) -> RpcOutcome {
        let receiver = self.receiver.take().ok_or_else(|| {
            ProtocolError::Aborted(format!("{} was already awaited", self.correlation_id()))
        })?;

        receiver.await.unwrap_or_else(|_| {
            Err(ProtocolError::Aborted(format!(
                "{} was dropped without a response",
                self.correlation_id()
            )))
        })
    }

    /// Waits until the call settles or `timeout` elapses.
    ///
    /// On timeout the call is removed from the registry so a late response is ignored.
    pub async fn wait_timeout(mut self, timeout: Duration) -> RpcOutcome {
        let receiver = self.receiver.take().ok_or_else(|| {
            ProtocolError::Aborted(format!("{} was already awaited", self.correlation_id()))
        })?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::Aborted(format!(
                "{} was dropped without a response",
                self.correlation_id()
            ))),
            Err(_) => {
                let err = ProtocolError::Timeout(format!(
                    "no response to {} after {:?}",
                    self.correlation_id(),
                    timeout
                ));
                self.registry
                    .abort_with_error(self.context.correlation_id(), err.clone());
                Err(err)
            }
        }
    }
}

impl Drop for PendingRpc {
    fn drop(&mut self) {
        if !self.context.is_settled() {
            self.registry.take(self.context.correlation_id());
        }
    }
}
