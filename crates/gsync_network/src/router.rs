//! Message router — dispatches incoming frames to registered handlers.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::connection::ConnectionContext;
use crate::message::{Message, MessageKind};

/// Result type returned by message handlers.
pub type HandlerResult = anyhow::Result<()>;

/// A handler invoked with the decoded message and the context of the
/// connection it arrived on.
pub type MessageHandler =
    Arc<dyn Fn(Message, ConnectionContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message, ConnectionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |message, ctx| Box::pin(f(message, ctx)))
}

/// What happened to a dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A registered handler ran to completion.
    Handled,
    /// The router answered a built-in type itself.
    BuiltIn,
    /// No handler is registered for the type; the message was dropped.
    Unhandled,
    /// The frame was not a JSON object with a string `type`.
    Malformed,
    /// The handler returned an error or panicked.
    HandlerFailed,
}

/// Routes incoming messages to the handler registered for their `type`.
///
/// Registration is internally synchronized, so a router can be shared
/// between the server and client roles behind an `Arc`.
pub struct MessageRouter {
    handlers: RwLock<HashMap<String, MessageHandler>>,
}

impl MessageRouter {
    /// Create a new router with no handlers registered.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a message type, replacing any previous one.
    pub fn register(&self, kind: impl Into<MessageKind>, handler: MessageHandler) {
        let kind = kind.into();
        debug!("Registering handler for message type: {kind}");
        self.handlers
            .write()
            .insert(kind.dispatch_key().to_string(), handler);
    }

    /// Remove the handler for a message type.
    pub fn unregister(&self, kind: impl Into<MessageKind>) -> bool {
        let kind = kind.into();
        self.handlers.write().remove(kind.dispatch_key()).is_some()
    }

    /// Check if a handler is registered for a message type.
    pub fn has_handler(&self, kind: impl Into<MessageKind>) -> bool {
        let kind = kind.into();
        self.handlers.read().contains_key(kind.dispatch_key())
    }

    /// Return the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Decode a raw frame and dispatch it. Never fails: malformed frames are
    /// logged and dropped so the connection they came from stays open.
    pub async fn dispatch(&self, raw: &[u8], ctx: ConnectionContext) -> DispatchOutcome {
        match Message::from_slice(raw) {
            Ok(message) => self.dispatch_message(message, ctx).await,
            Err(e) => {
                warn!(
                    "Dropping malformed message from {} ({}): {e}",
                    ctx.connection_id(),
                    ctx.remote_addr()
                );
                DispatchOutcome::Malformed
            }
        }
    }

    /// Like [`dispatch`](Self::dispatch), but abandons the handler as soon as
    /// `shutdown` fires. Returns `None` when it was abandoned.
    pub(crate) async fn dispatch_until(
        &self,
        raw: &[u8],
        ctx: ConnectionContext,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<DispatchOutcome> {
        tokio::select! {
            outcome = self.dispatch(raw, ctx) => Some(outcome),
            _ = shutdown.recv() => None,
        }
    }

    /// Dispatch an already-decoded message.
    pub async fn dispatch_message(&self, message: Message, ctx: ConnectionContext) -> DispatchOutcome {
        let key = message.kind.dispatch_key().to_string();
        debug!("Received {key} from {}", ctx.connection_id());

        let handler = self.handlers.read().get(&key).cloned();
        if let Some(handler) = handler {
            let from = ctx.connection_id().clone();
            let run = async move { handler(message, ctx).await };
            return match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => DispatchOutcome::Handled,
                Ok(Err(e)) => {
                    error!("Handler for {key} failed on message from {from}: {e:#}");
                    DispatchOutcome::HandlerFailed
                }
                Err(_) => {
                    error!("Handler for {key} panicked on message from {from}");
                    DispatchOutcome::HandlerFailed
                }
            };
        }

        match message.kind {
            MessageKind::Ping => {
                if let Err(e) = ctx.reply(&Message::pong()).await {
                    debug!("Pong to {} failed: {e}", ctx.connection_id());
                }
                DispatchOutcome::BuiltIn
            }
            MessageKind::Pong | MessageKind::ConnectionEstablished => {
                debug!("No handler for {key}, ignoring");
                DispatchOutcome::Unhandled
            }
            _ => {
                warn!("No handler for message type: {key}");
                DispatchOutcome::Unhandled
            }
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
