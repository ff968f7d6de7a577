//! Path handler table and guarded dispatch.
//!
//! Each path maps to exactly one [`PathHandler`], fixed at startup. Every
//! callback runs under a timeout with panics contained, so a misbehaving
//! handler can fail its own call but never the connection task driving it.
//! Failures of `on_open`, `on_message` and `on_close` are reported back to
//! the same handler's `on_error`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use switchboard_core::{HandlerError, SessionFault};
use tracing::{error, warn};

use crate::broadcast::Broadcaster;
use crate::metrics::{HANDLER_DURATION_SECONDS, HANDLER_ERRORS_TOTAL};
use crate::session::Session;

/// Default upper bound on a single handler callback.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Capabilities handed to handlers on every callback.
#[derive(Clone)]
pub struct HandlerContext {
    /// Local and cluster-wide delivery.
    pub broadcaster: Broadcaster,
}

/// Application logic for one path.
#[async_trait]
pub trait PathHandler: Send + Sync {
    /// A session was accepted on this path.
    async fn on_open(&self, _cx: &HandlerContext, _session: &Arc<Session>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A text message arrived from the session.
    async fn on_message(
        &self,
        cx: &HandlerContext,
        session: &Arc<Session>,
        text: &str,
    ) -> Result<(), HandlerError>;

    /// The session is gone. Called once per session.
    async fn on_close(&self, _cx: &HandlerContext, _session: &Arc<Session>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A transport or handler failure on this session.
    async fn on_error(&self, _cx: &HandlerContext, _session: &Arc<Session>, _fault: &SessionFault) {}
}

/// Lifecycle event names used in logs and metric labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    Open,
    Message,
    Close,
    Error,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Message => "message",
            Self::Close => "close",
            Self::Error => "error",
        }
    }
}

/// Exact-match path → handler table.
pub struct MessageDispatcher {
    handlers: HashMap<String, Arc<dyn PathHandler>>,
    timeout: Duration,
}

impl MessageDispatcher {
    /// Empty table with the default handler timeout.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Set the per-callback timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register `handler` for `path`, replacing any previous one.
    pub fn register(&mut self, path: &str, handler: impl PathHandler + 'static) {
        let _ = self.handlers.insert(path.to_owned(), Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn route(mut self, path: &str, handler: impl PathHandler + 'static) -> Self {
        self.register(path, handler);
        self
    }

    /// Whether a handler exists for `path`.
    pub fn has_path(&self, path: &str) -> bool {
        self.handlers.contains_key(path)
    }

    /// Registered paths (sorted).
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.handlers.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Deliver `on_open`.
    pub async fn open(&self, cx: &HandlerContext, session: &Arc<Session>) -> Result<(), HandlerError> {
        let Some(handler) = self.handler_for(session) else {
            return Err(HandlerError::failed("no handler for path"));
        };
        let result = self.guarded(Event::Open, handler.on_open(cx, session)).await;
        self.report(handler, cx, session, Event::Open, result).await
    }

    /// Deliver `on_message`.
    pub async fn message(
        &self,
        cx: &HandlerContext,
        session: &Arc<Session>,
        text: &str,
    ) -> Result<(), HandlerError> {
        let Some(handler) = self.handler_for(session) else {
            return Err(HandlerError::failed("no handler for path"));
        };
        let result = self
            .guarded(Event::Message, handler.on_message(cx, session, text))
            .await;
        self.report(handler, cx, session, Event::Message, result).await
    }

    /// Deliver `on_close`.
    pub async fn close(&self, cx: &HandlerContext, session: &Arc<Session>) -> Result<(), HandlerError> {
        let Some(handler) = self.handler_for(session) else {
            return Err(HandlerError::failed("no handler for path"));
        };
        let result = self.guarded(Event::Close, handler.on_close(cx, session)).await;
        self.report(handler, cx, session, Event::Close, result).await
    }

    /// Deliver `on_error` for a fault raised outside a handler.
    pub async fn error(&self, cx: &HandlerContext, session: &Arc<Session>, fault: &SessionFault) {
        let Some(handler) = self.handler_for(session) else {
            return;
        };
        self.deliver_error(handler, cx, session, fault).await;
    }

    fn handler_for(&self, session: &Session) -> Option<&Arc<dyn PathHandler>> {
        let handler = self.handlers.get(session.path());
        if handler.is_none() {
            warn!(session_id = %session.id(), path = session.path(), "no handler for path");
        }
        handler
    }

    async fn guarded<F>(&self, event: Event, call: F) -> Result<(), HandlerError>
    where
        F: Future<Output = Result<(), HandlerError>> + Send,
    {
        let start = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(self.timeout, AssertUnwindSafe(call).catch_unwind()).await;
        histogram!(HANDLER_DURATION_SECONDS, "event" => event.as_str())
            .record(start.elapsed().as_secs_f64());

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
            Err(_elapsed) => Err(HandlerError::TimedOut(self.timeout)),
        };
        if let Err(err) = &result {
            counter!(
                HANDLER_ERRORS_TOTAL,
                "event" => event.as_str(),
                "kind" => err.error_kind()
            )
            .increment(1);
        }
        result
    }

    async fn report(
        &self,
        handler: &Arc<dyn PathHandler>,
        cx: &HandlerContext,
        session: &Arc<Session>,
        event: Event,
        result: Result<(), HandlerError>,
    ) -> Result<(), HandlerError> {
        if let Err(err) = &result {
            warn!(
                session_id = %session.id(),
                path = session.path(),
                event = event.as_str(),
                error = %err,
                "handler failed"
            );
            let fault = SessionFault::Handler(err.clone());
            self.deliver_error(handler, cx, session, &fault).await;
        }
        result
    }

    async fn deliver_error(
        &self,
        handler: &Arc<dyn PathHandler>,
        cx: &HandlerContext,
        session: &Arc<Session>,
        fault: &SessionFault,
    ) {
        let call = async {
            handler.on_error(cx, session, fault).await;
            Ok::<(), HandlerError>(())
        };
        if let Err(err) = self.guarded(Event::Error, call).await {
            error!(
                session_id = %session.id(),
                path = session.path(),
                error = %err,
                "on_error handler failed"
            );
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
