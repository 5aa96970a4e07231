//! Inbound message routing.
//!
//! Requests and notifications that arrive *from* the peer are handed to an
//! [`InboundHandler`] owned by the session. [`MethodRouter`] is the stock
//! implementation: an explicit method-name → async handler table, one per
//! session, never process-wide.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::client::schema::methods;
use crate::wire::message::RpcError;

/// Boxed future returned by inbound handlers.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles messages initiated by the peer.
pub trait InboundHandler: Send + Sync {
    /// Answer a peer request. The returned value or error is written back
    /// as the response.
    fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> HandlerFuture<'_, Result<Value, RpcError>>;

    /// React to a peer notification. Nothing is written back.
    fn handle_notification(&self, method: &str, params: Option<Value>) -> HandlerFuture<'_, ()>;
}

type RequestRoute =
    Arc<dyn Fn(Option<Value>) -> HandlerFuture<'static, Result<Value, RpcError>> + Send + Sync>;
type NotificationRoute = Arc<dyn Fn(Option<Value>) -> HandlerFuture<'static, ()> + Send + Sync>;

/// Method-name keyed table of async handlers.
///
/// Requests without a route are answered with `-32601 method not found`;
/// notifications without a route are dropped.
#[derive(Clone, Default)]
pub struct MethodRouter {
    requests: HashMap<String, RequestRoute>,
    notifications: HashMap<String, NotificationRoute>,
}

impl MethodRouter {
    /// Empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for request `method`, replacing any previous one.
    #[must_use]
    pub fn route<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.requests
            .insert(method.into(), Arc::new(move |params| Box::pin(handler(params))));
        self
    }

    /// Register the handler for notification `method`.
    #[must_use]
    pub fn on_notification<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notifications
            .insert(method.into(), Arc::new(move |params| Box::pin(handler(params))));
        self
    }

    /// Whether a request route exists for `method`.
    #[must_use]
    pub fn has_route(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    /// Sorted request method names.
    #[must_use]
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.requests.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Debug for MethodRouter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut notifications: Vec<&str> = self.notifications.keys().map(String::as_str).collect();
        notifications.sort_unstable();
        f.debug_struct("MethodRouter")
            .field("requests", &self.methods())
            .field("notifications", &notifications)
            .finish()
    }
}

impl InboundHandler for MethodRouter {
    fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> HandlerFuture<'_, Result<Value, RpcError>> {
        if let Some(route) = self.requests.get(method) {
            return route(params);
        }

        warn!(method, "inbound request has no route, answering method not found");
        let err = RpcError::method_not_found(method);
        Box::pin(async move { Err(err) })
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) -> HandlerFuture<'_, ()> {
        if let Some(route) = self.notifications.get(method) {
            return route(params);
        }

        if method != methods::EXIT {
            debug!(method, "inbound notification has no route, dropping");
        }
        Box::pin(async {})
    }
}
