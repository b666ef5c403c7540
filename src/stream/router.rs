//! Event type tag to handler registry.
//!
//! The registry is built once at startup and then read concurrently by the
//! receive loop. Registration takes the write lock, lookups take the read
//! lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::stream::client::SessionClient;
use crate::stream::proto::Event;

/// Future returned by [`Handler::serve_event`].
pub type HandlerFuture = BoxFuture<'static, ()>;

/// Logic invoked for inbound events whose type tag matches a registration.
///
/// Each matched event runs on its own spawned task; handlers receive a
/// shared read-only event and a client handle for replies.
pub trait Handler: Send + Sync + 'static {
    fn serve_event(&self, event: Arc<Event>, client: SessionClient) -> HandlerFuture;
}

/// Adapter that lets ordinary async closures act as a [`Handler`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps `f` as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Arc<Event>, SessionClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Arc<Event>, SessionClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve_event(&self, event: Arc<Event>, client: SessionClient) -> HandlerFuture {
        Box::pin((self.f)(event, client))
    }
}

/// One registration in the router.
#[derive(Clone)]
pub struct RouteEntry {
    event_type: String,
    handler: Arc<dyn Handler>,
    // Reserved for pattern registrations; every entry is exact today.
    explicit: bool,
}

impl RouteEntry {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("event_type", &self.event_type)
            .field("explicit", &self.explicit)
            .finish_non_exhaustive()
    }
}

/// Registration and strict lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Handlers cannot be registered for the empty type tag.
    #[error("invalid event type: type tag must be non-empty")]
    InvalidEventType,

    /// A handler is already registered for this type tag.
    #[error("multiple registrations for event type {0:?}")]
    DuplicateRegistration(String),

    /// Strict lookup found no handler.
    #[error("missing handler for event type {0:?}")]
    NoHandler(String),
}

/// Event multiplexer keyed by exact type tag.
#[derive(Default)]
pub struct EventRouter {
    routes: RwLock<HashMap<String, RouteEntry>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`.
    ///
    /// Fails on an empty tag or a tag that already has a handler; existing
    /// registrations are never overridden.
    pub fn handle<H>(&self, event_type: impl Into<String>, handler: H) -> Result<(), RouterError>
    where
        H: Handler,
    {
        self.insert(event_type.into(), Arc::new(handler))
    }

    /// Registers an async closure for `event_type`.
    pub fn handle_fn<F, Fut>(&self, event_type: impl Into<String>, f: F) -> Result<(), RouterError>
    where
        F: Fn(Arc<Event>, SessionClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle(event_type, handler_fn(f))
    }

    pub fn handle_arc(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RouterError> {
        self.insert(event_type.into(), handler)
    }

    fn insert(&self, event_type: String, handler: Arc<dyn Handler>) -> Result<(), RouterError> {
        if event_type.is_empty() {
            return Err(RouterError::InvalidEventType);
        }

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.get(&event_type).is_some_and(|entry| entry.explicit) {
            return Err(RouterError::DuplicateRegistration(event_type));
        }

        routes.insert(
            event_type.clone(),
            RouteEntry {
                event_type,
                handler,
                explicit: true,
            },
        );
        Ok(())
    }

    /// Returns the handler registered for `event_type`, if any.
    ///
    /// This is the dispatch path: an absent handler is an expected outcome.
    /// The empty tag never matches.
    pub fn lookup(&self, event_type: &str) -> Option<Arc<dyn Handler>> {
        if event_type.is_empty() {
            return None;
        }
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map(RouteEntry::handler)
    }

    /// Resolves `event_type` to its handler and the matched registration tag.
    pub fn resolve(&self, event_type: &str) -> Result<(Arc<dyn Handler>, String), RouterError> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        match routes.get(event_type) {
            Some(entry) if !event_type.is_empty() => {
                Ok((entry.handler(), entry.event_type.clone()))
            }
            _ => Err(RouterError::NoHandler(event_type.to_string())),
        }
    }

    pub fn entry(&self, event_type: &str) -> Option<RouteEntry> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.lookup(event_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered type tags, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("event_types", &self.event_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::{handler_fn, EventRouter, Handler, HandlerFuture, RouterError};
    use crate::stream::client::SessionClient;
    use crate::stream::proto::Event;

    struct NoopHandler;

    impl Handler for NoopHandler {
        fn serve_event(&self, _event: Arc<Event>, _client: SessionClient) -> HandlerFuture {
            Box::pin(async {})
        }
    }

    fn handler_addr(handler: &Arc<dyn Handler>) -> *const () {
        Arc::as_ptr(handler) as *const ()
    }

    #[test]
    fn handle_then_lookup_returns_registered_handler() {
        let router = EventRouter::new();
        let handler: Arc<dyn Handler> = Arc::new(NoopHandler);
        router
            .handle_arc("message", Arc::clone(&handler))
            .expect("register message");

        let found = router.lookup("message").expect("handler for message");
        assert_eq!(handler_addr(&found), handler_addr(&handler));

        let entry = router.entry("message").expect("entry");
        assert_eq!(entry.event_type(), "message");
        assert!(entry.is_explicit());
    }

    #[test]
    fn duplicate_registration_is_rejected_and_keeps_first() {
        let router = EventRouter::new();
        let first: Arc<dyn Handler> = Arc::new(NoopHandler);
        router
            .handle_arc("message", Arc::clone(&first))
            .expect("first registration");

        let error = router
            .handle("message", NoopHandler)
            .expect_err("second registration must fail");
        assert_eq!(
            error,
            RouterError::DuplicateRegistration("message".to_string())
        );

        let found = router.lookup("message").expect("handler");
        assert_eq!(handler_addr(&found), handler_addr(&first));
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn empty_type_tag_is_rejected() {
        let router = EventRouter::new();
        assert_eq!(
            router.handle("", NoopHandler),
            Err(RouterError::InvalidEventType)
        );
        assert_eq!(
            router.handle_fn("", |_event, _client| async {}),
            Err(RouterError::InvalidEventType)
        );
        assert!(router.is_empty());
        assert!(router.lookup("").is_none());
    }

    #[test]
    fn lookup_of_unregistered_type_is_absent() {
        let router = EventRouter::new();
        router.handle("message", NoopHandler).expect("register");

        assert!(router.lookup("unknown_x").is_none());
        assert!(!router.contains("unknown_x"));
        assert!(router.lookup("messag").is_none());
    }

    #[test]
    fn resolve_reports_missing_handler_as_error() {
        let router = EventRouter::new();
        router
            .handle("message", handler_fn(|_event, _client| async {}))
            .expect("register");

        let (_, matched) = router.resolve("message").expect("resolve message");
        assert_eq!(matched, "message");

        assert_eq!(
            router.resolve("unknown_x").err(),
            Some(RouterError::NoHandler("unknown_x".to_string()))
        );
        assert!(router.resolve("").is_err());
    }

    #[test]
    fn concurrent_registrations_are_all_recorded() {
        let router = Arc::new(EventRouter::new());
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let router = Arc::clone(&router);
                thread::spawn(move || {
                    for index in 0..16 {
                        router
                            .handle(format!("event_{worker}_{index}"), NoopHandler)
                            .expect("unique registration");
                        assert!(router.contains(&format!("event_{worker}_{index}")));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }

        assert_eq!(router.len(), 128);
        let types = router.event_types();
        assert_eq!(types.first().map(String::as_str), Some("event_0_0"));
    }

    #[test]
    fn concurrent_duplicate_registration_admits_exactly_one() {
        let router = Arc::new(EventRouter::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let router = Arc::clone(&router);
                thread::spawn(move || router.handle("message", NoopHandler).is_ok())
            })
            .collect();
        let accepted = workers
            .into_iter()
            .map(|worker| worker.join().expect("worker thread"))
            .filter(|accepted| *accepted)
            .count();

        assert_eq!(accepted, 1);
    }
}
