//! Named-event publish/subscribe bus.
//!
//! The bus carries every observable event the task core produces: streamed
//! reply chunks, block executions, results, tool calls, summaries.  Handlers
//! are plain closures registered under an event name; payloads are JSON
//! values so subscribers stay decoupled from producer types.
//!
//! Three delivery patterns are supported:
//!
//! | Pattern | Semantics |
//! |---------|-----------|
//! | [`EventBus::broadcast`] | fire-and-forget, return values ignored |
//! | [`EventBus::pipeline`]  | data threaded through handlers in order, handlers may mutate |
//! | [`EventBus::collect`]   | every handler's return value gathered into a list |
//!
//! The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`; share it by
//! handing out clones rather than through a global.
//!
//! # Example
//!
//! ```rust
//! # use opentask_kernel::bus::EventBus;
//! # use serde_json::json;
//! let bus = EventBus::new();
//! bus.register("result", |data| {
//!     data["seen"] = json!(true);
//!     None
//! });
//!
//! let mut payload = json!({"stdout": "hi"});
//! bus.pipeline("result", &mut payload);
//! assert_eq!(payload["seen"], true);
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Canonical names for the events the task core emits.
pub mod events {
    /// A task began processing its first instruction; payload is the user
    /// prompt envelope.
    pub const TASK_START: &str = "task_start";
    /// An incremental chunk of the streamed LLM reply.
    pub const RESPONSE_STREAM: &str = "response_stream";
    /// The full LLM reply finished arriving.
    pub const RESPONSE_COMPLETE: &str = "response_complete";
    /// A code block is about to execute.
    pub const EXEC: &str = "exec";
    /// A code block or tool call produced a result.
    pub const RESULT: &str = "result";
    /// The model requested an external tool invocation.  Pipeline
    /// subscribers may rewrite the call payload before dispatch.
    pub const TOOL_CALL: &str = "tool_call";
    /// Executing code asked the host to display an image.
    pub const DISPLAY: &str = "display";
    /// End-of-task usage summary line.
    pub const SUMMARY: &str = "summary";
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A registered event handler.
///
/// Handlers receive a mutable reference to the event payload.  The return
/// value is ignored by [`EventBus::broadcast`] and [`EventBus::pipeline`]
/// and gathered by [`EventBus::collect`].
pub type Handler = Arc<dyn Fn(&mut Value) -> Option<Value> + Send + Sync>;

/// A component that subscribes to a fixed set of events.
///
/// This is the static-language replacement for registering every `on_<event>`
/// method of a loaded plugin: implementors declare the event names they care
/// about and receive each matching payload through [`Subscriber::handle`].
pub trait Subscriber: Send + Sync {
    /// A short identifier used in log output.
    fn name(&self) -> &str;

    /// The event names this subscriber wants to receive.
    fn event_names(&self) -> Vec<&'static str>;

    /// Handle one event.  Mutations to `data` are visible to later pipeline
    /// handlers; the return value is only observed by `collect`.
    fn handle(&self, event: &str, data: &mut Value) -> Option<Value>;
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus keyed by event name.
///
/// Backed by [`DashMap`] so registration and delivery can happen from any
/// thread without a global lock.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<DashMap<String, Vec<Handler>>>,
}

impl EventBus {
    /// Create an empty bus with no handlers registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name.
    pub fn register<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&mut Value) -> Option<Value> + Send + Sync + 'static,
    {
        let event = event.into();
        tracing::debug!(event = %event, "handler registered");
        self.listeners
            .entry(event)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register every event a [`Subscriber`] declares.
    pub fn register_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        for event in subscriber.event_names() {
            let sub = Arc::clone(&subscriber);
            tracing::debug!(event, subscriber = %sub.name(), "subscriber registered");
            self.register(event, move |data: &mut Value| sub.handle(event, data));
        }
    }

    /// Fire-and-forget delivery: every handler sees the payload, return
    /// values are discarded.
    ///
    /// Returns the number of handlers invoked.
    pub fn broadcast(&self, event: &str, data: Value) -> usize {
        let mut data = data;
        let Some(handlers) = self.listeners.get(event) else {
            tracing::trace!(event, "broadcast with no handlers");
            return 0;
        };
        for handler in handlers.iter() {
            let _ = handler(&mut data);
        }
        handlers.len()
    }

    /// Thread `data` through every handler in registration order.  Handlers
    /// may mutate it; the caller observes the final state.
    pub fn pipeline(&self, event: &str, data: &mut Value) -> usize {
        let Some(handlers) = self.listeners.get(event) else {
            return 0;
        };
        for handler in handlers.iter() {
            let _ = handler(data);
        }
        handlers.len()
    }

    /// Invoke every handler with its own copy of the payload and gather the
    /// non-`None` return values.
    pub fn collect(&self, event: &str, data: &Value) -> Vec<Value> {
        let Some(handlers) = self.listeners.get(event) else {
            return Vec::new();
        };
        handlers
            .iter()
            .filter_map(|handler| {
                let mut copy = data.clone();
                handler(&mut copy)
            })
            .collect()
    }

    /// Number of handlers registered for an event.
    pub fn handler_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |h| h.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
