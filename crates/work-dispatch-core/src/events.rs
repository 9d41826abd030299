//! Engine event plumbing.
//!
//! Components report what happens to them (admissions, work outcomes,
//! breaker transitions, resizes) as typed events. A dispatcher carries one
//! listener collection per event family; listeners are the seam where
//! metric sinks, log forwarders, and test probes attach. Emission is
//! fire-and-forget: a listener can observe the engine but never stall or
//! crash it.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Implemented by every event family the engine emits.
pub trait DispatchEvent: Send + Sync + fmt::Debug {
    /// Short machine-readable kind, e.g. `"Enqueued"` or `"WorkCompleted"`.
    fn event_type(&self) -> &'static str;

    /// When the event happened.
    fn timestamp(&self) -> Instant;

    /// Name of the dispatcher instance the event belongs to.
    fn dispatcher(&self) -> &str;
}

/// Receives events of one family.
pub trait EventListener<E: DispatchEvent>: Send + Sync {
    /// Called once per emitted event.
    fn on_event(&self, event: &E);
}

/// An ordered set of listeners for one event family.
///
/// Cloning is cheap and shares the registered listeners; the queue, every
/// worker, and the processor hold clones of the collections built by the
/// dispatcher builder.
#[derive(Clone)]
pub struct EventListeners<E: DispatchEvent> {
    listeners: Vec<Arc<dyn EventListener<E>>>,
}

impl<E: DispatchEvent> EventListeners<E> {
    /// An empty collection; emitting into it is a no-op.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Registers a listener behind the others.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Delivers `event` to every listener, in registration order.
    ///
    /// Each listener runs under a panic shield: one that unwinds is noted
    /// (a warning under `tracing`, a fault counter under `metrics`) and the
    /// delivery moves on, so a broken sink costs at most its own
    /// observations.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let shielded = std::panic::AssertUnwindSafe(|| listener.on_event(event));
            if let Err(payload) = std::panic::catch_unwind(shielded) {
                note_listener_fault(event, payload);
            }
        }
    }

    /// True while nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: DispatchEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a closure as a listener. The closure's `&E` argument picks the
/// event family at the registration site.
pub struct FnListener<F>(F);

impl<F> FnListener<F> {
    /// Creates a listener from a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<E, F> EventListener<E> for FnListener<F>
where
    E: DispatchEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.0)(event)
    }
}

/// Records a listener panic without letting it travel further. The caught
/// payload stops here; under no enabled feature it is simply discarded.
fn note_listener_fault<E: DispatchEvent>(_event: &E, _payload: Box<dyn std::any::Any + Send>) {
    #[cfg(feature = "tracing")]
    tracing::warn!(
        dispatcher = _event.dispatcher(),
        event_type = _event.event_type(),
        reason = panic_reason(_payload.as_ref()),
        "event listener panicked; remaining listeners unaffected"
    );
    #[cfg(feature = "metrics")]
    metrics::counter!(
        "workdispatch_listener_faults_total",
        "dispatcher" => _event.dispatcher().to_string(),
        "event_type" => _event.event_type().to_string()
    )
    .increment(1);
}

#[cfg(feature = "tracing")]
fn panic_reason(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}
