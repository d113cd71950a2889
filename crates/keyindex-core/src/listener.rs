//! Listener registry — per-event-kind callback lists with exact-match removal.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{EventKind, Notification};

/// Optional state bound to a callback at registration time.
pub type Context = Arc<dyn Any + Send + Sync>;

/// A user callback. Receives the bound context (if any) and the notification.
pub type Callback = Arc<dyn Fn(Option<&Context>, &Notification) + Send + Sync>;

/// The concrete target invoked for a registration, with its context bound.
pub type Invocable = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Wrap a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(Option<&Context>, &Notification) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a value as a [`Context`].
pub fn context<T: Any + Send + Sync>(value: T) -> Context {
    Arc::new(value)
}

/// Pointer identity, ignoring vtable metadata.
fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn same_context(a: Option<&Context>, b: Option<&Context>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => same(a, b),
        _ => false,
    }
}

struct Registration {
    callback: Callback,
    context: Option<Context>,
    invocable: Invocable,
}

/// Registry of listeners keyed by [`EventKind`].
///
/// Registering the same `(callback, context)` pair twice creates two
/// independent entries; [`remove`](Self::remove) drops every match at once.
pub struct ListenerRegistry {
    listeners: HashMap<EventKind, Vec<Registration>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }

    /// Register a callback and return the invocable that will be called.
    pub fn add(&mut self, kind: EventKind, callback: Callback, context: Option<Context>) -> Invocable {
        let cb = Arc::clone(&callback);
        let bound = context.clone();
        let invocable: Invocable = Arc::new(move |n: &Notification| cb(bound.as_ref(), n));
        self.listeners.entry(kind).or_default().push(Registration {
            callback,
            context,
            invocable: Arc::clone(&invocable),
        });
        invocable
    }

    /// Remove every registration matching `(callback, context)` under `kind`.
    ///
    /// Returns the number of registrations removed.
    pub fn remove(&mut self, kind: EventKind, callback: &Callback, context: Option<&Context>) -> usize {
        let Some(list) = self.listeners.get_mut(&kind) else {
            return 0;
        };
        let before = list.len();
        list.retain(|r| !(same(&r.callback, callback) && same_context(r.context.as_ref(), context)));
        before - list.len()
    }

    /// Snapshot of the invocables registered under `kind`, in registration order.
    pub fn invocables(&self, kind: EventKind) -> Vec<Invocable> {
        self.listeners
            .get(&kind)
            .map(|list| list.iter().map(|r| Arc::clone(&r.invocable)).collect())
            .unwrap_or_default()
    }

    /// Number of registrations under `kind`.
    pub fn len(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Returns `true` if no listener is registered under any kind.
    pub fn is_empty(&self) -> bool {
        self.listeners.values().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
