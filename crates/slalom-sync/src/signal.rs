//! # Subscriber Registry
//!
//! `subscribe(handler) -> Subscription`. Each component owns its registry;
//! nothing attaches listeners to global objects.
//!
//! ```text
//! registry.subscribe(h1) ──► Subscription #1 ─┐
//! registry.subscribe(h2) ──► Subscription #2  │ drop / dispose()
//!                                             ▼
//! registry.emit(&value)  ──► h2(&value)     (h1 removed)
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

/// Registry of handlers notified on [`emit`](SubscriberRegistry::emit).
pub struct SubscriberRegistry<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        SubscriberRegistry {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }
}

/// Clones share the same handler set.
impl<T> Clone for SubscriberRegistry<T> {
    fn clone(&self) -> Self {
        SubscriberRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> SubscriberRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. It stays registered until the returned
    /// [`Subscription`] is disposed or dropped.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = match self.inner.lock() {
            Ok(mut inner) => {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.handlers.insert(id, Arc::new(handler));
                id
            }
            Err(_) => return Subscription::noop(),
        };

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            dispose: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(mut inner) = inner.lock() {
                        inner.handlers.remove(&id);
                    }
                }
            })),
        }
    }

    /// Calls every handler in subscription order.
    ///
    /// Handlers run outside the registry lock, so they may subscribe or
    /// dispose without deadlocking.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = match self.inner.lock() {
            Ok(inner) => inner.handlers.values().cloned().collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.handlers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposer returned by [`SubscriberRegistry::subscribe`].
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// A subscription that owns nothing.
    pub fn noop() -> Self {
        Subscription { dispose: None }
    }

    /// Removes the handler. Calling it twice is harmless.
    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_and_dispose() {
        let registry = SubscriberRegistry::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t = Arc::clone(&total);
        let mut sub = registry.subscribe(move |v| {
            t.fetch_add(*v as usize, Ordering::SeqCst);
        });
        registry.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 2);

        sub.dispose();
        sub.dispose();
        registry.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = SubscriberRegistry::<()>::new();
        {
            let _sub = registry.subscribe(|_| {});
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_dispose_after_registry_dropped() {
        let registry = SubscriberRegistry::<()>::new();
        let mut sub = registry.subscribe(|_| {});
        drop(registry);
        sub.dispose();
    }
}
