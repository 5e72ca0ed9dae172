//! Subscriber lists with cancellable handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<E>)>>,
}

/// A list of callbacks notified with events of type `E`
pub struct Subscribers<E> {
    registry: Arc<Registry<E>>,
}

impl<E: 'static> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a callback. It stays registered until the returned handle is
    /// dropped or cancelled.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.callbacks).push((id, Arc::new(callback)));

        let weak: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry.callbacks).retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Call every registered callback.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// cancel without deadlocking.
    pub fn notify(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = lock(&self.registry.callbacks)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registry.callbacks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Subscribers::subscribe`]; unsubscribes on drop
#[must_use = "dropping the subscription immediately unsubscribes"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe now
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
