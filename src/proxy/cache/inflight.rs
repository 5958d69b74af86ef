use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::CacheKey;

/// Keys with a download in progress. At most one registration per key.
#[derive(Debug, Default)]
pub(super) struct InFlight {
    downloads: Mutex<HashMap<CacheKey, Arc<Notify>>>,
}

pub(super) enum Registration<'a> {
    /// The caller owns the download until the guard drops.
    Owner(InFlightGuard<'a>),
    /// Another task is downloading; its completion is signalled on this handle.
    Waiter(Arc<Notify>),
}

impl InFlight {
    pub(super) fn register(&self, key: &CacheKey) -> Registration<'_> {
        let mut guard = self.downloads.lock();
        if let Some(existing) = guard.get(key) {
            return Registration::Waiter(existing.clone());
        }
        let notify = Arc::new(Notify::new());
        guard.insert(key.clone(), notify.clone());
        Registration::Owner(InFlightGuard {
            registry: self,
            key: key.clone(),
            notify,
        })
    }

    /// Resolves once the registration behind `notify` has been released.
    pub(super) async fn wait(&self, key: &CacheKey, notify: &Arc<Notify>) {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // The owner unregisters before notifying, so an enabled waiter that still sees the
        // registration is guaranteed a wakeup.
        if self.is_current(key, notify) {
            notified.await;
        }
    }

    fn is_current(&self, key: &CacheKey, notify: &Arc<Notify>) -> bool {
        self.downloads
            .lock()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, notify))
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.downloads.lock().len()
    }
}

/// Releases the registration and wakes every waiter on all exit paths, cancellation included.
pub(super) struct InFlightGuard<'a> {
    registry: &'a InFlight,
    key: CacheKey,
    notify: Arc<Notify>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut guard = self.registry.downloads.lock();
            if guard
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.notify))
            {
                guard.remove(&self.key);
            }
        }
        self.notify.notify_waiters();
    }
}
