//! Per-kind mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{ChannelError, ConvergentError, Result};
use crate::job::CancellationSignal;

use super::kind::ResourceKind;

/// Exclusive access to the native facility of one resource kind.
///
/// Adapters hold a guard for exactly one collect or configure call. Clones
/// share the same locks, so one registry can be injected into several
/// agents that manage the same host.
#[derive(Debug, Clone, Default)]
pub struct KindLocks {
    locks: Arc<Mutex<HashMap<ResourceKind, Arc<AsyncMutex<()>>>>>,
}

/// Held lock for one resource kind; released on drop.
#[derive(Debug)]
pub struct KindGuard {
    kind: ResourceKind,
    _guard: OwnedMutexGuard<()>,
}

impl KindLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, kind: ResourceKind) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| ConvergentError::internal("kind lock registry poisoned"))?;
        Ok(Arc::clone(locks.entry(kind).or_default()))
    }

    /// Waits for the lock of `kind`.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the signal fires while waiting.
    pub async fn acquire(&self, kind: ResourceKind, cancel: &CancellationSignal) -> Result<KindGuard> {
        cancel.checkpoint()?;
        let lock = self.lock_for(kind)?;

        tokio::select! {
            guard = lock.lock_owned() => {
                debug!("Acquired {kind} lock");
                Ok(KindGuard { kind, _guard: guard })
            }
            () = cancel.cancelled() => Err(ConvergentError::Channel(ChannelError::Cancelled)),
        }
    }
}

impl KindGuard {
    /// Kind this guard locks.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_kind_is_exclusive() {
        let locks = KindLocks::new();
        let cancel = CancellationSignal::new();

        let guard = locks.acquire(ResourceKind::Service, &cancel).await.expect("first");
        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            locks.acquire(ResourceKind::Service, &cancel),
        )
        .await;
        assert!(blocked.is_err());

        let other = locks
            .acquire(ResourceKind::FirewallRule, &cancel)
            .await
            .expect("other kind");
        assert_eq!(other.kind(), ResourceKind::FirewallRule);

        drop(guard);
        locks
            .acquire(ResourceKind::Service, &cancel)
            .await
            .expect("released");
    }

    #[tokio::test]
    async fn test_waiting_is_cancellable() {
        let locks = KindLocks::new();
        let holder = CancellationSignal::new();
        let _guard = locks.acquire(ResourceKind::WebSite, &holder).await.expect("first");

        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = locks
            .acquire(ResourceKind::WebSite, &cancel)
            .await
            .expect_err("should be cancelled");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_clones_share_locks() {
        let locks = KindLocks::new();
        let shared = locks.clone();
        let cancel = CancellationSignal::new();

        let _guard = locks.acquire(ResourceKind::RegistryKey, &cancel).await.expect("first");
        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            shared.acquire(ResourceKind::RegistryKey, &cancel),
        )
        .await;
        assert!(blocked.is_err());
    }
}
