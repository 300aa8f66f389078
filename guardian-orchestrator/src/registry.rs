//! Registry of running validator services.
//!
//! At most one service exists per key. Each key has its own async lock;
//! the map holding those locks is only locked long enough to find or insert
//! a slot, so unrelated keys never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::service::{ServiceError, ValidatorService};
use crate::types::PublicKey;

type Slot = Arc<tokio::sync::Mutex<Option<Arc<dyn ValidatorService>>>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry conflict for {public_key}: {reason}")]
    Conflict { public_key: PublicKey, reason: String },

    #[error("service failed to start: {0}")]
    Start(#[source] ServiceError),
}

/// Result of [`RegistryEntry::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Created,
    Reused,
}

#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    slots: Arc<Mutex<HashMap<PublicKey, Slot>>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to the entry for `public_key`, waiting for any
    /// in-flight start or stop of the same key.
    pub async fn lock(&self, public_key: PublicKey) -> RegistryEntry {
        let slot = self.slots.lock().entry(public_key).or_default().clone();
        let guard = slot.lock_owned().await;
        RegistryEntry {
            guard,
            cleanup: SlotCleanup {
                public_key,
                slots: self.slots.clone(),
            },
        }
    }

    pub async fn ensure<F>(
        &self,
        public_key: PublicKey,
        create: F,
    ) -> Result<(Arc<dyn ValidatorService>, Ensured), RegistryError>
    where
        F: FnOnce() -> Result<Arc<dyn ValidatorService>, ServiceError>,
    {
        self.lock(public_key).await.ensure(create).await
    }

    pub async fn remove(
        &self,
        public_key: PublicKey,
    ) -> Result<Option<Arc<dyn ValidatorService>>, ServiceError> {
        self.lock(public_key).await.remove().await
    }

    pub async fn get(&self, public_key: PublicKey) -> Option<Arc<dyn ValidatorService>> {
        self.lock(public_key).await.current()
    }

    /// Keys with a running service. Entries in the middle of a start or stop
    /// are left out.
    pub fn running(&self) -> Vec<PublicKey> {
        let slots: Vec<(PublicKey, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(k, s)| (*k, s.clone()))
            .collect();
        let mut keys: Vec<PublicKey> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.try_lock()
                    .map(|s| matches!(&*s, Some(svc) if svc.is_running()))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys
    }
}

/// Held while a key is being started or stopped.
pub struct RegistryEntry {
    guard: OwnedMutexGuard<Option<Arc<dyn ValidatorService>>>,
    // Dropped after `guard`, so the slot is already unlocked when it runs.
    cleanup: SlotCleanup,
}

impl RegistryEntry {
    pub fn public_key(&self) -> &PublicKey {
        &self.cleanup.public_key
    }

    pub fn current(&self) -> Option<Arc<dyn ValidatorService>> {
        self.guard.clone()
    }

    pub fn is_occupied(&self) -> bool {
        self.guard.is_some()
    }

    /// Return the running service, or create, register and start one.
    ///
    /// The new service is registered before it is started and unregistered
    /// again if starting fails. An occupied entry whose service is not
    /// running is a conflict.
    pub async fn ensure<F>(&mut self, create: F) -> Result<(Arc<dyn ValidatorService>, Ensured), RegistryError>
    where
        F: FnOnce() -> Result<Arc<dyn ValidatorService>, ServiceError>,
    {
        if let Some(existing) = self.current() {
            if existing.is_running() {
                debug!(validator = %self.public_key().short(), "Reusing running validator service");
                return Ok((existing, Ensured::Reused));
            }
            return Err(RegistryError::Conflict {
                public_key: *self.public_key(),
                reason: "registered service is not running".to_string(),
            });
        }

        let service = create().map_err(RegistryError::Start)?;
        *self.guard = Some(service.clone());

        if let Err(e) = service.start().await {
            warn!(validator = %self.public_key().short(), error = %e, "Service start failed, rolling back registration");
            *self.guard = None;
            return Err(RegistryError::Start(e));
        }
        Ok((service, Ensured::Created))
    }

    /// Unregister and stop the service, if any. The entry is cleared even
    /// when stopping fails.
    pub async fn remove(&mut self) -> Result<Option<Arc<dyn ValidatorService>>, ServiceError> {
        let Some(service) = self.guard.take() else {
            return Ok(None);
        };
        service.stop().await?;
        Ok(Some(service))
    }
}

/// Drops the key's slot from the map once nothing holds or waits on it.
struct SlotCleanup {
    public_key: PublicKey,
    slots: Arc<Mutex<HashMap<PublicKey, Slot>>>,
}

impl Drop for SlotCleanup {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        let vacant = slots.get(&self.public_key).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().map(|s| s.is_none()).unwrap_or(false)
        });
        if vacant {
            slots.remove(&self.public_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_key, MockService};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn factory(
        created: &Arc<AtomicUsize>,
        public_key: PublicKey,
        fail: bool,
    ) -> impl FnOnce() -> Result<Arc<dyn ValidatorService>, ServiceError> {
        let created = created.clone();
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            let service = MockService::new(public_key)
                .with_start_delay(Duration::from_millis(20))
                .failing_start(fail);
            Ok(Arc::new(service) as Arc<dyn ValidatorService>)
        }
    }

    #[tokio::test]
    async fn test_ensure_creates_then_reuses() {
        let registry = ValidatorRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));

        let (_, first) = registry.ensure(test_key(1), factory(&created, test_key(1), false)).await.unwrap();
        let (_, second) = registry.ensure(test_key(1), factory(&created, test_key(1), false)).await.unwrap();
        assert_eq!(first, Ensured::Created);
        assert_eq!(second, Ensured::Reused);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.running(), vec![test_key(1)]);
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back() {
        let registry = ValidatorRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));

        let err = registry
            .ensure(test_key(1), factory(&created, test_key(1), true))
            .await
            .map(|(_, ensured)| ensured)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Start(_)));
        assert!(registry.get(test_key(1)).await.is_none());
        assert!(registry.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_single_service() {
        let registry = ValidatorRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let create = factory(&created, test_key(1), false);
                tokio::spawn(async move { registry.ensure(test_key(1), create).await.map(|(_, e)| e) })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.iter().filter(|e| **e == Ensured::Created).count(), 1);
    }

    #[tokio::test]
    async fn test_not_running_entry_is_conflict() {
        let registry = ValidatorRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let (service, _) = registry.ensure(test_key(1), factory(&created, test_key(1), false)).await.unwrap();

        // The service died behind the registry's back.
        service.stop().await.unwrap();
        let err = registry
            .ensure(test_key(1), factory(&created, test_key(1), false))
            .await
            .map(|(_, ensured)| ensured)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = ValidatorRegistry::new();
        assert!(registry.remove(test_key(1)).await.unwrap().is_none());

        let created = Arc::new(AtomicUsize::new(0));
        let (service, _) = registry.ensure(test_key(1), factory(&created, test_key(1), false)).await.unwrap();
        assert!(registry.remove(test_key(1)).await.unwrap().is_some());
        assert!(!service.is_running());
        assert!(registry.running().is_empty());
        assert!(registry.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let registry = ValidatorRegistry::new();
        let _held = registry.lock(test_key(1)).await;
        let other = tokio::time::timeout(Duration::from_millis(200), registry.lock(test_key(2))).await;
        assert!(other.is_ok());
    }
}
