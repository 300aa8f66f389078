//! Lifecycle event bus.

use tokio::sync::broadcast;
use tracing::{trace, Span};

use crate::types::{BeaconNodeEndpoint, PublicKey, Root};

/// Events published by the coordinator and the validator services.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A validator service was started. `logger` is the span its duties log under.
    ValidatorStarted { public_key: PublicKey, logger: Span },
    ValidatorStopped { public_key: PublicKey },
    ValidatorBeaconNodesUpdated {
        public_key: PublicKey,
        nodes: Vec<BeaconNodeEndpoint>,
    },
    AttestationSigned {
        public_key: PublicKey,
        slot: u64,
        committee_index: u64,
        beacon_block_root: Root,
    },
}

impl LifecycleEvent {
    pub fn public_key(&self) -> &PublicKey {
        match self {
            LifecycleEvent::ValidatorStarted { public_key, .. }
            | LifecycleEvent::ValidatorStopped { public_key }
            | LifecycleEvent::ValidatorBeaconNodesUpdated { public_key, .. }
            | LifecycleEvent::AttestationSigned { public_key, .. } => public_key,
        }
    }
}

/// Cloneable handle to a broadcast channel of [`LifecycleEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is fine.
    pub fn publish(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            trace!("Lifecycle event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes(&[byte; 48]).unwrap()
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.publish(LifecycleEvent::ValidatorStopped { public_key: key(1) });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(LifecycleEvent::ValidatorStarted {
            public_key: key(1),
            logger: Span::none(),
        });
        bus.publish(LifecycleEvent::ValidatorStopped { public_key: key(1) });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, LifecycleEvent::ValidatorStarted { .. }));
        assert_eq!(first.public_key(), &key(1));
        assert!(matches!(
            rx.recv().await.unwrap(),
            LifecycleEvent::ValidatorStopped { .. }
        ));
    }
}
