//! Beacon node assignment per validator and endpoint selection.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::persist::{blocking_io, write_json_atomic};
use crate::types::{BeaconNodeEndpoint, PublicKey};

#[derive(Debug, Error)]
pub enum EndpointStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Ordered beacon node assignment for each validator key.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn get(&self, public_key: &PublicKey) -> Result<Vec<BeaconNodeEndpoint>, EndpointStoreError>;

    /// Replace the endpoints assigned to `public_key`.
    async fn upsert(
        &self,
        public_key: &PublicKey,
        endpoints: Vec<BeaconNodeEndpoint>,
    ) -> Result<(), EndpointStoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryEndpointStore {
    endpoints: RwLock<HashMap<PublicKey, Vec<BeaconNodeEndpoint>>>,
}

impl MemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointStore for MemoryEndpointStore {
    async fn get(&self, public_key: &PublicKey) -> Result<Vec<BeaconNodeEndpoint>, EndpointStoreError> {
        Ok(self
            .endpoints
            .read()
            .get(public_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        public_key: &PublicKey,
        endpoints: Vec<BeaconNodeEndpoint>,
    ) -> Result<(), EndpointStoreError> {
        self.endpoints.write().insert(*public_key, endpoints);
        Ok(())
    }
}

/// JSON file keyed by `0x`-hex public key.
pub struct FileEndpointStore {
    path: PathBuf,
    endpoints: Mutex<BTreeMap<PublicKey, Vec<BeaconNodeEndpoint>>>,
}

impl FileEndpointStore {
    /// Open the store; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EndpointStoreError> {
        let path = path.into();
        let endpoints = if path.exists() {
            info!("Loading beacon node assignments from {:?}", path);
            serde_json::from_reader(BufReader::new(File::open(&path)?))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            endpoints: Mutex::new(endpoints),
        })
    }

    fn persist(
        &self,
        endpoints: &BTreeMap<PublicKey, Vec<BeaconNodeEndpoint>>,
    ) -> Result<(), EndpointStoreError> {
        blocking_io(|| write_json_atomic::<_, EndpointStoreError>(&self.path, endpoints))?;
        debug!("Persisted beacon node assignments to {:?}", self.path);
        Ok(())
    }
}

#[async_trait]
impl EndpointStore for FileEndpointStore {
    async fn get(&self, public_key: &PublicKey) -> Result<Vec<BeaconNodeEndpoint>, EndpointStoreError> {
        Ok(self
            .endpoints
            .lock()
            .get(public_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        public_key: &PublicKey,
        endpoints: Vec<BeaconNodeEndpoint>,
    ) -> Result<(), EndpointStoreError> {
        let mut current = self.endpoints.lock();
        let mut updated = current.clone();
        updated.insert(*public_key, endpoints);
        self.persist(&updated)?;
        *current = updated;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no beacon node configured for {public_key}")]
    NoEndpoint { public_key: PublicKey },

    #[error("endpoint store error: {0}")]
    Store(#[from] EndpointStoreError),
}

/// Picks the beacon node a validator talks to.
///
/// Always the first assigned node. There is no health checking and no
/// failover; moving a validator to another node is an explicit
/// [`EndpointStore::upsert`].
#[derive(Clone)]
pub struct EndpointSelector {
    store: Arc<dyn EndpointStore>,
}

impl EndpointSelector {
    pub fn new(store: Arc<dyn EndpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EndpointStore> {
        &self.store
    }

    pub async fn select(&self, public_key: &PublicKey) -> Result<BeaconNodeEndpoint, SelectError> {
        self.store
            .get(public_key)
            .await?
            .into_iter()
            .next()
            .ok_or(SelectError::NoEndpoint {
                public_key: *public_key,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes(&[byte; 48]).unwrap()
    }

    #[tokio::test]
    async fn test_select_first_endpoint() {
        let store = Arc::new(MemoryEndpointStore::new());
        store
            .upsert(
                &key(1),
                vec![
                    BeaconNodeEndpoint::new("http://first:5052"),
                    BeaconNodeEndpoint::new("http://second:5052"),
                ],
            )
            .await
            .unwrap();

        let selector = EndpointSelector::new(store);
        let endpoint = selector.select(&key(1)).await.unwrap();
        assert_eq!(endpoint.url, "http://first:5052");
    }

    #[tokio::test]
    async fn test_select_no_endpoint() {
        let store = Arc::new(MemoryEndpointStore::new());
        store.upsert(&key(2), Vec::new()).await.unwrap();
        let selector = EndpointSelector::new(store);

        assert!(matches!(
            selector.select(&key(1)).await,
            Err(SelectError::NoEndpoint { .. })
        ));
        assert!(matches!(
            selector.select(&key(2)).await,
            Err(SelectError::NoEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("beacons.json");

        {
            let store = FileEndpointStore::open(&path).unwrap();
            assert!(store.get(&key(1)).await.unwrap().is_empty());
            let mut node = BeaconNodeEndpoint::new("http://localhost:5052");
            node.container_id = Some("abc123".to_string());
            store.upsert(&key(1), vec![node]).await.unwrap();
        }

        let store = FileEndpointStore::open(&path).unwrap();
        let nodes = store.get(&key(1)).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].container_id.as_deref(), Some("abc123"));
    }
}
