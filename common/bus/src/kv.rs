use async_nats::jetstream::kv;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BusError;

/// Keyed blob store with bucket-level TTL, backing the dedup and join
/// stages. Keys are expected to be content-addressed (hashed) by callers so
/// they are always valid bucket keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BusError>;

    async fn put(&self, key: &str, value: Bytes) -> Result<(), BusError>;

    /// Store the value only if the key is absent; returns whether the write
    /// happened.
    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<bool, BusError>;

    async fn delete(&self, key: &str) -> Result<(), BusError>;
}

pub struct KvKeyStore {
    store: kv::Store,
}

impl KvKeyStore {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KeyStore for KvKeyStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BusError> {
        self.store.get(key).await.map_err(BusError::kv)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), BusError> {
        self.store.put(key, value).await.map_err(BusError::kv)?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<bool, BusError> {
        // an update against revision 0 only succeeds when the key is absent
        match self.store.update(key, value, 0).await {
            Ok(_) => Ok(true),
            Err(err) => match self.store.get(key).await {
                Ok(Some(_)) => Ok(false),
                _ => Err(BusError::kv(err)),
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BusError> {
        self.store.delete(key).await.map_err(BusError::kv)
    }
}
