// src/services/store_service.rs
use async_trait::async_trait;
use redis::Client;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::errors::{SparrowError as AppError, SparrowResult};
use crate::models::driver::Driver;
use crate::models::ids::{DriverId, PartyRef, ReviewId, RideId, UserId};
use crate::models::ride::Ride;
use crate::models::user::User;

// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    pub namespace: String,
    pub max_cas_retries: u32,
    pub cas_backoff_initial: Duration,
    pub cas_backoff_max: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: "sparrow".to_string(),
            max_cas_retries: 32,
            cas_backoff_initial: Duration::from_millis(1),
            cas_backoff_max: Duration::from_millis(50),
        }
    }
}

// Key strategies
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Simple(String),
    Composite(Vec<String>),
}

impl StoreKey {
    pub fn render(&self) -> String {
        match self {
            StoreKey::Simple(key) => key.clone(),
            StoreKey::Composite(parts) => parts.join(":"),
        }
    }
}

/// Documents that carry a per-document version, bumped on every write.
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! versioned {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Versioned for $ty {
                fn version(&self) -> u64 {
                    self.version
                }

                fn set_version(&mut self, version: u64) {
                    self.version = version;
                }
            }
        )+
    };
}

versioned!(Ride, Driver, User);

// ------------------------------
// Raw operations, split by concern
// ------------------------------

#[async_trait]
pub trait DocumentOperations: Send + Sync {
    async fn get_raw(&self, key: &StoreKey) -> Result<Option<String>, StoreError>;
    async fn set_raw(&self, key: &StoreKey, value: String) -> Result<(), StoreError>;
    /// Write `value` only if the current content equals `expected`
    /// (`None` = key absent). Check and write are one atomic step.
    async fn compare_and_set(
        &self,
        key: &StoreKey,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError>;
    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SetOperations: Send + Sync {
    async fn sadd(&self, key: &StoreKey, value: &str) -> Result<(), StoreError>;
    async fn smembers(&self, key: &StoreKey) -> Result<Vec<String>, StoreError>;
    async fn srem(&self, key: &StoreKey, value: &str) -> Result<(), StoreError>;
}

// Enum to wrap different store implementations
pub enum Store {
    Redis(RedisStore),
    Memory(MemoryStore),
}

// Redis-based store implementation
pub struct RedisStore {
    client: Client,
    namespace: String,
    cas_script: redis::Script,
}

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
else
  if current ~= ARGV[2] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

impl RedisStore {
    pub async fn new(redis_url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let instance = Self {
            client,
            namespace: namespace.to_string(),
            cas_script: redis::Script::new(CAS_SCRIPT),
        };

        // Fail fast on a bad URL or unreachable server
        let mut conn = instance.get_connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(instance)
    }

    async fn get_connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn full_key(&self, key: &StoreKey) -> String {
        format!("{}:{}", self.namespace, key.render())
    }
}

#[async_trait]
impl DocumentOperations for RedisStore {
    async fn get_raw(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)
    }

    async fn set_raw(&self, key: &StoreKey, value: String) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &StoreKey,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        let mut conn = self.get_connection().await?;
        let (flag, expected) = match expected {
            Some(current) => ("1", current),
            None => ("0", ""),
        };
        let swapped: i32 = self
            .cas_script
            .key(self.full_key(key))
            .arg(flag)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SetOperations for RedisStore {
    async fn sadd(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SADD")
            .arg(self.full_key(key))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &StoreKey) -> Result<Vec<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn srem(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SREM")
            .arg(self.full_key(key))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

// Memory store for development/testing
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, String>>,
    sets: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentOperations for MemoryStore {
    async fn get_raw(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        Ok(self.documents.read().await.get(&key.render()).cloned())
    }

    async fn set_raw(&self, key: &StoreKey, value: String) -> Result<(), StoreError> {
        self.documents.write().await.insert(key.render(), value);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &StoreKey,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        let mut documents = self.documents.write().await;
        let key = key.render();
        if documents.get(&key).map(String::as_str) != expected {
            return Ok(false);
        }
        documents.insert(key, value);
        Ok(true)
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.documents.write().await.remove(&key.render());
        Ok(())
    }
}

#[async_trait]
impl SetOperations for MemoryStore {
    async fn sadd(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        self.sets
            .write()
            .await
            .entry(key.render())
            .or_default()
            .insert(value.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &StoreKey) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .read()
            .await
            .get(&key.render())
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn srem(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        if let Some(members) = self.sets.write().await.get_mut(&key.render()) {
            members.remove(value);
        }
        Ok(())
    }
}

// Error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation error: {0}")]
    Operation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Gave up after repeated write conflicts on {0}")]
    Contention(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError | redis::ErrorKind::AuthenticationFailed => {
                StoreError::Connection(err.to_string())
            }
            _ => StoreError::Operation(err.to_string()),
        }
    }
}

// Key generators for different resources
pub struct StoreKeys;

impl StoreKeys {
    pub fn ride(ride_id: &RideId) -> StoreKey {
        StoreKey::Composite(vec!["ride".to_string(), ride_id.to_string()])
    }

    pub fn driver(driver_id: &DriverId) -> StoreKey {
        StoreKey::Composite(vec!["driver".to_string(), driver_id.to_string()])
    }

    pub fn user(user_id: &UserId) -> StoreKey {
        StoreKey::Composite(vec!["user".to_string(), user_id.to_string()])
    }

    pub fn matching_session(ride_id: &RideId) -> StoreKey {
        StoreKey::Composite(vec!["matching".to_string(), ride_id.to_string()])
    }

    pub fn settlement(ride_id: &RideId) -> StoreKey {
        StoreKey::Composite(vec!["settlement".to_string(), ride_id.to_string()])
    }

    pub fn review(review_id: &ReviewId) -> StoreKey {
        StoreKey::Composite(vec!["review".to_string(), review_id.to_string()])
    }

    pub fn all_drivers() -> StoreKey {
        StoreKey::Simple("drivers:all".to_string())
    }

    /// Searching rides that found no candidate on their last dispatch.
    pub fn waiting_rides() -> StoreKey {
        StoreKey::Simple("rides:waiting".to_string())
    }

    pub fn rides_by_passenger(user_id: &UserId) -> StoreKey {
        StoreKey::Composite(vec!["rides".to_string(), "passenger".to_string(), user_id.to_string()])
    }

    pub fn rides_by_driver(driver_id: &DriverId) -> StoreKey {
        StoreKey::Composite(vec!["rides".to_string(), "driver".to_string(), driver_id.to_string()])
    }

    pub fn reviews_for(party: &PartyRef) -> StoreKey {
        StoreKey::Composite(vec!["reviews".to_string(), party.key_fragment()])
    }

    pub fn party(party: &PartyRef) -> StoreKey {
        match party {
            PartyRef::Passenger(id) => Self::user(id),
            PartyRef::Driver(id) => Self::driver(id),
        }
    }
}

// ------------------------------
// Enum delegations (Store)
// ------------------------------

#[async_trait]
impl DocumentOperations for Store {
    async fn get_raw(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        match self {
            Store::Redis(store) => store.get_raw(key).await,
            Store::Memory(store) => store.get_raw(key).await,
        }
    }

    async fn set_raw(&self, key: &StoreKey, value: String) -> Result<(), StoreError> {
        match self {
            Store::Redis(store) => store.set_raw(key, value).await,
            Store::Memory(store) => store.set_raw(key, value).await,
        }
    }

    async fn compare_and_set(
        &self,
        key: &StoreKey,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        match self {
            Store::Redis(store) => store.compare_and_set(key, expected, value).await,
            Store::Memory(store) => store.compare_and_set(key, expected, value).await,
        }
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        match self {
            Store::Redis(store) => store.delete(key).await,
            Store::Memory(store) => store.delete(key).await,
        }
    }
}

#[async_trait]
impl SetOperations for Store {
    async fn sadd(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        match self {
            Store::Redis(store) => store.sadd(key, value).await,
            Store::Memory(store) => store.sadd(key, value).await,
        }
    }

    async fn smembers(&self, key: &StoreKey) -> Result<Vec<String>, StoreError> {
        match self {
            Store::Redis(store) => store.smembers(key).await,
            Store::Memory(store) => store.smembers(key).await,
        }
    }

    async fn srem(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        match self {
            Store::Redis(store) => store.srem(key, value).await,
            Store::Memory(store) => store.srem(key, value).await,
        }
    }
}

// ------------------------------
// Typed service wrapper
// ------------------------------

pub struct StoreService {
    store: Store,
    config: StoreConfig,
}

impl StoreService {
    pub async fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let store = match &config.redis_url {
            Some(url) => Store::Redis(RedisStore::new(url, &config.namespace).await?),
            None => {
                tracing::warn!("No Redis URL configured, using in-memory store");
                Store::Memory(MemoryStore::new())
            }
        };
        Ok(Self { store, config })
    }

    pub fn new_memory() -> Self {
        Self {
            store: Store::Memory(MemoryStore::new()),
            config: StoreConfig::default(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.store {
            Store::Redis(_) => "redis",
            Store::Memory(_) => "memory",
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &StoreKey) -> SparrowResult<Option<T>> {
        match self.store.get_raw(key).await? {
            Some(json) => Ok(Some(decode(&json)?)),
            None => Ok(None),
        }
    }

    /// Create a document. Fails with `Conflict` if the key already exists.
    pub async fn insert<T: Serialize + Versioned>(&self, key: &StoreKey, value: &mut T) -> SparrowResult<()> {
        value.set_version(1);
        let json = encode(value)?;
        if !self.store.compare_and_set(key, None, json).await? {
            return Err(AppError::Conflict(format!("{} already exists", key.render())));
        }
        Ok(())
    }

    /// Unconditional write, for documents with a single writer.
    pub async fn put<T: Serialize>(&self, key: &StoreKey, value: &T) -> SparrowResult<()> {
        self.store.set_raw(key, encode(value)?).await?;
        Ok(())
    }

    /// Optimistic read-modify-write over one document.
    ///
    /// `apply` gets the current document and either mutates it and returns a
    /// result, or fails, in which case nothing is written. If another writer
    /// got in between the read and the write, the document is re-read and
    /// `apply` runs again on the fresh copy. Returns the committed document.
    pub async fn transact<T, R, F>(&self, key: &StoreKey, mut apply: F) -> SparrowResult<(T, R)>
    where
        T: Serialize + DeserializeOwned + Versioned + Send,
        R: Send,
        F: FnMut(&mut T) -> SparrowResult<R> + Send,
    {
        let mut backoff = self.config.cas_backoff_initial;
        for attempt in 0..self.config.max_cas_retries {
            let current = self
                .store
                .get_raw(key)
                .await?
                .ok_or_else(|| AppError::not_found(key.render()))?;
            let mut document: T = decode(&current)?;

            let result = apply(&mut document)?;
            document.set_version(document.version() + 1);
            let next = encode(&document)?;

            if self.store.compare_and_set(key, Some(&current), next).await? {
                return Ok((document, result));
            }

            tracing::debug!("Write conflict on {} (attempt {}), retrying", key.render(), attempt + 1);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.cas_backoff_max);
        }
        Err(StoreError::Contention(key.render()).into())
    }

    pub async fn delete(&self, key: &StoreKey) -> SparrowResult<()> {
        self.store.delete(key).await?;
        Ok(())
    }

    pub async fn add_to_index(&self, key: &StoreKey, member: &str) -> SparrowResult<()> {
        self.store.sadd(key, member).await?;
        Ok(())
    }

    pub async fn index_members(&self, key: &StoreKey) -> SparrowResult<Vec<String>> {
        Ok(self.store.smembers(key).await?)
    }

    pub async fn remove_from_index(&self, key: &StoreKey, member: &str) -> SparrowResult<()> {
        self.store.srem(key, member).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> SparrowResult<bool> {
        let key = StoreKey::Simple("health:check".to_string());
        self.store.set_raw(&key, "ok".to_string()).await?;
        Ok(self.store.get_raw(&key).await?.as_deref() == Some("ok"))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    struct Counter {
        value: u32,
        version: u64,
    }

    impl Versioned for Counter {
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn key() -> StoreKey {
        StoreKey::Simple("counter".to_string())
    }

    #[tokio::test]
    async fn insert_refuses_existing_key() {
        let store = StoreService::new_memory();
        store.insert(&key(), &mut Counter { value: 0, version: 0 }).await.unwrap();
        let err = store
            .insert(&key(), &mut Counter { value: 9, version: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let stored: Counter = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(stored, Counter { value: 0, version: 1 });
    }

    #[tokio::test]
    async fn transact_bumps_version() {
        let store = StoreService::new_memory();
        store.insert(&key(), &mut Counter { value: 0, version: 0 }).await.unwrap();
        let (doc, ()) = store
            .transact(&key(), |c: &mut Counter| {
                c.value += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(doc.value, 1);
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn failed_apply_writes_nothing() {
        let store = StoreService::new_memory();
        store.insert(&key(), &mut Counter { value: 5, version: 0 }).await.unwrap();
        let err = store
            .transact(&key(), |c: &mut Counter| -> SparrowResult<()> {
                c.value = 99;
                Err(AppError::Conflict("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let stored: Counter = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.value, 5);
    }

    #[tokio::test]
    async fn transact_on_missing_document_is_not_found() {
        let store = StoreService::new_memory();
        let err = store
            .transact(&key(), |_: &mut Counter| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transactions_lose_no_updates() {
        let store = Arc::new(StoreService::new_memory());
        store.insert(&key(), &mut Counter { value: 0, version: 0 }).await.unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .transact(&key(), |c: &mut Counter| {
                            c.value += 1;
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let stored: Counter = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.value, 20);
        assert_eq!(stored.version, 21);
    }

    #[tokio::test]
    async fn memory_sets() {
        let store = MemoryStore::new();
        let k = StoreKeys::all_drivers();
        store.sadd(&k, "b").await.unwrap();
        store.sadd(&k, "a").await.unwrap();
        store.sadd(&k, "a").await.unwrap();
        assert_eq!(store.smembers(&k).await.unwrap(), vec!["a", "b"]);
        store.srem(&k, "a").await.unwrap();
        assert_eq!(store.smembers(&k).await.unwrap(), vec!["b"]);
    }

    #[test]
    fn key_rendering() {
        let ride = RideId::from("rid-250101-a1b2c");
        assert_eq!(StoreKeys::ride(&ride).render(), "ride:rid-250101-a1b2c");
        let party = PartyRef::Driver(DriverId::from("drv-250101-a1b2c"));
        assert_eq!(StoreKeys::reviews_for(&party).render(), "reviews:driver:drv-250101-a1b2c");
    }
}
