//! Shared fixtures for the kernel integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keystone_core::{
    CacheValue, CoreError, Entity, EntityIdentity, Filter, ManualClock, PrimaryKey, Provenance,
    Record, RecordExt, StorageKey, CACHED_ON_FIELD, CHECKSUM_FIELD,
};
use keystone_kernel::{BufferedSink, EntityFetcher, KernelConfig, LockCoordinator};
use keystone_storage::{
    CacheError, Checksummer, DurableStore, InMemoryCache, InMemoryStore, SharedCache,
    StorageError,
};

pub const SECRET: &[u8] = b"integration secret";

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub balance: i64,
    /// Runtime-only: never reaches the shared cache.
    pub session: Option<String>,
    pub checksum: Option<String>,
    pub cached_on: Option<i64>,
}

impl Entity for User {
    const COLLECTION: &'static str = "users";

    fn primary_key(&self) -> PrimaryKey {
        PrimaryKey::Int(self.id)
    }

    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), self.id.into());
        r.insert("username".into(), self.username.clone().into());
        r.insert("email".into(), self.email.clone().into());
        r.insert("balance".into(), self.balance.into());
        r.insert("session".into(), self.session.clone().into());
        r.insert(CHECKSUM_FIELD.into(), self.checksum.clone().into());
        r.insert(CACHED_ON_FIELD.into(), self.cached_on.into());
        r
    }

    fn from_record(record: &Record) -> Result<Self, CoreError> {
        Ok(User {
            id: record.require_int(Self::COLLECTION, "id")?,
            username: record.require_text(Self::COLLECTION, "username")?,
            email: record.require_text(Self::COLLECTION, "email")?,
            balance: record.require_int(Self::COLLECTION, "balance")?,
            session: record.optional_text("session"),
            checksum: record.optional_text(CHECKSUM_FIELD),
            cached_on: record.optional_int(CACHED_ON_FIELD),
        })
    }

    fn runtime_fields() -> &'static [&'static str] {
        &["session"]
    }

    fn checksum_fields() -> &'static [&'static str] {
        &["id", "username", "email", "balance"]
    }

    fn stored_checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    fn set_checksum(&mut self, digest: String) {
        self.checksum = Some(digest);
    }

    fn cached_on(&self) -> Option<i64> {
        self.cached_on
    }

    fn set_cached_on(&mut self, millis: i64) {
        self.cached_on = Some(millis);
    }

    fn on_retrieve(&self, provenance: Provenance) -> Option<String> {
        Some(format!("user {} retrieved from {}", self.id, provenance))
    }

    fn on_cache_store(&self) -> Option<String> {
        Some(format!("user {} cached", self.id))
    }

    fn on_lock_obtained(&self) -> Option<String> {
        Some(format!("user {} locked", self.id))
    }
}

pub fn user(id: i64, username: &str) -> User {
    User {
        id,
        username: username.to_string(),
        email: format!("{}@example.com", username),
        balance: 100,
        session: Some(format!("session-{}", id)),
        checksum: None,
        cached_on: None,
    }
}

pub fn identity(id: i64) -> EntityIdentity {
    EntityIdentity::new("users", id).unwrap()
}

pub fn key(raw: &str) -> StorageKey {
    StorageKey::parse(raw).unwrap()
}

pub fn checksummer() -> Checksummer {
    Checksummer::from_secret(SECRET, 2).unwrap()
}

/// Durable store that counts reads and can be switched offline.
#[derive(Default)]
pub struct CountingStore {
    pub inner: InMemoryStore,
    finds: AtomicUsize,
    offline: AtomicBool,
}

impl CountingStore {
    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl DurableStore for CountingStore {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Record, StorageError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Migration("store offline".into()));
        }
        self.inner.find(collection, filter)
    }

    fn insert(&self, identity: &EntityIdentity, record: &Record) -> Result<usize, StorageError> {
        self.inner.insert(identity, record)
    }

    fn update(
        &self,
        collection: &str,
        changes: &Record,
        key: &Filter,
    ) -> Result<usize, StorageError> {
        self.inner.update(collection, changes, key)
    }
}

/// Shared cache that counts calls and can be switched offline.
pub struct CountingCache {
    pub inner: InMemoryCache,
    gets: AtomicUsize,
    sets: AtomicUsize,
    deletes: AtomicUsize,
    offline: AtomicBool,
}

impl CountingCache {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        CountingCache {
            inner: InMemoryCache::new(clock),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("cache offline".into()));
        }
        Ok(())
    }
}

impl SharedCache for CountingCache {
    fn get(&self, key: &StorageKey) -> Result<Option<CacheValue>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get(key)
    }

    fn set(&self, key: &StorageKey, value: &CacheValue, ttl: Duration) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &StorageKey) -> Result<(), CacheError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.delete(key)
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<CountingStore>,
    pub cache: Arc<CountingCache>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<BufferedSink>,
    pub fetcher: EntityFetcher,
}

impl Harness {
    /// Inserts `user` through the fetcher so it carries a valid checksum.
    pub fn seed(&self, mut user: User) -> User {
        self.fetcher.insert(&mut user).unwrap();
        user
    }

    /// A second fetcher over the same tiers, as another process would see
    /// them: own runtime tier, own lock owner.
    pub fn peer(&self) -> EntityFetcher {
        let locks = Arc::new(LockCoordinator::new(self.dir.path()).unwrap());
        EntityFetcher::builder(self.store.clone(), self.cache.clone(), locks)
            .clock(self.clock.clone())
            .diagnostics(self.sink.clone())
            .checksummer(checksummer())
            .config(self.fetcher.config().clone())
            .build()
    }
}

pub fn harness() -> Harness {
    harness_with(KernelConfig::default())
}

pub fn harness_with(config: KernelConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(CountingStore::default());
    let cache = Arc::new(CountingCache::new(clock.clone()));
    let sink = Arc::new(BufferedSink::new());
    let locks = Arc::new(LockCoordinator::new(dir.path()).unwrap());
    let fetcher = EntityFetcher::builder(store.clone(), cache.clone(), locks)
        .clock(clock.clone())
        .diagnostics(sink.clone())
        .checksummer(checksummer())
        .config(KernelConfig {
            lock_dir: dir.path().to_path_buf(),
            ..config
        })
        .build();
    Harness {
        dir,
        store,
        cache,
        clock,
        sink,
        fetcher,
    }
}
