//! The entity fetch orchestrator.
//!
//! [`EntityFetcher::resolve`] is the single read path for every entity:
//!
//! 1. runtime tier: returned as-is, tagged [`Provenance::Runtime`]
//! 2. shared cache tier (optional): aliases are followed exactly once; the
//!    projection is decoded and checksum-verified, copied into the runtime
//!    tier and tagged [`Provenance::Cache`]. The cache is never re-warmed
//!    from a cache hit.
//! 3. durable store: decoded, verified, copied into the runtime tier and,
//!    when requested, written to the shared cache as a projection
//!
//! Entities are only ever stored under their own key. A read through an
//! alias populates the entity's key and re-points the alias at it, so the
//! single delete done by a locked write invalidates every path to the row.
//!
//! Cache tier failures are recorded through the [`DiagnosticSink`] and the
//! read falls through to the durable store, unless strict mode is on.
//! Integrity and lock failures are always returned to the caller.
//!
//! Writes go through [`EntityFetcher::get_locked_entity`] and
//! [`EntityFetcher::update_locked`]: the lock is taken first, the row is
//! re-read from the durable store, and the shared cache entry is deleted
//! after the write rather than updated in place.

use std::sync::Arc;
use std::time::Duration;

use keystone_core::{
    CacheValue, CacheableProjection, Clock, Entity, EntityIdentity, Filter, PrimaryKey,
    Provenance, Record, StorageKey, SystemClock,
};
use keystone_storage::{
    CacheError, Checksummer, DurableStore, RuntimeTier, SharedCache, StorageError,
};

use crate::config::KernelConfig;
use crate::diagnostics::{DiagnosticEvent, DiagnosticKind, DiagnosticSink, TracingSink};
use crate::error::KernelError;
use crate::lock::{Lock, LockCoordinator, LockOptions};

/// Per-call knobs for [`EntityFetcher::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOptions {
    pub use_shared_cache: bool,
    pub store_in_cache: bool,
    /// Zero means the configured default TTL.
    pub ttl: Duration,
    /// Return cache tier failures instead of degrading to the durable store.
    pub strict: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            use_shared_cache: true,
            store_in_cache: true,
            ttl: Duration::ZERO,
            strict: false,
        }
    }
}

impl ResolveOptions {
    /// Skip the shared cache entirely, for both reads and writes.
    pub fn database_only() -> Self {
        ResolveOptions {
            use_shared_cache: false,
            store_in_cache: false,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_store_in_cache(mut self, store: bool) -> Self {
        self.store_in_cache = store;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

/// An entity together with the tier that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<E> {
    pub entity: E,
    pub provenance: Provenance,
    /// Whether this call wrote a projection to the shared cache.
    pub stored_in_cache: bool,
}

impl<E> Resolved<E> {
    pub fn into_entity(self) -> E {
        self.entity
    }
}

/// An entity read from the durable store while its lock was held.
///
/// Mutate it through [`LockedEntity::entity_mut`] and persist with
/// [`EntityFetcher::update_locked`].
#[derive(Debug)]
pub struct LockedEntity<E> {
    entity: E,
    lock: Lock,
    /// Row as last read or written, used to compute changed fields.
    original: Record,
}

impl<E: Entity> LockedEntity<E> {
    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut E {
        &mut self.entity
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn into_parts(self) -> (E, Lock) {
        (self.entity, self.lock)
    }

    /// Fields whose value differs from the row as read, runtime fields
    /// excluded.
    pub fn changed_fields(&self) -> Record {
        self.entity
            .to_record()
            .into_iter()
            .filter(|(field, value)| {
                !E::runtime_fields().contains(&field.as_str())
                    && self.original.get(field) != Some(value)
            })
            .collect()
    }
}

/// Builder for [`EntityFetcher`].
pub struct EntityFetcherBuilder {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn SharedCache>,
    locks: Arc<LockCoordinator>,
    checksummer: Option<Checksummer>,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<dyn DiagnosticSink>,
    config: KernelConfig,
}

impl EntityFetcherBuilder {
    pub fn checksummer(mut self, checksummer: Checksummer) -> Self {
        self.checksummer = Some(checksummer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> EntityFetcher {
        EntityFetcher {
            runtime: RuntimeTier::new(),
            store: self.store,
            cache: self.cache,
            locks: self.locks,
            checksummer: self.checksummer,
            clock: self.clock,
            diagnostics: self.diagnostics,
            config: self.config,
        }
    }
}

/// Resolves entities through the runtime, shared cache and durable tiers.
pub struct EntityFetcher {
    runtime: RuntimeTier,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn SharedCache>,
    locks: Arc<LockCoordinator>,
    checksummer: Option<Checksummer>,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<dyn DiagnosticSink>,
    config: KernelConfig,
}

impl EntityFetcher {
    pub fn builder(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn SharedCache>,
        locks: Arc<LockCoordinator>,
    ) -> EntityFetcherBuilder {
        EntityFetcherBuilder {
            store,
            cache,
            locks,
            checksummer: None,
            clock: Arc::new(SystemClock),
            diagnostics: Arc::new(TracingSink),
            config: KernelConfig::default(),
        }
    }

    pub fn runtime(&self) -> &RuntimeTier {
        &self.runtime
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Resolves the entity stored under `identity`, querying the durable
    /// store with `filter` on a cache miss.
    pub fn resolve<E: Entity>(
        &self,
        identity: &EntityIdentity,
        filter: &Filter,
        options: &ResolveOptions,
    ) -> Result<Resolved<E>, KernelError> {
        let key = identity.storage_key();

        if let Some(entity) = self.runtime.get::<E>(&key) {
            self.hook(&key, "on_retrieve", entity.on_retrieve(Provenance::Runtime));
            return Ok(Resolved {
                entity,
                provenance: Provenance::Runtime,
                stored_in_cache: false,
            });
        }

        let strict = options.strict || self.config.strict_cache;

        if options.use_shared_cache {
            if let Some(entity) = self.read_cache::<E>(&key, strict)? {
                self.runtime.insert(entity.identity()?.storage_key(), entity.clone());
                self.hook(&key, "on_retrieve", entity.on_retrieve(Provenance::Cache));
                return Ok(Resolved {
                    entity,
                    provenance: Provenance::Cache,
                    stored_in_cache: false,
                });
            }
        }

        let (entity, _) = self.read_store::<E>(&key, filter)?;
        let own_key = entity.identity()?.storage_key();
        self.runtime.insert(own_key.clone(), entity.clone());

        let stored_in_cache = if options.store_in_cache {
            let stored = self.write_cache(&own_key, &entity, options.ttl, strict)?;
            if stored && own_key != key {
                self.write_alias(&key, &own_key, options.ttl, strict)?;
            }
            stored
        } else {
            false
        };

        self.hook(&key, "on_retrieve", entity.on_retrieve(Provenance::Database));
        if stored_in_cache {
            self.hook(&key, "on_cache_store", entity.on_cache_store());
        }

        tracing::trace!(key = %key, provenance = %Provenance::Database, stored_in_cache, "entity resolved");
        Ok(Resolved {
            entity,
            provenance: Provenance::Database,
            stored_in_cache,
        })
    }

    /// Resolves by primary key, using `id = pk` as the durable predicate.
    pub fn fetch<E: Entity>(
        &self,
        pk: impl Into<PrimaryKey>,
        options: &ResolveOptions,
    ) -> Result<Resolved<E>, KernelError> {
        let identity = EntityIdentity::new(E::COLLECTION, pk)?;
        let filter = Filter::primary_key(&identity);
        self.resolve(&identity, &filter, options)
    }

    /// Inserts a new entity, stamping its checksum first when it is
    /// checksum-aware. Any stale runtime entry for the key is dropped.
    pub fn insert<E: Entity>(&self, entity: &mut E) -> Result<usize, KernelError> {
        if E::is_checksum_aware() {
            self.checksummer::<E>()?.stamp(entity);
        }
        let identity = entity.identity()?;
        let affected = self.store.insert(&identity, &entity.to_record())?;
        self.runtime.purge(&identity.storage_key());
        tracing::debug!(key = %identity.storage_key(), "entity inserted");
        Ok(affected)
    }

    /// Locks `identity` and reads it straight from the durable store.
    ///
    /// The runtime and shared cache tiers are bypassed. If the read fails
    /// the lock is released before the error is returned.
    pub fn get_locked_entity<E: Entity>(
        &self,
        identity: &EntityIdentity,
        filter: &Filter,
        options: &LockOptions,
    ) -> Result<LockedEntity<E>, KernelError> {
        let key = identity.storage_key();
        let lock = self.locks.acquire(&key, options)?;

        let (entity, original) = match self.read_store::<E>(&key, filter) {
            Ok(read) => read,
            Err(err) => {
                self.locks.release(&lock);
                tracing::debug!(key = %key, error = %err, "locked read failed, lock released");
                return Err(err);
            }
        };

        self.hook(&key, "on_lock_obtained", entity.on_lock_obtained());
        Ok(LockedEntity {
            entity,
            lock,
            original,
        })
    }

    /// [`EntityFetcher::get_locked_entity`] by primary key.
    pub fn fetch_locked<E: Entity>(
        &self,
        pk: impl Into<PrimaryKey>,
        options: &LockOptions,
    ) -> Result<LockedEntity<E>, KernelError> {
        let identity = EntityIdentity::new(E::COLLECTION, pk)?;
        let filter = Filter::primary_key(&identity);
        self.get_locked_entity(&identity, &filter, options)
    }

    /// Writes the changed fields of a locked entity, plus a fresh checksum,
    /// in one durable store update, then invalidates the entity in the
    /// runtime and shared cache tiers. Returns rows affected; nothing is
    /// written when no field changed.
    ///
    /// Once the durable write has committed the call succeeds, even in
    /// strict mode: a failed cache delete is recorded as a
    /// [`DiagnosticKind::CacheDelete`] event and the stale projection lives
    /// until its TTL.
    pub fn update_locked<E: Entity>(
        &self,
        locked: &mut LockedEntity<E>,
    ) -> Result<usize, KernelError> {
        if !locked.lock.is_valid() {
            return Err(KernelError::LockNotHeld {
                key: locked.lock.key().clone(),
            });
        }

        if E::is_checksum_aware() {
            self.checksummer::<E>()?.stamp(&mut locked.entity);
        }

        let changes = locked.changed_fields();
        if changes.is_empty() {
            return Ok(0);
        }

        let identity = locked.entity.identity()?;
        let key = identity.storage_key();
        let affected = self
            .store
            .update(E::COLLECTION, &changes, &Filter::primary_key(&identity))?;
        locked.original = locked.entity.to_record();

        self.runtime.purge(&key);
        if let Err(err) = self.cache.delete(&key) {
            self.diagnostics.record(DiagnosticEvent::new(
                DiagnosticKind::CacheDelete,
                key.as_str(),
                format!("invalidation after committed write failed: {}", err),
            ));
        }

        tracing::debug!(key = %key, fields = changes.len(), affected, "locked entity updated");
        Ok(affected)
    }

    /// Releases the lock held by a [`LockedEntity`].
    pub fn release<E>(&self, locked: LockedEntity<E>) -> bool {
        self.locks.release(&locked.lock)
    }

    /// Stores `alias` in the shared cache as a pointer to `target`.
    /// Returns whether the pointer was written; failures are recorded and
    /// only returned in strict mode.
    pub fn create_alias(
        &self,
        alias: &StorageKey,
        target: &EntityIdentity,
        ttl: Duration,
    ) -> Result<bool, KernelError> {
        self.write_alias(alias, &target.storage_key(), ttl, self.config.strict_cache)
    }

    /// Drops `identity` from the runtime tier only.
    pub fn purge(&self, identity: &EntityIdentity) -> bool {
        self.runtime.purge(&identity.storage_key())
    }

    pub fn clear_runtime(&self) {
        self.runtime.clear();
    }

    /// Drops `identity` from the runtime tier and the shared cache. A
    /// cache failure is recorded and only returned in strict mode.
    pub fn invalidate(&self, identity: &EntityIdentity) -> Result<(), KernelError> {
        let key = identity.storage_key();
        self.runtime.purge(&key);
        if let Err(err) = self.cache.delete(&key) {
            self.degrade(DiagnosticKind::CacheDelete, &key, err, self.config.strict_cache)?;
        }
        Ok(())
    }

    fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.config.default_ttl
        } else {
            ttl
        }
    }

    fn checksummer<E: Entity>(&self) -> Result<&Checksummer, KernelError> {
        self.checksummer
            .as_ref()
            .ok_or(KernelError::ChecksumUnavailable {
                collection: E::COLLECTION,
            })
    }

    fn verify<E: Entity>(&self, entity: &E) -> Result<(), KernelError> {
        if !E::is_checksum_aware() {
            return Ok(());
        }
        self.checksummer::<E>()?.validate(entity)?;
        Ok(())
    }

    /// Reads, decodes and verifies a row from the durable store.
    fn read_store<E: Entity>(
        &self,
        key: &StorageKey,
        filter: &Filter,
    ) -> Result<(E, Record), KernelError> {
        let record = match self.store.find(E::COLLECTION, filter) {
            Ok(record) => record,
            Err(StorageError::NotFound { .. }) => {
                return Err(KernelError::EntityNotFound { key: key.clone() })
            }
            Err(err) => return Err(err.into()),
        };
        let entity = E::from_record(&record)?;
        self.verify(&entity)?;
        Ok((entity, record))
    }

    /// Looks `key` up in the shared cache, following one alias.
    ///
    /// `Ok(None)` is a miss, including a degraded failure.
    fn read_cache<E: Entity>(
        &self,
        key: &StorageKey,
        strict: bool,
    ) -> Result<Option<E>, KernelError> {
        let value = match self.cache.get(key) {
            Ok(value) => value,
            Err(err) => {
                self.degrade(DiagnosticKind::CacheRead, key, err, strict)?;
                return Ok(None);
            }
        };

        let (source, record) = match value {
            None => return Ok(None),
            Some(CacheValue::Direct(record)) => (key.clone(), record),
            Some(CacheValue::Alias(target)) => match self.cache.get(&target) {
                Ok(Some(CacheValue::Direct(record))) => (target, record),
                Ok(Some(CacheValue::Alias(next))) => {
                    self.diagnostics.record(DiagnosticEvent::new(
                        DiagnosticKind::AliasDepth,
                        key.as_str(),
                        format!("alias {} -> {} -> {} exceeds depth 1", key, target, next),
                    ));
                    return Ok(None);
                }
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.degrade(DiagnosticKind::CacheRead, &target, err, strict)?;
                    return Ok(None);
                }
            },
        };

        let entity = match E::from_record(&record) {
            Ok(entity) => entity,
            Err(err) => {
                self.diagnostics.record(DiagnosticEvent::new(
                    DiagnosticKind::CacheDecode,
                    source.as_str(),
                    format!("undecodable projection evicted: {}", err),
                ));
                self.evict(&source);
                if strict {
                    return Err(err.into());
                }
                return Ok(None);
            }
        };

        if let Err(fault) = self.verify(&entity) {
            self.diagnostics.record(DiagnosticEvent::new(
                DiagnosticKind::IntegrityEviction,
                source.as_str(),
                format!("cached projection evicted: {}", fault),
            ));
            self.evict(&source);
            return Err(fault);
        }

        Ok(Some(entity))
    }

    /// Writes the projection of `entity` under `key`. Returns whether the
    /// write succeeded.
    fn write_cache<E: Entity>(
        &self,
        key: &StorageKey,
        entity: &E,
        ttl: Duration,
        strict: bool,
    ) -> Result<bool, KernelError> {
        let projection = CacheableProjection::of(entity, self.clock.now_millis())?;
        let ttl = self.effective_ttl(ttl);
        match self.cache.set(key, &projection.into_cache_value(), ttl) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.degrade(DiagnosticKind::CacheWrite, key, err, strict)?;
                Ok(false)
            }
        }
    }

    fn write_alias(
        &self,
        alias: &StorageKey,
        target: &StorageKey,
        ttl: Duration,
        strict: bool,
    ) -> Result<bool, KernelError> {
        match self.cache.create_alias(alias, target, self.effective_ttl(ttl)) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.degrade(DiagnosticKind::CacheWrite, alias, err, strict)?;
                Ok(false)
            }
        }
    }

    fn evict(&self, key: &StorageKey) {
        if let Err(err) = self.cache.delete(key) {
            self.diagnostics.record(DiagnosticEvent::new(
                DiagnosticKind::CacheDelete,
                key.as_str(),
                err.to_string(),
            ));
        }
    }

    /// Records a cache tier failure; returns it as an error in strict mode.
    fn degrade(
        &self,
        kind: DiagnosticKind,
        key: &StorageKey,
        err: CacheError,
        strict: bool,
    ) -> Result<(), KernelError> {
        self.diagnostics
            .record(DiagnosticEvent::new(kind, key.as_str(), err.to_string()));
        if strict {
            return Err(KernelError::CacheTier(err));
        }
        Ok(())
    }

    fn hook(&self, key: &StorageKey, hook: &'static str, message: Option<String>) {
        if let Some(message) = message {
            tracing::debug!(key = %key, hook, "{}", message);
        }
    }
}
