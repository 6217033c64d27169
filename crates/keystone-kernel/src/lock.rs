//! Cross-process entity locks.
//!
//! Each [`StorageKey`] maps to one lock file under the coordinator's
//! directory. Exclusion is an exclusive, non-blocking `fs2` file lock on
//! that file, so the OS drops the lock if the owning process dies. One
//! coordinator is one owner: acquiring a key the coordinator already holds
//! re-enters the same lock instead of deadlocking against itself.
//!
//! # Holds
//!
//! Every successful [`LockCoordinator::acquire`] is one hold on the key.
//! The file lock is released only when the last hold ends, so a nested
//! acquisition that is released (or fails and is released) never drops
//! the outer caller's lock.
//!
//! - `auto_release = true`: the hold ends when the last [`Lock`] clone of
//!   that acquisition is dropped, on every exit path.
//! - `auto_release = false`: the hold is pinned until
//!   [`LockCoordinator::release`] or until the coordinator is dropped.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use fs2::FileExt;
use uuid::Uuid;

use keystone_core::StorageKey;

use crate::config::KernelConfig;
use crate::error::LockError;

/// Upper bound of the random delay added to each poll interval.
const POLL_JITTER_MS: u64 = 25;

/// Longest sanitized key prefix kept in a lock file name.
const MAX_NAME_PREFIX: usize = 64;

/// How to acquire a lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    /// Poll until `max_wait` instead of failing at once.
    pub wait: bool,
    pub check_interval: Duration,
    pub max_wait: Duration,
    pub auto_release: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            wait: true,
            check_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(10),
            auto_release: true,
        }
    }
}

impl LockOptions {
    /// Fail immediately if the lock is held elsewhere.
    pub fn non_blocking() -> Self {
        LockOptions {
            wait: false,
            ..Self::default()
        }
    }

    pub fn blocking(check_interval: Duration, max_wait: Duration) -> Self {
        LockOptions {
            wait: true,
            check_interval,
            max_wait,
            ..Self::default()
        }
    }

    pub fn from_config(config: &KernelConfig) -> Self {
        Self::blocking(config.lock_check_interval, config.lock_max_wait)
    }

    pub fn with_auto_release(mut self, auto_release: bool) -> Self {
        self.auto_release = auto_release;
        self
    }
}

struct Slot {
    /// `None` once released.
    file: Option<File>,
    holds: usize,
}

struct LockState {
    key: StorageKey,
    path: PathBuf,
    owner: Uuid,
    slot: Mutex<Slot>,
}

impl LockState {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_valid(&self) -> bool {
        self.slot().file.is_some()
    }

    /// Adds a hold if the file lock is still held.
    fn enter(&self) -> bool {
        let mut slot = self.slot();
        if slot.file.is_none() {
            return false;
        }
        slot.holds += 1;
        true
    }

    /// Ends one hold. Closes the lock file, which drops the OS lock, when
    /// it was the last. Returns whether the file lock was released.
    fn leave(&self) -> bool {
        let mut slot = self.slot();
        slot.holds = slot.holds.saturating_sub(1);
        slot.holds == 0 && slot.file.take().is_some()
    }

    /// Releases the file lock regardless of outstanding holds.
    fn release_all(&self) -> bool {
        let mut slot = self.slot();
        slot.holds = 0;
        slot.file.take().is_some()
    }
}

impl Drop for LockState {
    fn drop(&mut self) {
        if self.release_all() {
            tracing::debug!(key = %self.key, owner = %self.owner, "lock released on drop");
        }
    }
}

/// One successful acquisition of a lock.
struct Hold {
    state: Arc<LockState>,
    pinned: bool,
    active: AtomicBool,
}

impl Hold {
    /// Ends this hold. Returns `(was_active, file_lock_released)`.
    fn end(&self) -> (bool, bool) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return (false, false);
        }
        (true, self.state.leave())
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        if self.pinned {
            return;
        }
        if let (true, true) = self.end() {
            tracing::debug!(key = %self.state.key, owner = %self.state.owner, "lock released on drop");
        }
    }
}

/// Handle to one acquisition of a lock. Clones share the acquisition.
#[derive(Clone)]
pub struct Lock {
    hold: Arc<Hold>,
}

impl Lock {
    fn state(&self) -> &Arc<LockState> {
        &self.hold.state
    }

    pub fn key(&self) -> &StorageKey {
        &self.state().key
    }

    pub fn path(&self) -> &Path {
        &self.state().path
    }

    pub fn owner(&self) -> Uuid {
        self.state().owner
    }

    /// Whether this handle still guards its key.
    pub fn is_valid(&self) -> bool {
        self.hold.active.load(Ordering::SeqCst) && self.state().is_valid()
    }

    fn same_as(&self, state: &Arc<LockState>) -> bool {
        Arc::ptr_eq(self.state(), state)
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("key", self.key())
            .field("owner", &self.owner())
            .field("valid", &self.is_valid())
            .finish()
    }
}

enum Held {
    Pinned(Arc<LockState>),
    Scoped(Weak<LockState>),
}

impl Held {
    fn live(&self) -> Option<Arc<LockState>> {
        let state = match self {
            Held::Pinned(state) => Some(Arc::clone(state)),
            Held::Scoped(weak) => weak.upgrade(),
        };
        state.filter(|s| s.is_valid())
    }

    fn state_ptr_eq(&self, other: &Arc<LockState>) -> bool {
        match self {
            Held::Pinned(state) => Arc::ptr_eq(state, other),
            Held::Scoped(weak) => std::ptr::eq(weak.as_ptr(), Arc::as_ptr(other)),
        }
    }
}

/// Issues and tracks locks for one owner.
pub struct LockCoordinator {
    dir: PathBuf,
    owner: Uuid,
    held: Mutex<HashMap<StorageKey, Held>>,
}

impl LockCoordinator {
    /// Creates a coordinator whose lock files live in `dir`, creating the
    /// directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| LockError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(LockCoordinator {
            dir,
            owner: Uuid::new_v4(),
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &KernelConfig) -> Result<Self, LockError> {
        Self::new(&config.lock_dir)
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock file for `key`: a readable prefix plus a short hash so distinct
    /// keys never collide after sanitizing.
    pub fn lock_path(&self, key: &StorageKey) -> PathBuf {
        let sanitized: String = key
            .as_str()
            .chars()
            .take(MAX_NAME_PREFIX)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let hash = blake3::hash(key.as_str().as_bytes()).to_hex();
        self.dir
            .join(format!("{}.{}.lock", sanitized, &hash.as_str()[..8]))
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<StorageKey, Held>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the lock for `key`.
    ///
    /// In non-blocking mode a lock held by another owner fails at once with
    /// [`LockError::Unavailable`]. In blocking mode the file is polled every
    /// `check_interval` (plus jitter) until `max_wait`, then
    /// [`LockError::Timeout`].
    pub fn acquire(&self, key: &StorageKey, options: &LockOptions) -> Result<Lock, LockError> {
        let start = Instant::now();
        loop {
            if let Some(lock) = self.try_acquire(key, options.auto_release)? {
                return Ok(lock);
            }
            if !options.wait {
                return Err(LockError::Unavailable { key: key.clone() });
            }
            let waited = start.elapsed();
            if waited >= options.max_wait {
                tracing::debug!(key = %key, waited_ms = waited.as_millis() as u64, "lock wait timed out");
                return Err(LockError::Timeout {
                    key: key.clone(),
                    waited,
                });
            }
            let jitter = Duration::from_millis(rand::random::<u64>() % (POLL_JITTER_MS + 1));
            let remaining = options.max_wait - waited;
            std::thread::sleep((options.check_interval + jitter).min(remaining));
        }
    }

    fn try_acquire(&self, key: &StorageKey, auto_release: bool) -> Result<Option<Lock>, LockError> {
        let mut held = self.registry();
        held.retain(|_, entry| entry.live().is_some());

        if let Some(state) = held.get(key).and_then(Held::live) {
            if state.enter() {
                if !auto_release {
                    held.insert(key.clone(), Held::Pinned(Arc::clone(&state)));
                }
                tracing::trace!(key = %key, "lock re-entered");
                return Ok(Some(hold(state, auto_release)));
            }
            held.remove(key);
        }

        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        let acquired = try_lock_exclusive(&file).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;
        if !acquired {
            return Ok(None);
        }

        let state = Arc::new(LockState {
            key: key.clone(),
            path,
            owner: self.owner,
            slot: Mutex::new(Slot {
                file: Some(file),
                holds: 1,
            }),
        });
        let entry = if auto_release {
            Held::Scoped(Arc::downgrade(&state))
        } else {
            Held::Pinned(Arc::clone(&state))
        };
        held.insert(key.clone(), entry);
        tracing::debug!(key = %key, owner = %self.owner, auto_release, "lock acquired");
        Ok(Some(hold(state, auto_release)))
    }

    /// Ends the acquisition behind `lock`; every clone of this handle
    /// becomes invalid. The file lock itself is released once no other
    /// acquisition of the key is outstanding. Returns whether the handle
    /// was still held.
    pub fn release(&self, lock: &Lock) -> bool {
        let (was_held, released) = lock.hold.end();
        if released {
            let mut held = self.registry();
            if held
                .get(lock.key())
                .is_some_and(|entry| entry.state_ptr_eq(lock.state()))
            {
                held.remove(lock.key());
            }
            tracing::debug!(key = %lock.key(), owner = %self.owner, "lock released");
        } else if was_held {
            tracing::trace!(key = %lock.key(), "nested hold released, lock still held");
        }
        was_held
    }

    /// Whether this coordinator currently holds `key`.
    pub fn is_held(&self, key: &StorageKey) -> bool {
        self.registry().get(key).and_then(Held::live).is_some()
    }

    /// Checks whether a lock handle belongs to this coordinator and is
    /// still registered for its key.
    pub fn owns(&self, lock: &Lock) -> bool {
        lock.is_valid()
            && self
                .registry()
                .get(lock.key())
                .and_then(Held::live)
                .is_some_and(|state| lock.same_as(&state))
    }
}

impl Drop for LockCoordinator {
    fn drop(&mut self) {
        let held = std::mem::take(&mut *self.registry());
        for (key, entry) in held {
            if let Held::Pinned(state) = entry {
                if state.release_all() {
                    tracing::debug!(key = %key, owner = %self.owner, "pinned lock released with coordinator");
                }
            }
        }
    }
}

impl fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("dir", &self.dir)
            .field("owner", &self.owner)
            .finish()
    }
}

fn hold(state: Arc<LockState>, auto_release: bool) -> Lock {
    Lock {
        hold: Arc::new(Hold {
            state,
            pinned: !auto_release,
            active: AtomicBool::new(true),
        }),
    }
}

/// Tries to take an exclusive lock on `file` without blocking.
///
/// Returns `Ok(false)` if another open file handle holds it.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
        {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn key(raw: &str) -> StorageKey {
        StorageKey::parse(raw).unwrap()
    }

    fn coordinator(dir: &Path) -> LockCoordinator {
        LockCoordinator::new(dir).unwrap()
    }

    #[test]
    fn lock_path_is_sanitized_and_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path());
        let a = c.lock_path(&key("users_by_email:a/b@x"));
        let b = c.lock_path(&key("users_by_email:a_b@x"));
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("users_by_email_a_b_x."));
        assert!(name.ends_with(".lock"));
    }

    #[test]
    fn reacquire_in_same_owner_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path());
        let k = key("users:1");
        let first = c.acquire(&k, &LockOptions::non_blocking()).unwrap();
        let second = c.acquire(&k, &LockOptions::non_blocking()).unwrap();
        assert!(Arc::ptr_eq(first.state(), second.state()));
        assert!(c.owns(&second));
    }

    #[test]
    fn second_owner_fails_fast_when_non_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let a = coordinator(dir.path());
        let b = coordinator(dir.path());
        let k = key("users:1");

        let held = a.acquire(&k, &LockOptions::non_blocking()).unwrap();
        let err = b.acquire(&k, &LockOptions::non_blocking()).unwrap_err();
        assert!(matches!(err, LockError::Unavailable { .. }));

        assert!(a.release(&held));
        assert!(!held.is_valid());
        assert!(b.acquire(&k, &LockOptions::non_blocking()).is_ok());
    }

    #[test]
    fn scoped_lock_released_when_last_handle_drops() {
        let dir = tempfile::tempdir().unwrap();
        let a = coordinator(dir.path());
        let b = coordinator(dir.path());
        let k = key("users:2");

        {
            let lock = a.acquire(&k, &LockOptions::non_blocking()).unwrap();
            let _clone = lock.clone();
            assert!(a.is_held(&k));
        }
        assert!(!a.is_held(&k));
        assert!(b.acquire(&k, &LockOptions::non_blocking()).is_ok());
    }

    #[test]
    fn pinned_lock_survives_handle_drop() {
        let dir = tempfile::tempdir().unwrap();
        let a = coordinator(dir.path());
        let b = coordinator(dir.path());
        let k = key("users:3");

        drop(
            a.acquire(&k, &LockOptions::non_blocking().with_auto_release(false))
                .unwrap(),
        );
        assert!(a.is_held(&k));
        assert!(b.acquire(&k, &LockOptions::non_blocking()).is_err());

        drop(a);
        assert!(b.acquire(&k, &LockOptions::non_blocking()).is_ok());
    }

    #[test]
    fn blocking_acquire_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let a = coordinator(dir.path());
        let b = coordinator(dir.path());
        let k = key("users:4");

        let _held = a.acquire(&k, &LockOptions::non_blocking()).unwrap();
        let options = LockOptions::blocking(Duration::from_millis(10), Duration::from_millis(80));
        let start = Instant::now();
        let err = b.acquire(&k, &options).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn blocking_acquire_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let k = key("users:5");
        let (tx, rx) = mpsc::channel();

        let holder = {
            let k = k.clone();
            thread::spawn(move || {
                let a = LockCoordinator::new(&path).unwrap();
                let lock = a.acquire(&k, &LockOptions::non_blocking()).unwrap();
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                a.release(&lock);
            })
        };

        rx.recv().unwrap();
        let b = coordinator(dir.path());
        let options = LockOptions::blocking(Duration::from_millis(10), Duration::from_secs(5));
        let lock = b.acquire(&k, &options).unwrap();
        assert!(lock.is_valid());
        holder.join().unwrap();
    }

    #[test]
    fn nested_release_keeps_outer_hold() {
        let dir = tempfile::tempdir().unwrap();
        let a = coordinator(dir.path());
        let b = coordinator(dir.path());
        let k = key("users:6");

        let outer = a.acquire(&k, &LockOptions::non_blocking()).unwrap();
        let inner = a.acquire(&k, &LockOptions::non_blocking()).unwrap();
        assert!(a.release(&inner));
        assert!(!inner.is_valid());
        assert!(outer.is_valid());
        assert!(b.acquire(&k, &LockOptions::non_blocking()).is_err());

        // a second release of the same handle is a no-op
        assert!(!a.release(&inner));
        assert!(outer.is_valid());

        assert!(a.release(&outer));
        assert!(b.acquire(&k, &LockOptions::non_blocking()).is_ok());
    }

    #[test]
    fn dropped_nested_hold_leaves_outer_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let a = coordinator(dir.path());
        let b = coordinator(dir.path());
        let k = key("users:7");

        let outer = a.acquire(&k, &LockOptions::non_blocking()).unwrap();
        drop(a.acquire(&k, &LockOptions::non_blocking()).unwrap());
        assert!(outer.is_valid());
        assert!(b.acquire(&k, &LockOptions::non_blocking()).is_err());

        assert!(a.release(&outer));
        assert!(b.acquire(&k, &LockOptions::non_blocking()).is_ok());
    }

    #[test]
    fn released_scoped_locks_leave_no_registry_entries() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path());

        for id in 0..200 {
            let lock = c
                .acquire(&key(&format!("users:{}", id)), &LockOptions::non_blocking())
                .unwrap();
            if id % 2 == 0 {
                c.release(&lock);
            }
        }
        assert!(c.registry().len() <= 1);

        let kept = c.acquire(&key("users:kept"), &LockOptions::non_blocking()).unwrap();
        assert_eq!(c.registry().len(), 1);
        assert!(c.owns(&kept));
    }
}
