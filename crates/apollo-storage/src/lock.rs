//! Mount coordination.
//!
//! A process-wide map records every in-flight mount, unmount and image-create
//! operation. A caller that finds an entry for its lock id does not redo the
//! work: it waits for the owner to finish and then gives it the benefit of
//! the doubt, assuming the operation succeeded. The owner's error is never
//! propagated to waiters; any lingering inconsistency surfaces on the
//! waiter's next own operation. Image-create relies on this exact semantics
//! (the waiter proceeds straight to cloning), so it must not change.

use std::collections::HashMap;
use std::sync::Arc;

use apollo_common::StorageResult;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

/// Identity of one coordinated operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId(String);

impl LockId {
    /// `mount/pool/<pool>`
    #[must_use]
    pub fn pool_mount(pool: &str) -> Self {
        Self(format!("mount/pool/{}", pool))
    }

    /// `umount/pool/<pool>`
    #[must_use]
    pub fn pool_umount(pool: &str) -> Self {
        Self(format!("umount/pool/{}", pool))
    }

    /// `mount/container/<pool>/<name>`
    #[must_use]
    pub fn container_mount(pool: &str, name: &str) -> Self {
        Self(format!("mount/container/{}/{}", pool, name))
    }

    /// `umount/container/<pool>/<name>`
    #[must_use]
    pub fn container_umount(pool: &str, name: &str) -> Self {
        Self(format!("umount/container/{}/{}", pool, name))
    }

    /// `mount/custom/<pool>/<volume>`
    #[must_use]
    pub fn custom_mount(pool: &str, volume: &str) -> Self {
        Self(format!("mount/custom/{}/{}", pool, volume))
    }

    /// `umount/custom/<pool>/<volume>`
    #[must_use]
    pub fn custom_umount(pool: &str, volume: &str) -> Self {
        Self(format!("umount/custom/{}/{}", pool, volume))
    }

    /// `create/image/<pool>/<fingerprint>`
    #[must_use]
    pub fn image_create(pool: &str, fingerprint: &str) -> Self {
        Self(format!("create/image/{}/{}", pool, fingerprint))
    }

    /// The rendered id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One-shot completion notice, broadcast to all waiters.
struct Notice {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Notice {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn close(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

/// The process-wide coordination map.
///
/// The mutex only guards map lookups and insertions; the coordinated work
/// itself always runs with the mutex released.
pub struct OperationMap {
    inner: Mutex<HashMap<LockId, Arc<Notice>>>,
}

/// Outcome of [`OperationMap::run`].
pub enum RunOutcome<T> {
    /// This caller performed the work.
    Performed(T),
    /// A concurrent caller held the lock; its outcome is assumed good.
    AlreadyInProgress,
}

impl OperationMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` under `id`, or wait for the holder and skip it.
    ///
    /// Exactly one concurrent caller per id executes `work`; every other
    /// caller blocks until it finishes and then returns
    /// [`RunOutcome::AlreadyInProgress`] without observing the result.
    pub fn run<T>(
        &self,
        id: &LockId,
        work: impl FnOnce() -> StorageResult<T>,
    ) -> StorageResult<RunOutcome<T>> {
        let notice = {
            let mut map = self.inner.lock();
            if let Some(existing) = map.get(id) {
                let existing = Arc::clone(existing);
                drop(map);
                existing.wait();
                tracing::debug!(lock = id.as_str(), "Operation already in progress, waited");
                return Ok(RunOutcome::AlreadyInProgress);
            }
            let notice = Arc::new(Notice::new());
            map.insert(id.clone(), Arc::clone(&notice));
            notice
        };

        let result = work();

        {
            let mut map = self.inner.lock();
            map.remove(id);
        }
        notice.close();

        result.map(RunOutcome::Performed)
    }
}

impl Default for OperationMap {
    fn default() -> Self {
        Self::new()
    }
}

/// The singleton map all backends coordinate through.
pub static OPERATIONS: Lazy<OperationMap> = Lazy::new(OperationMap::new);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;

    #[test]
    fn lock_ids_render_per_contract() {
        assert_eq!(LockId::pool_mount("p1").as_str(), "mount/pool/p1");
        assert_eq!(LockId::pool_umount("p1").as_str(), "umount/pool/p1");
        assert_eq!(
            LockId::container_mount("p1", "c1").as_str(),
            "mount/container/p1/c1"
        );
        assert_eq!(
            LockId::container_umount("p1", "c1").as_str(),
            "umount/container/p1/c1"
        );
        assert_eq!(
            LockId::custom_mount("p1", "v1").as_str(),
            "mount/custom/p1/v1"
        );
        assert_eq!(
            LockId::custom_umount("p1", "v1").as_str(),
            "umount/custom/p1/v1"
        );
        assert_eq!(
            LockId::image_create("p1", "abc").as_str(),
            "create/image/p1/abc"
        );
    }

    #[test]
    fn mount_and_umount_ids_are_distinct() {
        assert_ne!(
            LockId::container_mount("p1", "c1"),
            LockId::container_umount("p1", "c1")
        );
    }

    #[test]
    fn only_one_thread_performs_work() {
        const THREADS: usize = 8;
        let map = OperationMap::new();
        let performed = AtomicU32::new(0);
        let waited = AtomicU32::new(0);
        let barrier = Barrier::new(THREADS);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    barrier.wait();
                    let id = LockId::container_mount("p1", "c1");
                    let outcome = map
                        .run(&id, || {
                            // Hold the critical section long enough that the
                            // other threads reliably find the entry.
                            std::thread::sleep(std::time::Duration::from_millis(50));
                            Ok(())
                        })
                        .unwrap();
                    match outcome {
                        RunOutcome::Performed(()) => performed.fetch_add(1, Ordering::SeqCst),
                        RunOutcome::AlreadyInProgress => waited.fetch_add(1, Ordering::SeqCst),
                    };
                });
            }
        });

        // Threads that raced the first holder waited; late arrivals may have
        // performed their own run after the entry was removed. At least one
        // waiter must have been coordinated away in this window.
        assert!(performed.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            performed.load(Ordering::SeqCst) + waited.load(Ordering::SeqCst),
            THREADS as u32
        );
        assert!(waited.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn waiters_do_not_observe_worker_errors() {
        let map = OperationMap::new();
        let id = LockId::custom_mount("p1", "v1");
        let barrier = Barrier::new(2);

        std::thread::scope(|scope| {
            let worker = scope.spawn(|| {
                map.run(&id, || -> StorageResult<()> {
                    barrier.wait();
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    Err(apollo_common::StorageError::config("mount failed"))
                })
            });
            let waiter = scope.spawn(|| {
                barrier.wait();
                // Small delay so the worker's entry is in the map.
                std::thread::sleep(std::time::Duration::from_millis(10));
                map.run(&id, || Ok(()))
            });

            assert!(worker.join().unwrap().is_err());
            // The waiter either coordinated away (benefit of the doubt) or
            // arrived after removal and performed its own successful run.
            assert!(waiter.join().unwrap().is_ok());
        });
    }
}
