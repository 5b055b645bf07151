//! Cross-process write lock held in one table-store slot.
//!
//! The slot holds [`UNLOCKED`] or the identity of the holder (`pid << 32 | acquisition`).
//! Waiting is a bounded pause loop. When the timeout expires the holder is presumed dead and,
//! unless [`LockRecovery::Fail`] is configured, the lock is forcibly reset. A holder that was
//! merely slow can then race the new holder; that risk is accepted in exchange for liveness.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::table_store::{MappedValue, TableStore};
use crate::wait::{PauseStrategy, TimingPauser};
use crate::{Error, Result};

pub const LOCK_KEY: &str = "lock.write";
pub const UNLOCKED: i64 = i64::MIN;

static ACQUISITIONS: AtomicU32 = AtomicU32::new(1);
static LOCK_IDS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Holder identities of the locks taken by this thread and not yet unlocked.
    static HELD: RefCell<Vec<i64>> = const { RefCell::new(Vec::new()) };
}

fn held_by_current_thread(holder: i64) -> bool {
    HELD.with(|held| held.borrow().contains(&holder))
}

/// What to do when the lock cannot be taken within the timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockRecovery {
    /// Assume the holder died: reset the lock and retry, at most `max_attempts` times per call.
    ForceUnlock { max_attempts: u32 },
    /// Give up with [`Error::LockTimeout`].
    Fail,
}

impl Default for LockRecovery {
    fn default() -> Self {
        LockRecovery::ForceUnlock { max_attempts: 3 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockConfig {
    pub timeout: Duration,
    pub recovery: LockRecovery,
    pub pause: PauseStrategy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            recovery: LockRecovery::default(),
            pause: PauseStrategy::default(),
        }
    }
}

/// Proof of holding the lock. Required by [`QueueLock::unlock`].
///
/// Not `Send`: the lock is released by the thread that took it.
#[must_use = "the queue lock stays held until the token is passed to unlock"]
#[derive(Debug)]
pub struct LockToken {
    lock_id: u64,
    holder: i64,
    _not_send: PhantomData<*const ()>,
}

impl LockToken {
    pub fn holder(&self) -> i64 {
        self.holder
    }
}

pub trait QueueLock: Send + Sync {
    /// Blocks until the lock is held by the caller.
    fn acquire_lock(&self) -> Result<LockToken>;
    /// Blocks until nobody else holds the lock, without taking it. Returns at once when the
    /// calling thread is the holder.
    fn wait_for_lock(&self) -> Result<()>;
    fn unlock(&self, token: LockToken) -> Result<()>;
    fn is_locked(&self) -> Result<bool>;
}

/// Interrupts waits on a [`TableStoreQueueLock`] from another thread.
#[derive(Clone, Debug)]
pub struct LockInterrupter {
    flag: Arc<AtomicBool>,
}

impl LockInterrupter {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

pub struct TableStoreQueueLock {
    id: u64,
    value: MappedValue,
    config: LockConfig,
    interrupted: Arc<AtomicBool>,
}

impl TableStoreQueueLock {
    pub fn new(table: &Arc<TableStore>, config: LockConfig) -> Result<Self> {
        Ok(Self {
            id: LOCK_IDS.fetch_add(1, Ordering::Relaxed),
            value: table.acquire_value_for(LOCK_KEY, UNLOCKED)?,
            config,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn interrupter(&self) -> LockInterrupter {
        LockInterrupter {
            flag: Arc::clone(&self.interrupted),
        }
    }

    /// Current holder identity, or `None` when unlocked.
    pub fn holder(&self) -> Result<Option<i64>> {
        let value = self.value.get_volatile()?;
        Ok((value != UNLOCKED).then_some(value))
    }

    pub fn is_held_by_current_thread(&self) -> Result<bool> {
        Ok(held_by_current_thread(self.value.get_volatile()?))
    }

    fn next_holder() -> i64 {
        let acquisition = ACQUISITIONS.fetch_add(1, Ordering::Relaxed);
        ((std::process::id() as i64) << 32) | acquisition as i64
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.interrupted.swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidState(
                "interrupted while waiting for queue lock".to_string(),
            ));
        }
        Ok(())
    }

    /// Resets the lock if it still holds `stale`. Returns whether the reset happened.
    fn force_unlock(&self, stale: i64, waited: Duration) -> Result<bool> {
        if !self.value.compare_and_swap(stale, UNLOCKED)? {
            return Ok(false);
        }
        log::warn!(
            "Forced unlock of queue lock {} after {:?}: it was held by pid {} (holder {:#x}). \
             Assuming that process died; if it is alive its writes may now be corrupted.",
            self.value.store().path().display(),
            waited,
            stale >> 32,
            stale
        );
        Ok(true)
    }

    fn on_timeout(&self, overrides: &mut u32, waited: Duration) -> Result<()> {
        let holder = self.value.get_volatile()?;
        match self.config.recovery {
            LockRecovery::ForceUnlock { max_attempts } if *overrides < max_attempts => {
                if self.force_unlock(holder, waited)? {
                    *overrides += 1;
                }
                Ok(())
            }
            _ => Err(Error::LockTimeout { holder, waited }),
        }
    }
}

impl QueueLock for TableStoreQueueLock {
    fn acquire_lock(&self) -> Result<LockToken> {
        // Waiting on ourselves would end in a forced unlock of our own lock.
        if self.is_held_by_current_thread()? {
            return Err(Error::InvalidState(
                "queue lock is already held by this thread".to_string(),
            ));
        }
        let holder = Self::next_holder();
        let mut pauser = TimingPauser::new(self.config.pause);
        let mut overrides = 0;
        loop {
            if self.value.compare_and_swap(UNLOCKED, holder)? {
                HELD.with(|held| held.borrow_mut().push(holder));
                return Ok(LockToken {
                    lock_id: self.id,
                    holder,
                    _not_send: PhantomData,
                });
            }
            self.check_interrupted()?;
            if let Err(timed_out) = pauser.pause(self.config.timeout) {
                self.on_timeout(&mut overrides, timed_out.waited)?;
                pauser.reset();
            }
        }
    }

    fn wait_for_lock(&self) -> Result<()> {
        let mut pauser = TimingPauser::new(self.config.pause);
        let mut overrides = 0;
        loop {
            let value = self.value.get_volatile()?;
            if value == UNLOCKED || held_by_current_thread(value) {
                return Ok(());
            }
            self.check_interrupted()?;
            if let Err(timed_out) = pauser.pause(self.config.timeout) {
                self.on_timeout(&mut overrides, timed_out.waited)?;
                pauser.reset();
            }
        }
    }

    fn unlock(&self, token: LockToken) -> Result<()> {
        if token.lock_id != self.id {
            return Err(Error::InvalidState(
                "lock token was issued by a different queue lock".to_string(),
            ));
        }
        HELD.with(|held| held.borrow_mut().retain(|&h| h != token.holder));
        if !self.value.compare_and_swap(token.holder, UNLOCKED)? {
            let current = self.value.get_volatile()?;
            log::warn!(
                "Queue lock {} was changed by someone else while held by {:#x}; now {:#x}",
                self.value.store().path().display(),
                token.holder,
                current
            );
        }
        Ok(())
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.value.get_volatile()? != UNLOCKED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn quick(recovery: LockRecovery) -> LockConfig {
        LockConfig {
            timeout: Duration::from_millis(50),
            recovery,
            pause: PauseStrategy::Sleep(Duration::from_millis(1)),
        }
    }

    #[test]
    fn acquire_and_unlock() {
        let dir = tempdir().expect("tempdir");
        let table = TableStore::open(dir.path()).expect("table");
        let lock = TableStoreQueueLock::new(&table, LockConfig::default()).expect("lock");
        assert!(!lock.is_locked().expect("locked"));
        let token = lock.acquire_lock().expect("acquire");
        assert!(lock.is_locked().expect("locked"));
        assert_eq!(lock.holder().expect("holder"), Some(token.holder()));
        assert_eq!(token.holder() >> 32, std::process::id() as i64);
        lock.unlock(token).expect("unlock");
        assert!(!lock.is_locked().expect("locked"));
    }

    #[test]
    fn stuck_holder_is_forcibly_unlocked() {
        let dir = tempdir().expect("tempdir");
        let table = TableStore::open(dir.path()).expect("table");
        table
            .acquire_value_for(LOCK_KEY, UNLOCKED)
            .expect("slot")
            .set_value(0x7777_0000_0001)
            .expect("set");
        let lock = TableStoreQueueLock::new(&table, quick(LockRecovery::default())).expect("lock");
        let token = lock.acquire_lock().expect("recovered");
        lock.unlock(token).expect("unlock");
    }

    #[test]
    fn fail_policy_surfaces_timeout() {
        let dir = tempdir().expect("tempdir");
        let table = TableStore::open(dir.path()).expect("table");
        let stuck = 0x7777_0000_0001;
        table
            .acquire_value_for(LOCK_KEY, UNLOCKED)
            .expect("slot")
            .set_value(stuck)
            .expect("set");
        let lock = TableStoreQueueLock::new(&table, quick(LockRecovery::Fail)).expect("lock");
        match lock.acquire_lock() {
            Err(Error::LockTimeout { holder, waited }) => {
                assert_eq!(holder, stuck);
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(matches!(lock.wait_for_lock(), Err(Error::LockTimeout { .. })));
    }

    #[test]
    fn wait_for_lock_recovers_and_does_not_acquire() {
        let dir = tempdir().expect("tempdir");
        let table = TableStore::open(dir.path()).expect("table");
        let lock = Arc::new(
            TableStoreQueueLock::new(&table, quick(LockRecovery::default())).expect("lock"),
        );
        let holder = Arc::clone(&lock);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let other = std::thread::spawn(move || {
            let token = holder.acquire_lock().expect("acquire");
            locked_tx.send(()).expect("signal");
            done_rx.recv().expect("wait");
            // The original holder finds its lock gone; that is only a warning.
            holder.unlock(token).expect("unlock");
        });
        locked_rx.recv().expect("locked");
        lock.wait_for_lock().expect("forced");
        assert!(!lock.is_locked().expect("locked"));
        done_tx.send(()).expect("release");
        other.join().expect("holder thread");
        assert!(!lock.is_locked().expect("locked"));
    }

    #[test]
    fn holder_thread_does_not_wait_on_itself() {
        let dir = tempdir().expect("tempdir");
        let table = TableStore::open(dir.path()).expect("table");
        let lock = Arc::new(
            TableStoreQueueLock::new(&table, quick(LockRecovery::default())).expect("lock"),
        );
        let token = lock.acquire_lock().expect("acquire");
        assert!(lock.is_held_by_current_thread().expect("held"));

        let started = std::time::Instant::now();
        lock.wait_for_lock().expect("wait");
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(matches!(lock.acquire_lock(), Err(Error::InvalidState(_))));
        assert_eq!(lock.holder().expect("holder"), Some(token.holder()));

        let other_thread = Arc::clone(&lock);
        let held_elsewhere = std::thread::spawn(move || {
            other_thread.is_held_by_current_thread().expect("held")
        })
        .join()
        .expect("thread");
        assert!(!held_elsewhere);

        lock.unlock(token).expect("unlock");
        assert!(!lock.is_held_by_current_thread().expect("held"));
        let again = lock.acquire_lock().expect("reacquire");
        lock.unlock(again).expect("unlock");
    }

    #[test]
    fn foreign_token_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let table = TableStore::open(dir.path()).expect("table");
        let a = TableStoreQueueLock::new(&table, LockConfig::default()).expect("lock");
        let b = TableStoreQueueLock::new(&table, LockConfig::default()).expect("lock");
        let token = a.acquire_lock().expect("acquire");
        assert!(matches!(b.unlock(token), Err(Error::InvalidState(_))));
        assert!(a.is_locked().expect("locked"));
    }

    #[test]
    fn closed_store_fails_fast() {
        let dir = tempdir().expect("tempdir");
        let table = TableStore::open(dir.path()).expect("table");
        let lock = TableStoreQueueLock::new(&table, LockConfig::default()).expect("lock");
        let token = lock.acquire_lock().expect("acquire");
        table.close();
        assert!(matches!(lock.unlock(token), Err(Error::InvalidState(_))));
        assert!(matches!(lock.acquire_lock(), Err(Error::InvalidState(_))));
        assert!(matches!(lock.wait_for_lock(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn interrupt_aborts_a_wait() {
        let dir = tempdir().expect("tempdir");
        let table = TableStore::open(dir.path()).expect("table");
        let lock = Arc::new(
            TableStoreQueueLock::new(
                &table,
                LockConfig {
                    timeout: Duration::from_secs(30),
                    ..quick(LockRecovery::Fail)
                },
            )
            .expect("lock"),
        );
        let token = lock.acquire_lock().expect("acquire");
        let interrupter = lock.interrupter();
        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.acquire_lock().map(|token| token.holder()))
        };
        std::thread::sleep(Duration::from_millis(20));
        interrupter.interrupt();
        let result = waiter.join().expect("join");
        assert!(matches!(result, Err(Error::InvalidState(_))));
        lock.unlock(token).expect("unlock");
    }

    #[test]
    fn mutual_exclusion_between_handles() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().to_path_buf();
        let inside = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    let table = TableStore::open(&path).expect("table");
                    let lock = TableStoreQueueLock::new(&table, LockConfig::default())
                        .expect("lock");
                    for _ in 0..200 {
                        let token = lock.acquire_lock().expect("acquire");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::hint::spin_loop();
                        assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                        lock.unlock(token).expect("unlock");
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("join");
        }
    }
}
