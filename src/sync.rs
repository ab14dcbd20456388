//! Synchronization primitives
//!
//! Four layers, bottom up: [`Spinlock`] is the raw owner-tracking
//! test-and-set lock; [`SpinLock`] wraps data with an RAII guard and
//! protects the scheduler's own lists; [`Mutex`] and [`Semaphore`] are the
//! blocking primitives, parking waiters through the scheduler and handing
//! ownership (or a unit of count) to the first waiter in FIFO order.
//!
//! Single-core model: spinning only ever waits out an interrupt-driven
//! critical section, never another core.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::types::TaskId;

// ============================================================================
// Scheduler Hooks
// ============================================================================

/// What the blocking primitives need from the scheduler
pub trait WaitOps {
    /// Id of the task invoking the primitive
    fn current_task(&self) -> TaskId;

    /// Park the calling task until `wake`; consumes a pending wake instead
    /// of blocking when one already arrived.
    fn block_current(&self);

    /// Make a parked task READY again (or latch a pending wake)
    fn wake(&self, id: TaskId);
}

// ============================================================================
// Spinlock
// ============================================================================

/// Busy-wait lock with owner tracking
///
/// `release` by anyone but the recorded owner is silently ignored.
pub struct Spinlock {
    locked: AtomicBool,
    /// Raw id of the holder; meaningful only while `locked`
    owner: AtomicU32,
    /// Total successful acquisitions
    count: AtomicU32,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(0),
            count: AtomicU32::new(0),
        }
    }

    /// Acquire, spinning until available; records `owner` as the holder
    pub fn acquire(&self, owner: TaskId) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        self.owner.store(owner.0, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Non-blocking acquire
    pub fn try_acquire(&self, owner: TaskId) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(owner.0, Ordering::Relaxed);
            self.count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Release if `caller` is the recorded owner; otherwise a no-op
    pub fn release(&self, caller: TaskId) {
        if !self.locked.load(Ordering::Relaxed) {
            return;
        }
        if self.owner.load(Ordering::Relaxed) != caller.0 {
            return;
        }
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Successful acquisitions so far
    pub fn acquisitions(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SpinLock<T> with RAII guard
// ============================================================================

/// A spin lock protecting its data, released by guard drop
///
/// The scheduler's task table and ready queues each sit behind one of
/// these; at most one is held at a time, so no ordering protocol is needed.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

// SAFETY: the lock serializes all access to the inner data.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> core::ops::Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard witnesses exclusive lock ownership.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> core::ops::DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ============================================================================
// Mutex
// ============================================================================

struct MutexState {
    owner: Option<TaskId>,
    waiters: VecDeque<TaskId>,
}

/// Blocking mutual exclusion with FIFO ownership handoff
///
/// `lock` either acquires immediately or parks the caller; `unlock` hands
/// ownership directly to the longest-waiting task, which resumes already
/// owning the mutex. `unlock` by a non-owner is silently ignored.
pub struct Mutex {
    state: SpinLock<MutexState>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(MutexState {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn lock<W: WaitOps>(&self, sched: &W) {
        let me = sched.current_task();

        {
            let mut state = self.state.lock();
            if state.owner.is_none() {
                state.owner = Some(me);
                return;
            }
            state.waiters.push_back(me);
        }

        // Does not return until unlock() hands us ownership
        sched.block_current();
    }

    pub fn try_lock<W: WaitOps>(&self, sched: &W) -> bool {
        let mut state = self.state.lock();
        if state.owner.is_none() {
            state.owner = Some(sched.current_task());
            true
        } else {
            false
        }
    }

    pub fn unlock<W: WaitOps>(&self, sched: &W) {
        let me = sched.current_task();

        let next = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return;
            }
            match state.waiters.pop_front() {
                Some(next) => {
                    state.owner = Some(next);
                    Some(next)
                }
                None => {
                    state.owner = None;
                    None
                }
            }
        };

        if let Some(next) = next {
            sched.wake(next);
        }
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Current owner, if any
    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock().owner
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Semaphore
// ============================================================================

struct SemaphoreState {
    count: u32,
    waiters: VecDeque<TaskId>,
}

/// Counting semaphore
///
/// `wait` takes a unit or parks the caller when the count is zero; `post`
/// hands a unit directly to the longest-waiting task instead of raising
/// the count past it.
pub struct Semaphore {
    state: SpinLock<SemaphoreState>,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            state: SpinLock::new(SemaphoreState {
                count: initial,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn wait<W: WaitOps>(&self, sched: &W) {
        let me = sched.current_task();

        {
            let mut state = self.state.lock();
            if state.count > 0 {
                state.count -= 1;
                return;
            }
            state.waiters.push_back(me);
        }

        sched.block_current();
    }

    /// Take a unit without blocking; false when the count is zero
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn post<W: WaitOps>(&self, sched: &W) {
        let next = {
            let mut state = self.state.lock();
            match state.waiters.pop_front() {
                Some(next) => Some(next),
                None => {
                    state.count += 1;
                    None
                }
            }
        };

        if let Some(next) = next {
            sched.wake(next);
        }
    }

    pub fn count(&self) -> u32 {
        self.state.lock().count
    }
}
