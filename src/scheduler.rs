//! Preemptive priority scheduler
//!
//! Five strict priority levels with one ready queue per level. Insertion is
//! head-first and selection always takes the current head without rotation,
//! so equal-priority tasks get last-in-first-scheduled service; a task
//! leaves its queue only when it stops being runnable (blocked, suspended,
//! terminated), not because it was scheduled.
//!
//! All scheduler state lives in one owned [`Scheduler`] value: the task
//! table, the ready queues, and the cumulative counters, each behind its
//! own lock with at most one held at a time. The periodic timer calls
//! [`Scheduler::tick`]; everything else happens on the calling task's own
//! time.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Once;

use crate::platform::{HardwarePlatform, Platform};
use crate::sync::{SpinLock, WaitOps};
use crate::task::{TaskEntry, TaskName, TaskTable, Tcb, KERNEL_PAGE_DIR, TASK_STACK_SIZE};
use crate::task::{alloc_fpu_state, make_task_name, CpuContext, TaskStack};
use crate::timer::{ms_to_ticks, Clock, SystemClock};
use crate::types::{KernError, KernResult, Priority, TaskFlags, TaskId, TaskState};
use crate::types::PRIORITY_LEVELS;

// ============================================================================
// Constants
// ============================================================================

/// Default time-slice quantum in milliseconds
pub const DEFAULT_QUANTUM_MS: u32 = 50;

/// Valid quantum range
pub const MAX_QUANTUM_MS: u32 = 1000;

// ============================================================================
// Ready Queues
// ============================================================================

/// One queue of task ids per priority level
///
/// A task is linked here while READY or RUNNING, always in the queue of its
/// current priority, and never in more than one queue.
#[derive(Debug)]
struct ReadyQueues {
    queues: [alloc::collections::VecDeque<TaskId>; PRIORITY_LEVELS],
}

impl ReadyQueues {
    const fn new() -> Self {
        const EMPTY: alloc::collections::VecDeque<TaskId> = alloc::collections::VecDeque::new();
        Self {
            queues: [EMPTY; PRIORITY_LEVELS],
        }
    }

    /// New and returning-to-ready tasks become the queue head
    fn insert_head(&mut self, priority: Priority, id: TaskId) {
        self.queues[priority.index()].push_front(id);
    }

    /// Unlink `id` from its priority's queue; no-op when not linked
    fn remove(&mut self, priority: Priority, id: TaskId) {
        let queue = &mut self.queues[priority.index()];
        if let Some(pos) = queue.iter().position(|&t| t == id) {
            queue.remove(pos);
        }
    }

    /// Head of the highest non-empty queue
    fn head_highest(&self) -> Option<TaskId> {
        self.queues
            .iter()
            .rev()
            .find_map(|queue| queue.front().copied())
    }

    /// Is any task queued strictly above `priority`?
    fn has_task_above(&self, priority: Priority) -> bool {
        self.queues[priority.index() + 1..]
            .iter()
            .any(|queue| !queue.is_empty())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Cumulative counters; per-state task counts are derived from the task
/// table at snapshot time instead of being tracked incrementally.
struct SchedCounters {
    context_switches: AtomicU64,
    idle_time: AtomicU64,
    total_cpu_time: AtomicU64,
}

/// Scheduler statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub total_tasks: u32,
    pub running_tasks: u32,
    pub ready_tasks: u32,
    pub blocked_tasks: u32,
    pub context_switches: u64,
    pub idle_time: u64,
    pub total_cpu_time: u64,
}

// ============================================================================
// Scheduler
// ============================================================================

/// The task scheduling core
///
/// Generic over the platform (context switch + fatal halt) and the tick
/// source, so tests run it against fakes while the kernel wires the real
/// machine.
pub struct Scheduler<P: Platform, C: Clock> {
    platform: P,
    clock: C,
    tasks: SpinLock<TaskTable>,
    ready: SpinLock<ReadyQueues>,
    /// Raw id of the RUNNING task
    current: AtomicU32,
    quantum_ms: AtomicU32,
    counters: SchedCounters,
}

impl<P: Platform, C: Clock> Scheduler<P, C> {
    /// A scheduler with no tasks; call [`Scheduler::init`] before use
    pub fn new(platform: P, clock: C) -> Self {
        Self {
            platform,
            clock,
            tasks: SpinLock::new(TaskTable::new()),
            ready: SpinLock::new(ReadyQueues::new()),
            current: AtomicU32::new(0),
            quantum_ms: AtomicU32::new(DEFAULT_QUANTUM_MS),
            counters: SchedCounters {
                context_switches: AtomicU64::new(0),
                idle_time: AtomicU64::new(0),
                total_cpu_time: AtomicU64::new(0),
            },
        }
    }

    /// Create the idle task (id 0) and make it the current task.
    ///
    /// The boot context becomes the idle task: its live state is captured
    /// into the idle TCB at the first switch away, so `idle_entry` only
    /// runs if the idle task is ever recreated from its initial snapshot.
    pub fn init(&self, idle_entry: TaskEntry) -> KernResult<()> {
        let stack = TaskStack::allocate(TASK_STACK_SIZE).ok_or(KernError::NoMemory)?;
        let flags = TaskFlags::KERNEL | TaskFlags::SYSTEM;
        let context = CpuContext::initial(idle_entry, stack.top(), flags, KERNEL_PAGE_DIR);
        let quantum = self.quantum_ticks();

        let idle = Tcb {
            id: TaskId::IDLE,
            name: make_task_name("idle"),
            state: TaskState::Running,
            priority: Priority::Idle,
            flags,
            context,
            fpu_state: None,
            stack,
            page_directory: KERNEL_PAGE_DIR,
            parent: None,
            sleep_deadline: None,
            wake_pending: false,
            creation_time: self.clock.now_ticks(),
            last_run: 0,
            cpu_time: 0,
            time_slice: quantum,
            time_slice_remaining: quantum,
            context_switches: 0,
            exit_code: 0,
        };

        self.tasks.lock().install_idle(idle)?;
        self.ready.lock().insert_head(Priority::Idle, TaskId::IDLE);
        self.current.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Tick source this scheduler runs on
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Id of the RUNNING task
    pub fn current_id(&self) -> TaskId {
        TaskId(self.current.load(Ordering::SeqCst))
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Create a task and make it READY.
    ///
    /// The new task inherits the creator's page directory and records it as
    /// parent; it is linked at the head of its priority's ready queue but
    /// does not preempt anyone until the next tick.
    pub fn create(
        &self,
        name: &str,
        entry: TaskEntry,
        priority: Priority,
        flags: TaskFlags,
    ) -> KernResult<TaskId> {
        let now = self.clock.now_ticks();
        let quantum = self.quantum_ticks();
        let creator = self.current_id();

        let id = {
            let mut tasks = self.tasks.lock();
            let (parent, page_directory) = match tasks.get(creator) {
                Some(tcb) => (Some(creator), tcb.page_directory),
                None => (None, KERNEL_PAGE_DIR),
            };
            tasks.create(
                name,
                entry,
                priority,
                flags,
                parent,
                page_directory,
                now,
                quantum,
            )?
        };

        self.ready.lock().insert_head(priority, id);
        Ok(id)
    }

    /// Create a NORMAL-priority kernel task
    pub fn kernel_task_create(&self, name: &str, entry: TaskEntry) -> KernResult<TaskId> {
        self.create(
            name,
            entry,
            Priority::Normal,
            TaskFlags::KERNEL | TaskFlags::SYSTEM,
        )
    }

    /// Reclaim a task's TCB, stack, and FPU state.
    ///
    /// The idle task and the currently running task are refused; a RUNNING
    /// task terminates itself with [`Scheduler::exit`] and is reclaimed
    /// afterwards.
    pub fn destroy(&self, id: TaskId) -> KernResult<()> {
        if id.is_idle() || id == self.current_id() {
            return Err(KernError::InvalidState);
        }

        let priority = {
            let tasks = self.tasks.lock();
            tasks.get(id).ok_or(KernError::NotFound)?.priority
        };

        // Unlink from the ready queue first so the queue never holds an id
        // the table no longer knows.
        self.ready.lock().remove(priority, id);
        self.tasks.lock().remove(id);
        Ok(())
    }

    /// READY or RUNNING -> SUSPENDED; suspending the running task
    /// reschedules immediately.
    pub fn suspend(&self, id: TaskId) -> KernResult<()> {
        if id.is_idle() {
            return Err(KernError::InvalidState);
        }

        let priority = {
            let mut tasks = self.tasks.lock();
            let tcb = tasks.get_mut(id).ok_or(KernError::NotFound)?;
            match tcb.state {
                TaskState::Ready | TaskState::Running => tcb.state = TaskState::Suspended,
                _ => return Err(KernError::InvalidState),
            }
            tcb.priority
        };

        self.ready.lock().remove(priority, id);

        if id == self.current_id() {
            self.schedule_next();
        }
        Ok(())
    }

    /// SUSPENDED -> READY
    pub fn resume(&self, id: TaskId) -> KernResult<()> {
        let priority = {
            let mut tasks = self.tasks.lock();
            let tcb = tasks.get_mut(id).ok_or(KernError::NotFound)?;
            if tcb.state != TaskState::Suspended {
                return Err(KernError::InvalidState);
            }
            tcb.state = TaskState::Ready;
            tcb.priority
        };

        self.ready.lock().insert_head(priority, id);
        Ok(())
    }

    /// Block the calling task for at least `ms` milliseconds.
    ///
    /// Converts to a tick deadline at the clock's rate and switches away;
    /// the call returns when the deadline has passed and the task is
    /// scheduled again. A no-op for the idle task.
    pub fn sleep(&self, ms: u64) {
        let me = self.current_id();
        if me.is_idle() {
            return;
        }

        let deadline = self.clock.now_ticks() + ms_to_ticks(ms, self.clock.ticks_per_second());
        let priority = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(me) {
                Some(tcb) => {
                    tcb.state = TaskState::Blocked;
                    tcb.sleep_deadline = Some(deadline);
                    tcb.priority
                }
                None => return,
            }
        };

        self.ready.lock().remove(priority, me);
        self.schedule_next();
    }

    /// Terminate the calling task with `code`; a no-op for the idle task.
    ///
    /// The task stays TERMINATED in the table until `destroy` reclaims it.
    pub fn exit(&self, code: i32) {
        let me = self.current_id();
        if me.is_idle() {
            return;
        }

        let priority = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(me) {
                Some(tcb) => {
                    tcb.exit_code = code;
                    tcb.state = TaskState::Terminated;
                    tcb.priority
                }
                None => return,
            }
        };

        self.ready.lock().remove(priority, me);
        self.schedule_next();
    }

    /// Give up the rest of the time slice
    pub fn yield_now(&self) {
        let me = self.current_id();
        {
            let mut tasks = self.tasks.lock();
            if let Some(tcb) = tasks.get_mut(me) {
                tcb.time_slice_remaining = tcb.time_slice;
            }
        }
        self.schedule_next();
    }

    /// Move a task to a new priority level.
    ///
    /// A linked (READY or RUNNING) task is re-queued at the head of the new
    /// level's queue.
    pub fn set_priority(&self, id: TaskId, priority: Priority) -> KernResult<()> {
        let relink = {
            let mut tasks = self.tasks.lock();
            let tcb = tasks.get_mut(id).ok_or(KernError::NotFound)?;
            let old = tcb.priority;
            if old == priority {
                return Ok(());
            }
            tcb.priority = priority;
            matches!(tcb.state, TaskState::Ready | TaskState::Running).then_some(old)
        };

        if let Some(old) = relink {
            let mut ready = self.ready.lock();
            ready.remove(old, id);
            ready.insert_head(priority, id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.lock().get(id).map(|tcb| tcb.state)
    }

    pub fn name(&self, id: TaskId) -> Option<TaskName> {
        self.tasks.lock().get(id).map(|tcb| tcb.name.clone())
    }

    pub fn priority(&self, id: TaskId) -> Option<Priority> {
        self.tasks.lock().get(id).map(|tcb| tcb.priority)
    }

    pub fn exit_code(&self, id: TaskId) -> Option<i32> {
        self.tasks.lock().get(id).map(|tcb| tcb.exit_code)
    }

    /// Statistics snapshot; task counts come from one pass over the table
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            context_switches: self.counters.context_switches.load(Ordering::Relaxed),
            idle_time: self.counters.idle_time.load(Ordering::Relaxed),
            total_cpu_time: self.counters.total_cpu_time.load(Ordering::Relaxed),
            ..SchedulerStats::default()
        };

        let tasks = self.tasks.lock();
        for tcb in tasks.iter() {
            stats.total_tasks += 1;
            match tcb.state {
                TaskState::Running => stats.running_tasks += 1,
                TaskState::Ready => stats.ready_tasks += 1,
                TaskState::Blocked => stats.blocked_tasks += 1,
                _ => {}
            }
        }
        stats
    }

    /// Print one line per task through the kernel console
    pub fn dump_tasks(&self) {
        crate::println!("ID    Name             State      Pri  CPU");
        let tasks = self.tasks.lock();
        for tcb in tasks.iter() {
            crate::println!(
                "{:<5} {:<16} {:<10} {:<4} {}",
                tcb.id.0,
                tcb.name.as_str(),
                tcb.state.as_str(),
                tcb.priority.index(),
                tcb.cpu_time
            );
        }
    }

    // ------------------------------------------------------------------
    // Quantum & FPU
    // ------------------------------------------------------------------

    /// Set the time-slice quantum for tasks created from now on
    pub fn set_quantum(&self, quantum_ms: u32) -> KernResult<()> {
        if quantum_ms == 0 || quantum_ms > MAX_QUANTUM_MS {
            return Err(KernError::InvalidArgument);
        }
        self.quantum_ms.store(quantum_ms, Ordering::SeqCst);
        Ok(())
    }

    pub fn quantum_ms(&self) -> u32 {
        self.quantum_ms.load(Ordering::SeqCst)
    }

    fn quantum_ticks(&self) -> u32 {
        let ms = self.quantum_ms.load(Ordering::SeqCst) as u64;
        ms_to_ticks(ms, self.clock.ticks_per_second()).max(1) as u32
    }

    /// Lazily allocate a task's FPU save area
    pub fn enable_fpu(&self, id: TaskId) -> KernResult<()> {
        let mut tasks = self.tasks.lock();
        let tcb = tasks.get_mut(id).ok_or(KernError::NotFound)?;
        if tcb.fpu_state.is_none() {
            tcb.fpu_state = Some(alloc_fpu_state().ok_or(KernError::NoMemory)?);
        }
        tcb.flags |= TaskFlags::FPU;
        Ok(())
    }

    /// Release a task's FPU save area
    pub fn disable_fpu(&self, id: TaskId) -> KernResult<()> {
        let mut tasks = self.tasks.lock();
        let tcb = tasks.get_mut(id).ok_or(KernError::NotFound)?;
        tcb.drop_fpu_state();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tick & dispatch
    // ------------------------------------------------------------------

    /// Periodic maintenance, invoked once per timer interrupt.
    ///
    /// Wakes BLOCKED tasks whose sleep deadline has passed (one scan over
    /// the whole task table per tick), charges the running task's cpu time,
    /// burns one tick of its slice, and reschedules when the slice is gone
    /// or a strictly higher-priority task is READY.
    pub fn tick(&self) {
        let now = self.clock.now_ticks();
        let me = self.current_id();

        let mut due: Vec<(TaskId, Priority)> = Vec::new();
        let mut expired = false;
        let mut my_priority = Priority::Idle;

        {
            let mut tasks = self.tasks.lock();
            for tcb in tasks.iter_mut() {
                if tcb.state == TaskState::Blocked {
                    if let Some(deadline) = tcb.sleep_deadline {
                        if now >= deadline {
                            tcb.sleep_deadline = None;
                            tcb.state = TaskState::Ready;
                            due.push((tcb.id, tcb.priority));
                        }
                    }
                }
            }

            if let Some(tcb) = tasks.get_mut(me) {
                tcb.cpu_time += 1;
                if tcb.time_slice_remaining > 0 {
                    tcb.time_slice_remaining -= 1;
                }
                expired = tcb.time_slice_remaining == 0;
                my_priority = tcb.priority;
            }
        }

        self.counters.total_cpu_time.fetch_add(1, Ordering::Relaxed);
        if me.is_idle() {
            self.counters.idle_time.fetch_add(1, Ordering::Relaxed);
        }

        let preempt = {
            let mut ready = self.ready.lock();
            for &(id, priority) in &due {
                ready.insert_head(priority, id);
            }
            ready.has_task_above(my_priority)
        };

        if expired || preempt {
            if expired {
                let mut tasks = self.tasks.lock();
                if let Some(tcb) = tasks.get_mut(me) {
                    tcb.time_slice_remaining = tcb.time_slice;
                }
            }
            self.schedule_next();
        }
    }

    /// Dispatch the highest-priority ready task.
    ///
    /// Zero candidates means the idle task is gone, which is unreachable in
    /// correct operation and halts the system. Selecting the task that is
    /// already RUNNING is a no-op; otherwise the outgoing task (if still
    /// RUNNING) returns to READY and control transfers through the platform
    /// switch primitive, which does not return here until this task is
    /// scheduled again.
    pub fn schedule_next(&self) {
        let prev = self.current_id();

        let next = match self.ready.lock().head_highest() {
            Some(id) => id,
            None => self.platform.fatal("scheduler: no ready task"),
        };

        let (from_ctx, to_ctx) = {
            let mut tasks = self.tasks.lock();

            if next == prev {
                if let Some(tcb) = tasks.get_mut(prev) {
                    tcb.state = TaskState::Running;
                }
                return;
            }

            if let Some(out) = tasks.get_mut(prev) {
                if out.state == TaskState::Running {
                    out.state = TaskState::Ready;
                }
            }

            let now = self.clock.now_ticks();
            let incoming = match tasks.get_mut(next) {
                Some(tcb) => tcb,
                // A queue entry the table no longer knows; destroy unlinks
                // queue-first, so this cannot happen.
                None => return,
            };
            incoming.state = TaskState::Running;
            incoming.last_run = now;
            incoming.context_switches += 1;

            self.current.store(next.0, Ordering::SeqCst);
            self.counters
                .context_switches
                .fetch_add(1, Ordering::Relaxed);

            let to = match tasks.context_ptr(next) {
                Some(ptr) => ptr,
                None => return,
            };
            let from = match tasks.context_ptr(prev) {
                Some(ptr) => ptr,
                None => return,
            };
            (from, to)
        };

        // SAFETY: both snapshots live in boxed TCBs that outlive this call
        // (`destroy` refuses the running task, and `prev` was running until
        // this dispatch); single core, non-reentrant interrupt model.
        unsafe {
            self.platform.context_switch(from_ctx, to_ctx);
        }
    }
}

impl<P: Platform, C: Clock> WaitOps for Scheduler<P, C> {
    fn current_task(&self) -> TaskId {
        self.current_id()
    }

    /// Park the calling task for a synchronization primitive: BLOCKED with
    /// no deadline, unlinked, switched away. A wake that already arrived is
    /// consumed instead.
    fn block_current(&self) {
        let me = self.current_id();

        let priority = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(me) {
                Some(tcb) => {
                    if tcb.wake_pending {
                        tcb.wake_pending = false;
                        return;
                    }
                    tcb.state = TaskState::Blocked;
                    tcb.sleep_deadline = None;
                    tcb.priority
                }
                None => return,
            }
        };

        self.ready.lock().remove(priority, me);
        self.schedule_next();
    }

    /// Return a BLOCKED task to READY (head of its queue). Waking a task
    /// that has not blocked yet latches a pending wake; SUSPENDED and
    /// TERMINATED tasks are not disturbed.
    fn wake(&self, id: TaskId) {
        let priority = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(id) {
                Some(tcb) => match tcb.state {
                    TaskState::Blocked => {
                        tcb.state = TaskState::Ready;
                        tcb.sleep_deadline = None;
                        Some(tcb.priority)
                    }
                    TaskState::Running | TaskState::Ready => {
                        tcb.wake_pending = true;
                        None
                    }
                    _ => None,
                },
                None => None,
            }
        };

        if let Some(priority) = priority {
            self.ready.lock().insert_head(priority, id);
        }
    }
}

// ============================================================================
// Global Instance
// ============================================================================

/// The kernel's scheduler, on real hardware and the system tick source
static SCHEDULER: Once<Scheduler<HardwarePlatform, SystemClock>> = Once::new();

/// Create the global scheduler and its idle task
pub fn init(idle_entry: TaskEntry) -> KernResult<()> {
    let sched = SCHEDULER.call_once(|| Scheduler::new(HardwarePlatform, SystemClock::new()));
    sched.init(idle_entry)
}

/// The global scheduler; panics before `init`
pub fn global_scheduler() -> &'static Scheduler<HardwarePlatform, SystemClock> {
    SCHEDULER.get().expect("scheduler not initialized")
}

/// Timer interrupt entry: advance the system clock and run one tick
pub fn timer_interrupt() {
    let sched = global_scheduler();
    sched.clock().advance();
    sched.tick();
}

/// Idle task body: halt until the next interrupt
pub extern "C" fn idle_task_entry() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: hlt resumes at the next interrupt.
        unsafe {
            core::arch::asm!("hlt");
        }

        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("wfi");
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::TestPlatform;

    extern "C" fn noop_entry() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn sched() -> Scheduler<TestPlatform, SystemClock> {
        let sched = Scheduler::new(TestPlatform::new(), SystemClock::new());
        sched.init(noop_entry).unwrap();
        sched
    }

    fn tick(sched: &Scheduler<TestPlatform, SystemClock>) {
        sched.clock().advance();
        sched.tick();
    }

    fn spawn(sched: &Scheduler<TestPlatform, SystemClock>, name: &str, pri: Priority) -> TaskId {
        sched.create(name, noop_entry, pri, TaskFlags::KERNEL).unwrap()
    }

    #[test]
    fn test_init_makes_idle_current() {
        let sched = sched();
        assert_eq!(sched.current_id(), TaskId::IDLE);
        assert_eq!(sched.state(TaskId::IDLE), Some(TaskState::Running));
        assert_eq!(sched.name(TaskId::IDLE).unwrap().as_str(), "idle");
    }

    #[test]
    fn test_strict_priority_selection() {
        let sched = sched();
        let low = spawn(&sched, "low", Priority::Low);
        let high = spawn(&sched, "high", Priority::High);
        let normal = spawn(&sched, "normal", Priority::Normal);

        sched.schedule_next();
        assert_eq!(sched.current_id(), high);
        assert_eq!(sched.state(high), Some(TaskState::Running));

        // Every other READY task sits at or below the selected priority
        for id in [low, normal, TaskId::IDLE] {
            assert!(sched.priority(id).unwrap() <= sched.priority(high).unwrap());
        }
    }

    #[test]
    fn test_idle_never_selected_while_others_ready() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Low);

        sched.schedule_next();
        assert_eq!(sched.current_id(), a);

        // Even after many ticks, idle stays off the core while `a` is READY
        for _ in 0..200 {
            tick(&sched);
            assert_eq!(sched.current_id(), a);
        }
    }

    #[test]
    fn test_equal_priority_last_in_first_scheduled() {
        let sched = sched();
        let _first = spawn(&sched, "first", Priority::Normal);
        let second = spawn(&sched, "second", Priority::Normal);

        // Head insertion: the later task is at the head, so it runs first
        sched.schedule_next();
        assert_eq!(sched.current_id(), second);
    }

    #[test]
    fn test_scheduled_task_stays_queued() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();
        assert_eq!(sched.current_id(), a);

        // Dispatch did not unlink `a`: with no other work, re-dispatch
        // selects it again as a no-op.
        sched.schedule_next();
        assert_eq!(sched.current_id(), a);
        assert_eq!(sched.state(a), Some(TaskState::Running));
    }

    #[test]
    fn test_slice_expiry_rotates_to_queue_head() {
        let sched = sched();
        sched.set_quantum(2).unwrap();
        let a = spawn(&sched, "a", Priority::Normal);
        let b = spawn(&sched, "b", Priority::Normal);

        sched.schedule_next();
        assert_eq!(sched.current_id(), b);

        // Burn b's 2-tick slice. b stayed at the head of [b, a] when it was
        // dispatched, so expiry re-selects b: no rotation among equals.
        tick(&sched);
        tick(&sched);
        assert_eq!(sched.current_id(), b);

        // Blocking b hands the core to a
        sched.suspend(b).unwrap();
        assert_eq!(sched.current_id(), a);
    }

    #[test]
    fn test_higher_priority_ready_preempts_on_tick() {
        let sched = sched();
        let normal = spawn(&sched, "normal", Priority::Normal);
        sched.schedule_next();
        assert_eq!(sched.current_id(), normal);

        let crit = spawn(&sched, "crit", Priority::Critical);
        assert_eq!(sched.current_id(), normal);

        tick(&sched);
        assert_eq!(sched.current_id(), crit);
        assert_eq!(sched.state(normal), Some(TaskState::Ready));
    }

    #[test]
    fn test_sleep_accuracy() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();

        // 10 ms at 1000 Hz = 10 ticks from now
        sched.sleep(10);
        assert_eq!(sched.state(a), Some(TaskState::Blocked));
        assert_eq!(sched.current_id(), TaskId::IDLE);

        // Not READY before now + T
        for _ in 0..9 {
            tick(&sched);
            assert_eq!(sched.state(a), Some(TaskState::Blocked));
        }

        // READY at/after now + T, and preempts idle on the same tick
        tick(&sched);
        assert_eq!(sched.current_id(), a);
        assert_eq!(sched.state(a), Some(TaskState::Running));
    }

    #[test]
    fn test_exit_terminates_and_reschedules() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();

        sched.exit(3);
        assert_eq!(sched.state(a), Some(TaskState::Terminated));
        assert_eq!(sched.exit_code(a), Some(3));
        assert_eq!(sched.current_id(), TaskId::IDLE);

        // TERMINATED is absorbing until destroy reclaims the TCB
        tick(&sched);
        assert_eq!(sched.state(a), Some(TaskState::Terminated));
        sched.destroy(a).unwrap();
        assert_eq!(sched.state(a), None);
    }

    #[test]
    fn test_exit_from_idle_is_noop() {
        let sched = sched();
        sched.exit(1);
        assert_eq!(sched.state(TaskId::IDLE), Some(TaskState::Running));
    }

    #[test]
    fn test_destroy_refuses_idle_and_current() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();

        assert_eq!(sched.destroy(TaskId::IDLE), Err(KernError::InvalidState));
        assert_eq!(sched.destroy(a), Err(KernError::InvalidState));
        assert_eq!(sched.destroy(TaskId(99)), Err(KernError::NotFound));
    }

    #[test]
    fn test_destroy_ready_task() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        let b = spawn(&sched, "b", Priority::Normal);
        sched.schedule_next();
        assert_eq!(sched.current_id(), b);

        sched.destroy(a).unwrap();
        assert_eq!(sched.state(a), None);

        // The destroyed task can never be selected again
        sched.suspend(b).unwrap();
        assert_eq!(sched.current_id(), TaskId::IDLE);
    }

    #[test]
    fn test_suspend_resume_cycle() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();
        assert_eq!(sched.current_id(), a);

        sched.suspend(a).unwrap();
        assert_eq!(sched.state(a), Some(TaskState::Suspended));
        assert_eq!(sched.current_id(), TaskId::IDLE);

        // Only resume brings it back; ticks never do
        for _ in 0..5 {
            tick(&sched);
            assert_eq!(sched.state(a), Some(TaskState::Suspended));
        }

        sched.resume(a).unwrap();
        assert_eq!(sched.state(a), Some(TaskState::Ready));
        tick(&sched);
        assert_eq!(sched.current_id(), a);
    }

    #[test]
    fn test_suspend_rejects_bad_states() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();

        sched.suspend(a).unwrap();
        assert_eq!(sched.suspend(a), Err(KernError::InvalidState));
        assert_eq!(sched.resume(a), Ok(()));
        assert_eq!(sched.resume(a), Err(KernError::InvalidState));
        assert_eq!(sched.suspend(TaskId::IDLE), Err(KernError::InvalidState));
    }

    #[test]
    fn test_set_priority_relinks() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Low);
        let b = spawn(&sched, "b", Priority::Normal);
        sched.schedule_next();
        assert_eq!(sched.current_id(), b);

        sched.set_priority(a, Priority::Critical).unwrap();
        assert_eq!(sched.priority(a), Some(Priority::Critical));
        tick(&sched);
        assert_eq!(sched.current_id(), a);

        assert_eq!(
            sched.set_priority(TaskId(42), Priority::High),
            Err(KernError::NotFound)
        );
    }

    #[test]
    fn test_yield_between_equals() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        let b = spawn(&sched, "b", Priority::Normal);
        sched.schedule_next();
        assert_eq!(sched.current_id(), b);

        // Yield re-dispatches the queue head; with [b, a] that is b itself,
        // so the yield is a no-op until b stops being runnable.
        sched.yield_now();
        assert_eq!(sched.current_id(), b);

        sched.sleep(5);
        assert_eq!(sched.current_id(), a);
    }

    #[test]
    fn test_quantum_validation() {
        let sched = sched();
        assert_eq!(sched.quantum_ms(), DEFAULT_QUANTUM_MS);
        assert_eq!(sched.set_quantum(0), Err(KernError::InvalidArgument));
        assert_eq!(sched.set_quantum(1001), Err(KernError::InvalidArgument));
        sched.set_quantum(10).unwrap();
        assert_eq!(sched.quantum_ms(), 10);
    }

    #[test]
    fn test_stats_snapshot() {
        let sched = sched();
        let _a = spawn(&sched, "a", Priority::Normal);
        let b = spawn(&sched, "b", Priority::Normal);
        sched.schedule_next();
        sched.sleep(100);

        // b asleep: a runs, idle READY
        let stats = sched.stats();
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.running_tasks, 1);
        assert_eq!(stats.ready_tasks, 1);
        assert_eq!(stats.blocked_tasks, 1);
        assert!(stats.context_switches >= 2);
        let _ = b;
    }

    #[test]
    fn test_idle_time_accrues_only_when_idle() {
        let sched = sched();
        tick(&sched);
        tick(&sched);
        assert_eq!(sched.stats().idle_time, 2);

        let _a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();
        tick(&sched);
        tick(&sched);
        assert_eq!(sched.stats().idle_time, 2);
        assert_eq!(sched.stats().total_cpu_time, 4);
    }

    #[test]
    #[should_panic(expected = "no ready task")]
    fn test_empty_ready_queues_fatal() {
        let sched = Scheduler::new(TestPlatform::new(), SystemClock::new());
        // No idle task installed: dispatch finds zero candidates
        sched.schedule_next();
    }

    #[test]
    fn test_create_validation_and_inheritance() {
        let sched = sched();
        assert_eq!(
            sched.create("", noop_entry, Priority::Normal, TaskFlags::KERNEL),
            Err(KernError::InvalidArgument)
        );

        let a = sched.kernel_task_create("worker", noop_entry).unwrap();
        assert_eq!(sched.priority(a), Some(Priority::Normal));
        assert_eq!(sched.state(a), Some(TaskState::Ready));
    }

    #[test]
    fn test_fpu_enable_disable() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);

        sched.enable_fpu(a).unwrap();
        sched.enable_fpu(a).unwrap();
        sched.disable_fpu(a).unwrap();
        assert_eq!(sched.enable_fpu(TaskId(77)), Err(KernError::NotFound));
    }

    #[test]
    fn test_mutex_handoff_through_scheduler() {
        use crate::sync::Mutex;

        let sched = sched();
        let t1 = spawn(&sched, "t1", Priority::High);
        let t2 = spawn(&sched, "t2", Priority::Normal);
        let mutex = Mutex::new();

        sched.schedule_next();
        assert_eq!(sched.current_id(), t1);
        mutex.lock(&sched);
        assert_eq!(mutex.owner(), Some(t1));

        // t1 leaves the core holding the mutex; t2 runs and blocks on it
        sched.suspend(t1).unwrap();
        assert_eq!(sched.current_id(), t2);
        mutex.lock(&sched);
        assert_eq!(sched.state(t2), Some(TaskState::Blocked));
        assert_eq!(sched.current_id(), TaskId::IDLE);

        // t1 comes back and releases: ownership hands to t2, now READY
        sched.resume(t1).unwrap();
        sched.schedule_next();
        assert_eq!(sched.current_id(), t1);
        mutex.unlock(&sched);
        assert_eq!(mutex.owner(), Some(t2));
        assert_eq!(sched.state(t2), Some(TaskState::Ready));

        // Once t1 leaves the core, t2 resumes already owning the mutex
        sched.suspend(t1).unwrap();
        assert_eq!(sched.current_id(), t2);
    }

    #[test]
    fn test_semaphore_handshake_through_scheduler() {
        use crate::sync::Semaphore;

        let sched = sched();
        let consumer = spawn(&sched, "consumer", Priority::Normal);
        let sem = Semaphore::new(0);

        sched.schedule_next();
        assert_eq!(sched.current_id(), consumer);
        sem.wait(&sched);
        assert_eq!(sched.state(consumer), Some(TaskState::Blocked));
        assert_eq!(sched.current_id(), TaskId::IDLE);

        // Post from the idle context hands the unit straight to the waiter
        sem.post(&sched);
        assert_eq!(sched.state(consumer), Some(TaskState::Ready));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_pending_wake_consumed_instead_of_blocking() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();
        assert_eq!(sched.current_id(), a);

        // Wake lands before the task blocks: block_current must not park it
        sched.wake(a);
        sched.block_current();
        assert_eq!(sched.state(a), Some(TaskState::Running));
        assert_eq!(sched.current_id(), a);
    }

    #[test]
    fn test_switch_counters() {
        let sched = sched();
        let a = spawn(&sched, "a", Priority::Normal);
        sched.schedule_next();
        sched.sleep(1);

        // idle -> a, a -> idle
        assert_eq!(sched.stats().context_switches, 2);
        tick(&sched);
        assert_eq!(sched.current_id(), a);
        assert_eq!(sched.stats().context_switches, 3);
    }
}
