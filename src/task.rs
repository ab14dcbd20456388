//! Task control blocks and the task table
//!
//! A task is the unit of scheduling: one entry point, one exclusively owned
//! kernel stack, one saved register snapshot. TCBs are heap-allocated and
//! boxed so their snapshot addresses stay stable for the context-switch
//! primitive, and live in an ordered table keyed by their never-reused id.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::types::{KernError, KernResult, Priority, TaskFlags, TaskId, TaskState};

// ============================================================================
// Constants
// ============================================================================

/// Kernel stack size per task
pub const TASK_STACK_SIZE: usize = 8192;

/// Maximum task name length
pub const TASK_NAME_MAX: usize = 32;

/// Physical address of the kernel's page directory
///
/// The whole core runs on one fixed identity mapping; this value is only
/// carried in register snapshots and inherited across `create`.
pub const KERNEL_PAGE_DIR: u64 = 0x1000;

/// Task entry point
pub type TaskEntry = extern "C" fn() -> !;

/// Fixed-capacity task name
pub type TaskName = heapless::String<TASK_NAME_MAX>;

// Segment selectors loaded into new register snapshots. The GDT layout is
// fixed at boot: kernel code/data at 0x08/0x10, user at 0x1B/0x23 (RPL 3).
const KERNEL_CS: u64 = 0x08;
const KERNEL_DS: u64 = 0x10;
const USER_CS: u64 = 0x1B;
const USER_DS: u64 = 0x23;

/// Interrupt-enable flag in RFLAGS
const RFLAGS_IF: u64 = 0x200;

// ============================================================================
// Register Snapshot
// ============================================================================

/// Saved CPU register state for one task
///
/// Field order is load-bearing: the context-switch assembly addresses this
/// structure by fixed offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub ss: u64,
    /// Page directory base (CR3 image)
    pub cr3: u64,
    reserved: [u64; 3],
}

impl CpuContext {
    /// All-zero snapshot
    pub const fn zeroed() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            cr3: 0,
            reserved: [0; 3],
        }
    }

    /// Snapshot for a task that has never run: stack pointer near the stack
    /// top, instruction pointer at the entry, interrupts enabled, segments
    /// by privilege, page directory inherited.
    pub fn initial(entry: TaskEntry, stack_top: u64, flags: TaskFlags, page_dir: u64) -> Self {
        let mut ctx = Self::zeroed();
        ctx.rsp = stack_top;
        ctx.rbp = stack_top;
        ctx.rip = entry as usize as u64;
        ctx.rflags = RFLAGS_IF;
        ctx.cr3 = page_dir;

        if flags.is_user() {
            ctx.cs = USER_CS;
            ctx.ds = USER_DS;
            ctx.es = USER_DS;
            ctx.fs = USER_DS;
            ctx.gs = USER_DS;
            ctx.ss = USER_DS;
        } else {
            ctx.cs = KERNEL_CS;
            ctx.ds = KERNEL_DS;
            ctx.es = KERNEL_DS;
            ctx.fs = KERNEL_DS;
            ctx.gs = KERNEL_DS;
            ctx.ss = KERNEL_DS;
        }

        ctx
    }
}

/// FPU/SSE save area (fxsave image)
#[repr(C)]
#[derive(Debug)]
pub struct FpuState {
    pub region: [u8; 512],
}

impl FpuState {
    pub const fn zeroed() -> Self {
        Self { region: [0; 512] }
    }
}

// ============================================================================
// Task Stack
// ============================================================================

/// An exclusively owned kernel stack
///
/// Allocated from the kernel heap at creation and released when the TCB is
/// dropped; the allocator never hands the same region to two live owners.
#[derive(Debug)]
pub struct TaskStack {
    base: NonNull<u8>,
    size: usize,
}

impl TaskStack {
    /// Allocate a stack of `size` bytes; `None` on heap exhaustion
    pub fn allocate(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, 8).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr).map(|base| Self { base, size })
    }

    /// Lowest address of the stack region
    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// Stack size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Initial stack pointer: just below the top, 16-byte aligned
    pub fn top(&self) -> u64 {
        (self.base() + self.size as u64 - 16) & !15
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with the identical layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.size, 8);
            alloc::alloc::dealloc(self.base.as_ptr(), layout);
        }
    }
}

// SAFETY: the stack region is exclusively owned and only ever touched by the
// task it belongs to.
unsafe impl Send for TaskStack {}

// ============================================================================
// Task Control Block
// ============================================================================

/// Full state record for one schedulable task
#[derive(Debug)]
pub struct Tcb {
    pub id: TaskId,
    pub name: TaskName,
    pub state: TaskState,
    pub priority: Priority,
    pub flags: TaskFlags,

    /// Saved register state; valid whenever the task is not RUNNING
    pub context: CpuContext,
    /// Lazily allocated FPU save area
    pub fpu_state: Option<Box<FpuState>>,
    pub stack: TaskStack,

    /// Page directory this task runs under
    pub page_directory: u64,
    /// Creating task; weak back-reference by id
    pub parent: Option<TaskId>,

    /// Absolute tick at which a sleeping task becomes READY again;
    /// `None` while blocked on a synchronization primitive
    pub sleep_deadline: Option<u64>,
    /// Wake arrived before the task reached its blocking point
    pub wake_pending: bool,

    pub creation_time: u64,
    pub last_run: u64,
    pub cpu_time: u64,
    pub time_slice: u32,
    pub time_slice_remaining: u32,
    pub context_switches: u64,
    pub exit_code: i32,
}

impl Tcb {
    /// Release the FPU save area, if one was allocated
    pub fn drop_fpu_state(&mut self) {
        self.fpu_state = None;
        self.flags = self.flags & !TaskFlags::FPU;
    }
}

/// Copy `name` into a fixed-capacity task name, truncating like the
/// original strncpy-based kernels did.
pub fn make_task_name(name: &str) -> TaskName {
    let mut out = TaskName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Fallible boxing; the global `Box::new` aborts on exhaustion, which would
/// turn heap pressure into a halt instead of a create() error.
fn try_box<T>(value: T) -> Option<Box<T>> {
    let layout = Layout::new::<T>();
    // SAFETY: T is sized and non-zero here (Tcb / FpuState).
    let ptr = unsafe { alloc::alloc::alloc(layout) as *mut T };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: ptr is valid for writes of T and freshly allocated.
    unsafe {
        ptr.write(value);
        Some(Box::from_raw(ptr))
    }
}

/// Allocate an FPU save area
pub fn alloc_fpu_state() -> Option<Box<FpuState>> {
    try_box(FpuState::zeroed())
}

// ============================================================================
// Task Table
// ============================================================================

/// The global task list: every live TCB, keyed by id
#[derive(Debug)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Box<Tcb>>,
    next_id: u32,
}

impl TaskTable {
    /// Empty table; the first `create` is handed id 1
    pub const fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Build and insert a new TCB.
    ///
    /// Fails with `InvalidArgument` on an empty name and `NoMemory` when the
    /// stack or TCB allocation fails. The register snapshot is initialized
    /// for a first run at `entry`; the page directory comes from the parent
    /// (or the kernel's when there is none).
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        name: &str,
        entry: TaskEntry,
        priority: Priority,
        flags: TaskFlags,
        parent: Option<TaskId>,
        page_directory: u64,
        now: u64,
        quantum: u32,
    ) -> KernResult<TaskId> {
        if name.is_empty() {
            return Err(KernError::InvalidArgument);
        }

        let stack = TaskStack::allocate(TASK_STACK_SIZE).ok_or(KernError::NoMemory)?;
        let context = CpuContext::initial(entry, stack.top(), flags, page_directory);

        let id = TaskId(self.next_id);
        let tcb = Tcb {
            id,
            name: make_task_name(name),
            state: TaskState::Ready,
            priority,
            flags,
            context,
            fpu_state: None,
            stack,
            page_directory,
            parent,
            sleep_deadline: None,
            wake_pending: false,
            creation_time: now,
            last_run: 0,
            cpu_time: 0,
            time_slice: quantum,
            time_slice_remaining: quantum,
            context_switches: 0,
            exit_code: 0,
        };

        let boxed = try_box(tcb).ok_or(KernError::NoMemory)?;
        self.next_id += 1;
        self.tasks.insert(id, boxed);
        Ok(id)
    }

    /// Insert the idle task (id 0). Called once at scheduler init.
    pub fn install_idle(&mut self, tcb: Tcb) -> KernResult<()> {
        debug_assert!(tcb.id.is_idle());
        let boxed = try_box(tcb).ok_or(KernError::NoMemory)?;
        self.tasks.insert(TaskId::IDLE, boxed);
        Ok(())
    }

    /// Remove a TCB; dropping the returned box releases the stack and any
    /// FPU save area.
    pub fn remove(&mut self, id: TaskId) -> Option<Box<Tcb>> {
        self.tasks.remove(&id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Tcb> {
        self.tasks.get(&id).map(|b| &**b)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.tasks.get_mut(&id).map(|b| &mut **b)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Number of live tasks, idle included
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.tasks.values().map(|b| &**b)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tcb> {
        self.tasks.values_mut().map(|b| &mut **b)
    }

    /// Raw pointer to a task's register snapshot.
    ///
    /// TCBs are boxed, so the pointer stays valid across table mutations
    /// until that TCB is removed.
    pub fn context_ptr(&mut self, id: TaskId) -> Option<*mut CpuContext> {
        self.tasks
            .get_mut(&id)
            .map(|b| &mut b.context as *mut CpuContext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn test_entry() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn create_one(table: &mut TaskTable, name: &str) -> TaskId {
        table
            .create(
                name,
                test_entry,
                Priority::Normal,
                TaskFlags::KERNEL,
                None,
                KERNEL_PAGE_DIR,
                0,
                50,
            )
            .unwrap()
    }

    #[test]
    fn test_ids_monotonic_from_one() {
        let mut table = TaskTable::new();
        let a = create_one(&mut table, "a");
        let b = create_one(&mut table, "b");
        assert_eq!(a, TaskId(1));
        assert_eq!(b, TaskId(2));

        // Removal never recycles an id
        table.remove(a);
        let c = create_one(&mut table, "c");
        assert_eq!(c, TaskId(3));
        assert!(!table.contains(a));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut table = TaskTable::new();
        let err = table.create(
            "",
            test_entry,
            Priority::Normal,
            TaskFlags::KERNEL,
            None,
            KERNEL_PAGE_DIR,
            0,
            50,
        );
        assert_eq!(err, Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_long_name_truncated() {
        let long = "x".repeat(TASK_NAME_MAX + 10);
        let name = make_task_name(&long);
        assert_eq!(name.len(), TASK_NAME_MAX);
    }

    #[test]
    fn test_kernel_context_init() {
        let mut table = TaskTable::new();
        let id = create_one(&mut table, "worker");
        let tcb = table.get(id).unwrap();

        assert_eq!(tcb.context.rip, test_entry as usize as u64);
        assert_eq!(tcb.context.cs, KERNEL_CS);
        assert_eq!(tcb.context.ss, KERNEL_DS);
        assert_eq!(tcb.context.rflags, RFLAGS_IF);
        assert_eq!(tcb.context.cr3, KERNEL_PAGE_DIR);

        // Stack pointer points near the top of the owned stack, 16-aligned
        assert_eq!(tcb.context.rsp % 16, 0);
        assert!(tcb.context.rsp > tcb.stack.base());
        assert!(tcb.context.rsp < tcb.stack.base() + tcb.stack.size() as u64);
    }

    #[test]
    fn test_user_context_selectors() {
        let mut table = TaskTable::new();
        let id = table
            .create(
                "shell",
                test_entry,
                Priority::Normal,
                TaskFlags::USER,
                None,
                KERNEL_PAGE_DIR,
                0,
                50,
            )
            .unwrap();
        let tcb = table.get(id).unwrap();
        assert_eq!(tcb.context.cs, USER_CS);
        assert_eq!(tcb.context.ds, USER_DS);
    }

    #[test]
    fn test_stacks_disjoint() {
        let mut table = TaskTable::new();
        let a = create_one(&mut table, "a");
        let b = create_one(&mut table, "b");

        let (sa, sb) = (&table.get(a).unwrap().stack, &table.get(b).unwrap().stack);
        let a_range = sa.base()..sa.base() + sa.size() as u64;
        let b_range = sb.base()..sb.base() + sb.size() as u64;
        assert!(a_range.end <= b_range.start || b_range.end <= a_range.start);
    }

    #[test]
    fn test_context_ptr_stable_across_inserts() {
        let mut table = TaskTable::new();
        let a = create_one(&mut table, "a");
        let ptr_before = table.context_ptr(a).unwrap();

        for i in 0..32 {
            create_one(&mut table, if i % 2 == 0 { "even" } else { "odd" });
        }

        assert_eq!(table.context_ptr(a).unwrap(), ptr_before);
    }

    #[test]
    fn test_fpu_state_release() {
        let mut table = TaskTable::new();
        let id = create_one(&mut table, "fp");
        let tcb = table.get_mut(id).unwrap();

        tcb.fpu_state = alloc_fpu_state();
        tcb.flags |= TaskFlags::FPU;
        assert!(tcb.fpu_state.is_some());

        tcb.drop_fpu_state();
        assert!(tcb.fpu_state.is_none());
        assert!(!tcb.flags.contains(TaskFlags::FPU));
    }
}
