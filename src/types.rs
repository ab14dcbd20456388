//! Common types shared across the kernel core
//!
//! Task identity, priority levels, lifecycle states, creation flags, and the
//! kernel error type live here to avoid circular dependencies between the
//! scheduler, task table, and synchronization modules.

// ============================================================================
// Task Identity
// ============================================================================

/// Task identifier
///
/// Ids are unique and monotonically increasing for the lifetime of the
/// system, starting at 1. Id 0 is reserved for the idle task and is never
/// reissued, so a stale id can never alias a later task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskId(pub u32);

impl TaskId {
    /// The idle task's reserved id
    pub const IDLE: TaskId = TaskId(0);

    /// Is this the idle task?
    pub fn is_idle(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Priority Levels
// ============================================================================

/// Number of scheduler priority levels
pub const PRIORITY_LEVELS: usize = 5;

/// Task priority level
///
/// Strict-priority scheduling: a READY task at a higher level always runs
/// before any task at a lower level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    /// Only the idle task runs here
    Idle = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// All levels, lowest first
    pub const ALL: [Priority; PRIORITY_LEVELS] = [
        Priority::Idle,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Ready-queue index for this level
    pub fn index(self) -> usize {
        self as usize
    }

    /// Level for a queue index, if in range
    pub fn from_index(index: usize) -> Option<Priority> {
        Priority::ALL.get(index).copied()
    }
}

// ============================================================================
// Task State
// ============================================================================

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible to run, linked into a ready queue
    Ready,
    /// Currently executing on the core
    Running,
    /// Waiting on a sleep deadline or a synchronization primitive
    Blocked,
    /// Explicitly suspended; only `resume` makes it READY again
    Suspended,
    /// Exited; absorbing until `destroy` reclaims the TCB
    Terminated,
}

impl TaskState {
    /// Short label for diagnostics
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Blocked => "BLOCKED",
            TaskState::Suspended => "SUSPENDED",
            TaskState::Terminated => "TERMINATED",
        }
    }
}

// ============================================================================
// Task Flags
// ============================================================================

/// Task creation/behavior flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskFlags(pub u32);

impl TaskFlags {
    /// Runs in kernel mode
    pub const KERNEL: Self = Self(1 << 0);
    /// Runs in user mode
    pub const USER: Self = Self(1 << 1);
    /// System task, not shown in user-facing listings
    pub const SYSTEM: Self = Self(1 << 2);
    /// Background daemon
    pub const DAEMON: Self = Self(1 << 3);
    /// Uses the FPU; save area allocated lazily
    pub const FPU: Self = Self(1 << 4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn is_user(self) -> bool {
        self.contains(Self::USER)
    }
}

impl core::ops::BitOr for TaskFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for TaskFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for TaskFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::Not for TaskFlags {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

// ============================================================================
// Kernel Errors
// ============================================================================

/// Kernel error codes
///
/// All failures in the core are synchronous and local to the call that
/// produced them; nothing here is retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    /// A parameter was rejected (empty name, out-of-range quantum)
    InvalidArgument,
    /// Frame, heap, TCB, or stack allocation failed
    NoMemory,
    /// No task with the given id
    NotFound,
    /// The operation is not valid in the task's current state
    InvalidState,
}

/// Result alias for kernel operations
pub type KernResult<T> = Result<T, KernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_roundtrip() {
        for pri in Priority::ALL {
            assert_eq!(Priority::from_index(pri.index()), Some(pri));
        }
        assert_eq!(Priority::from_index(PRIORITY_LEVELS), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Idle < Priority::Low);
    }

    #[test]
    fn test_task_flags() {
        let flags = TaskFlags::KERNEL | TaskFlags::SYSTEM;
        assert!(flags.contains(TaskFlags::KERNEL));
        assert!(flags.contains(TaskFlags::SYSTEM));
        assert!(!flags.contains(TaskFlags::USER));
        assert!(!flags.is_user());
    }

    #[test]
    fn test_idle_id() {
        assert!(TaskId::IDLE.is_idle());
        assert!(!TaskId(1).is_idle());
    }
}
