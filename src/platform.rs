//! Platform collaborator: context switch and fatal halt
//!
//! The scheduler is written against the [`Platform`] trait so that the two
//! operations it cannot express in safe Rust — transferring control between
//! register snapshots and halting on an unrecoverable invariant violation —
//! stay behind a seam. The kernel build uses [`HardwarePlatform`]; tests use
//! a fake that shuffles snapshot blobs without any real register transfer.

use crate::task::CpuContext;

/// Hardware services the scheduler consumes
pub trait Platform {
    /// Save the caller's live state into `from` and resume execution as the
    /// state saved in `to`.
    ///
    /// Synchronous from the caller's perspective: the call "returns" when
    /// some later switch restores `from`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference valid, distinct snapshots that stay
    /// alive until the respective task is switched away from or destroyed;
    /// only the scheduler may call this, with interrupts effectively
    /// non-reentrant.
    unsafe fn context_switch(&self, from: *mut CpuContext, to: *const CpuContext);

    /// Unrecoverable invariant violation: report and never return.
    fn fatal(&self, msg: &str) -> !;
}

// ============================================================================
// Hardware Implementation
// ============================================================================

/// The real machine
pub struct HardwarePlatform;

impl Platform for HardwarePlatform {
    #[cfg(target_arch = "x86_64")]
    unsafe fn context_switch(&self, from: *mut CpuContext, to: *const CpuContext) {
        // Callee-saved registers plus stack, flags, and resume address are
        // enough to reenter Rust code mid-call; everything else is dead
        // across the call boundary per the System V ABI. Offsets follow the
        // field order of CpuContext.
        unsafe {
            core::arch::asm!(
                // Save outgoing state
                "mov [rdi + 8], rbx",
                "mov [rdi + 48], rbp",
                "mov [rdi + 96], r12",
                "mov [rdi + 104], r13",
                "mov [rdi + 112], r14",
                "mov [rdi + 120], r15",
                "mov [rdi + 56], rsp",
                "lea rax, [rip + 2f]",
                "mov [rdi + 128], rax",
                "pushfq",
                "pop rax",
                "mov [rdi + 136], rax",
                // Restore incoming state
                "mov rbx, [rsi + 8]",
                "mov rbp, [rsi + 48]",
                "mov r12, [rsi + 96]",
                "mov r13, [rsi + 104]",
                "mov r14, [rsi + 112]",
                "mov r15, [rsi + 120]",
                "mov rsp, [rsi + 56]",
                "mov rax, [rsi + 136]",
                "push rax",
                "popfq",
                "mov rax, [rsi + 128]",
                "jmp rax",
                "2:",
                in("rdi") from,
                in("rsi") to,
                out("rax") _,
                clobber_abi("C"),
            );
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe fn context_switch(&self, _from: *mut CpuContext, _to: *const CpuContext) {
        // Non-x86_64 targets carry the snapshot layout but no switch yet.
    }

    fn fatal(&self, msg: &str) -> ! {
        crate::println!("\nFATAL: {}", msg);
        halt_forever()
    }
}

/// Park the core permanently
pub fn halt_forever() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: hlt with interrupts in whatever state they are; the loop
        // re-halts after any wakeup.
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

// ============================================================================
// Test Fake
// ============================================================================

/// Fake platform for hosted tests
///
/// Models the switch contract over opaque blobs: the "live CPU state" is a
/// snapshot held here; a switch writes it into `from` and loads `to`.
/// Scheduling decisions become observable as state transitions and the
/// switch count, with no actual control transfer.
#[cfg(test)]
pub struct TestPlatform {
    live: spin::Mutex<CpuContext>,
    switches: core::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl TestPlatform {
    pub fn new() -> Self {
        Self {
            live: spin::Mutex::new(CpuContext::zeroed()),
            switches: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of context switches performed
    pub fn switch_count(&self) -> usize {
        self.switches.load(core::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Platform for TestPlatform {
    unsafe fn context_switch(&self, from: *mut CpuContext, to: *const CpuContext) {
        let mut live = self.live.lock();
        // SAFETY: caller guarantees both snapshots are valid.
        unsafe {
            from.write(*live);
            *live = to.read();
        }
        self.switches
            .fetch_add(1, core::sync::atomic::Ordering::SeqCst);
    }

    fn fatal(&self, msg: &str) -> ! {
        panic!("fatal: {}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_switch_moves_blobs() {
        let platform = TestPlatform::new();

        let mut a = CpuContext::zeroed();
        let mut b = CpuContext::zeroed();
        b.rip = 0xdead_beef;

        // Switch "into" b: the live blob (zeroed) lands in a, b becomes live
        unsafe { platform.context_switch(&mut a, &b) };
        assert_eq!(platform.switch_count(), 1);

        // Switch back: b's blob must come out unchanged
        let mut c = CpuContext::zeroed();
        unsafe { platform.context_switch(&mut c, &a) };
        assert_eq!(c.rip, 0xdead_beef);
    }
}
