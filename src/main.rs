//! EmberOS kernel binary entry point
//!
//! The kernel proper only exists on bare-metal targets
//! (`--target x86_64-unknown-none`); on hosted targets this binary is a
//! stub so the workspace builds and tests everywhere.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use core::panic::PanicInfo;
    use ember_os::types::{Priority, TaskFlags};
    use ember_os::{console, mm, scheduler};

    // Boot-provided memory layout, fixed for the process lifetime
    const TOTAL_MEMORY: u64 = 128 * 1024 * 1024;
    const KERNEL_HEAP_START: usize = 0x20_0000;
    const KERNEL_HEAP_SIZE: usize = 0x10_0000;

    /// Kernel entry point
    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        kernel_main()
    }

    /// Main kernel initialization
    fn kernel_main() -> ! {
        console::init();
        ember_os::println!("\n\n=== {} v{} ===", ember_os::NAME, ember_os::VERSION);
        ember_os::println!("");

        ember_os::print!("[INIT] Memory management... ");
        // SAFETY: the heap region is reserved for the kernel by the boot
        // layout and nothing else touches it.
        unsafe {
            mm::init(TOTAL_MEMORY, KERNEL_HEAP_START, KERNEL_HEAP_SIZE);
        }
        ember_os::println!("OK");

        let frames = mm::frame_allocator().lock().stats();
        let heap = mm::kernel_heap_stats();
        ember_os::println!(
            "Memory: {}MB total, {}MB available, {}KB heap",
            frames.total_bytes / (1024 * 1024),
            frames.available_bytes / (1024 * 1024),
            heap.total_bytes / 1024
        );

        ember_os::print!("[INIT] Scheduler... ");
        if scheduler::init(scheduler::idle_task_entry).is_err() {
            panic!("scheduler init failed");
        }
        ember_os::println!("OK");

        let sched = scheduler::global_scheduler();
        if sched.kernel_task_create("ping", ping_task).is_err() {
            ember_os::println!("WARNING: failed to create ping task");
        }
        if sched
            .create("pong", pong_task, Priority::Low, TaskFlags::KERNEL)
            .is_err()
        {
            ember_os::println!("WARNING: failed to create pong task");
        }

        sched.dump_tasks();
        ember_os::println!("{} initialized, starting scheduler", ember_os::NAME);

        // Hand the core to the highest-priority task; the boot context
        // continues below as the idle task.
        sched.schedule_next();

        // Idle loop. The periodic tick normally arrives from the timer
        // interrupt; until the interrupt controller is wired up it is
        // driven from here.
        loop {
            scheduler::timer_interrupt();
            core::hint::spin_loop();
        }
    }

    /// Demo task: periodic heartbeat
    extern "C" fn ping_task() -> ! {
        let sched = scheduler::global_scheduler();
        loop {
            ember_os::println!("[ping] tick={}", sched.stats().total_cpu_time);
            sched.sleep(500);
        }
    }

    /// Demo task: slower heartbeat at low priority
    extern "C" fn pong_task() -> ! {
        let sched = scheduler::global_scheduler();
        loop {
            ember_os::println!("[pong]");
            sched.sleep(1500);
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        ember_os::panic::kernel_panic(info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("ember_os is a bare-metal kernel; build with `cargo xtask run`");
}
