//! Memory management
//!
//! Two allocators with disjoint responsibilities: the bitmap [`frame`]
//! allocator hands out whole physical frames, and the free-list [`heap`]
//! allocator serves every kernel object allocation (TCBs, stacks,
//! collections) out of a fixed arena. Regions are exclusively owned by
//! their allocator until freed; no allocation is ever shared between two
//! live owners.

pub mod frame;
pub mod heap;

pub use frame::{FrameAllocator, FrameStats, FRAME_SIZE, KERNEL_RESERVED_BYTES};
pub use heap::{kernel_heap_stats, Heap, HeapStats, KernelHeap, HEAP_ALIGN};

use spin::{Mutex, Once};

/// Global physical frame allocator
static FRAMES: Once<Mutex<FrameAllocator>> = Once::new();

/// Initialize both allocators from the boot-provided region parameters.
///
/// # Safety
///
/// `heap_start..heap_start+heap_size` must be exclusively owned writable
/// memory; see [`heap::init`]. Call once at boot.
pub unsafe fn init(total_memory: u64, heap_start: usize, heap_size: usize) {
    unsafe { heap::init(heap_start, heap_size) };
    FRAMES.call_once(|| Mutex::new(FrameAllocator::new(total_memory)));
}

/// The global frame allocator; panics before `init`
pub fn frame_allocator() -> &'static Mutex<FrameAllocator> {
    FRAMES.get().expect("memory management not initialized")
}
