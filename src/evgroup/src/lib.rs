#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#[cfg(feature = "alloc")]
extern crate alloc;

use core::{alloc::Layout, fmt, ptr::NonNull};

mod deferred;
mod error;
mod event_group;
mod klock;
mod utils;
pub mod wait;

pub use self::{deferred::*, error::*, event_group::*, wait::TaskWait};

/// Unsigned integer type representing a tick count used by the port's timer
/// driver.
pub type UTicks = u32;

/// Blocking operations given this timeout never time out.
pub const WAIT_FOREVER: UTicks = UTicks::MAX;

/// The state of the scheduler as reported by [`PortThreading::scheduler_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    /// The scheduler hasn't started yet. Nothing can block.
    NotStarted,
    /// The scheduler is running, and the current context may block.
    Running,
    /// The current context has suspended the scheduler.
    Suspended,
}

/// Implemented by a port. Provides the scheduler primitives that event groups
/// are built upon.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because the engine relies on the
/// exclusion guarantees described below for memory safety.
///
/// These methods are only meant to be called by the engine.
pub unsafe trait PortThreading: Sized + 'static {
    /// Identifies a task.
    type TaskRef: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    /// The previous interrupt mask returned by
    /// [`enter_critical_from_isr`](Self::enter_critical_from_isr).
    type InterruptMask: Copy;

    /// Suspend the scheduler. No other task may run until the matching call to
    /// [`resume_all`](Self::resume_all). Calls nest. Interrupt handlers keep
    /// running.
    ///
    /// While the current context holds the scheduler suspended, no other
    /// context may hold the scheduler suspended or be inside a task-level
    /// critical section.
    unsafe fn suspend_all();

    /// Undo one [`suspend_all`](Self::suspend_all). Returns `true` if the
    /// outermost resumption has already switched to another task and back.
    ///
    /// Precondition: The scheduler is suspended by the current context
    unsafe fn resume_all() -> bool;

    /// Offer the scheduler an opportunity to switch tasks. If the current task
    /// is blocked, this returns only after the task is unblocked.
    ///
    /// Precondition: The scheduler is not suspended by the current context
    unsafe fn yield_within_api();

    /// Enter a task-level critical section. This excludes other tasks and
    /// interrupt-level critical sections. Calls nest.
    unsafe fn enter_critical();

    /// Leave a task-level critical section.
    ///
    /// Precondition: Inside a task-level critical section entered by the
    /// current context
    unsafe fn exit_critical();

    /// Enter an interrupt-level critical section from an interrupt handler.
    /// This excludes task-level critical sections and other interrupt-level
    /// critical sections.
    unsafe fn enter_critical_from_isr() -> Self::InterruptMask;

    /// Leave an interrupt-level critical section.
    ///
    /// Precondition: `mask` was returned by the matching
    /// `enter_critical_from_isr`
    unsafe fn exit_critical_from_isr(mask: Self::InterruptMask);

    /// Get the state of the scheduler as seen from the current context.
    fn scheduler_state() -> SchedulerState;

    /// Get the currently running task.
    ///
    /// Precondition: Task context
    fn current_task() -> Self::TaskRef;

    /// Get the wait slot of the specified task.
    fn task_wait(task: Self::TaskRef) -> &'static TaskWait<Self>;

    /// Transition the current task into the Blocked state. The task stops
    /// running at the next opportunity the scheduler gets, i.e., when the
    /// scheduler is resumed.
    ///
    /// When `timeout` ticks elapse (never if it's [`WAIT_FOREVER`]) before the
    /// task is unblocked by [`unblock_task`](Self::unblock_task), the port must
    /// acquire the scheduler lock, call [`wait::expire_wait`] for the task,
    /// and make the task ready again.
    ///
    /// Precondition: The scheduler is suspended by the current context, task
    /// context
    unsafe fn block_current_task(timeout: UTicks);

    /// Make a task blocked by [`block_current_task`](Self::block_current_task)
    /// ready again and cancel its timeout.
    ///
    /// Precondition: The scheduler is suspended by the current context
    unsafe fn unblock_task(task: Self::TaskRef);
}

/// Implemented by a port. Provides the memory backing allocator-backed event
/// groups.
///
/// # Safety
///
/// `allocate` must return a region that satisfies the given layout and is not
/// aliased by any other allocation.
pub unsafe trait PortAlloc: PortThreading {
    /// Allocate a memory region. Returns `None` on exhaustion.
    ///
    /// The default implementation uses the global allocator if the `alloc`
    /// feature is enabled and otherwise always fails.
    fn allocate(layout: Layout) -> Option<NonNull<u8>> {
        #[cfg(feature = "alloc")]
        {
            debug_assert_ne!(layout.size(), 0);
            // Safety: `layout` is not zero-sized
            NonNull::new(unsafe { alloc::alloc::alloc(layout) })
        }
        #[cfg(not(feature = "alloc"))]
        {
            let _ = layout;
            None
        }
    }

    /// Release a memory region returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` with the same `layout` and
    /// must not have been released yet.
    unsafe fn deallocate(ptr: NonNull<u8>, layout: Layout) {
        #[cfg(feature = "alloc")]
        // Safety: Upheld by the caller
        unsafe {
            alloc::alloc::dealloc(ptr.as_ptr(), layout)
        };
        #[cfg(not(feature = "alloc"))]
        {
            let _ = (ptr, layout);
            unreachable!("nothing was allocated");
        }
    }
}

/// The set of port traits required by [`EventGroup`]. Automatically
/// implemented.
pub trait KernelTraits: PortThreading + PortDeferredCall + PortAlloc {}

impl<T: PortThreading + PortDeferredCall + PortAlloc> KernelTraits for T {}
