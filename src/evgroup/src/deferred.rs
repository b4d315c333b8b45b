//! Deferred function calls from interrupt handlers
use core::fmt;

use crate::{error::PendCallError, PortThreading};

/// The function type of a [`PendedCall`].
///
/// # Safety
///
/// Each function of this type documents the validity requirements of its
/// arguments.
pub type PendedFunction = unsafe fn(arg1: *mut (), arg2: u32);

/// A function call queued by an interrupt handler to be executed later by a
/// task.
#[derive(Clone, Copy)]
pub struct PendedCall {
    func: PendedFunction,
    arg1: *mut (),
    arg2: u32,
}

// Safety: `PendedCall` is only ever executed once, by the consumer task. The
//         functions queued by this crate don't care about the thread they run
//         on.
unsafe impl Send for PendedCall {}

impl PendedCall {
    /// Construct a `PendedCall`.
    ///
    /// # Safety
    ///
    /// `func(arg1, arg2)` must be safe to call from a task context until the
    /// call is executed.
    pub const unsafe fn new(func: PendedFunction, arg1: *mut (), arg2: u32) -> Self {
        Self { func, arg1, arg2 }
    }

    /// Execute the call.
    ///
    /// Precondition: Task context, the scheduler is not suspended by the
    /// current context
    pub fn call(self) {
        // Safety: Guaranteed by the creator of `self`
        unsafe { (self.func)(self.arg1, self.arg2) }
    }
}

impl fmt::Debug for PendedCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendedCall")
            .field("func", &(self.func as *const ()))
            .field("arg1", &self.arg1)
            .field("arg2", &format_args!("{:#x}", self.arg2))
            .finish()
    }
}

/// Implemented by a port. Provides a bounded queue of [`PendedCall`]s that
/// interrupt handlers can push and a task (the *consumer*) drains.
///
/// # Safety
///
/// Queued calls must be executed in task context, each exactly once, in FIFO
/// order.
pub unsafe trait PortDeferredCall: PortThreading {
    /// Push `call` to the queue. Must not block.
    ///
    /// If accepting the call made a task of a higher priority than the
    /// interrupted one ready to run, the port sets
    /// `*higher_priority_task_woken` to `true` and otherwise leaves it
    /// untouched.
    fn pend_function_call_from_isr(
        call: PendedCall,
        higher_priority_task_woken: Option<&mut bool>,
    ) -> Result<(), PendCallError>;
}
