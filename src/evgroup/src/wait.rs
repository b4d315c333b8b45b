//! Wait queues
//!
//! A task blocked on an event group is represented by a [`Wait`] object that
//! lives on the blocked task's stack and is linked into the event group's
//! [`WaitQueue`]. The object is unlinked exactly once, by whichever party ends
//! the wait:
//!
//!  - a satisfying set operation, which records an outcome
//!    ([`WaitQueue::wake_up_all_conditional`]),
//!  - the deletion of the event group, which records an outcome of zero
//!    ([`WaitQueue::wake_up_all`]), or
//!  - the port's timeout handling, which records nothing ([`expire_wait`]).
//!
//! The blocked task tells these apart by the presence of the outcome.
use core::{fmt, ops, ptr::NonNull};

use crate::{
    event_group::{EventGroupBits, EventGroupWaitFlags},
    klock::{self, SchedLockCell, SchedLockTokenRefMut, SuspendGuard},
    utils::intrusive_list::{self, ListAccessorCell},
    PortThreading, UTicks,
};

/// Escalate a structural inconsistency of a wait queue to a panic.
#[track_caller]
fn list_op<T, E: fmt::Debug>(result: Result<T, E>) -> T {
    result.unwrap_or_else(|e| panic!("wait queue is inconsistent: {e:?}"))
}

/// A reference to a [`Wait`].
pub(crate) struct WaitRef<Traits: PortThreading>(NonNull<Wait<Traits>>);

// Safety: The pointee is only accessed with the scheduler lock held
unsafe impl<Traits: PortThreading> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitRef<Traits> {}

impl<Traits: PortThreading> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for WaitRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for WaitRef<Traits> {}

/// A virtual container of every live [`Wait`] that can be indexed by
/// [`WaitRef`].
struct UnsafeStatic {
    _nonexhaustive: (),
}

impl UnsafeStatic {
    /// # Safety
    ///
    /// All `WaitRef`s used to index the returned object must point to live
    /// `Wait`s.
    #[inline]
    const unsafe fn new() -> &'static Self {
        &Self { _nonexhaustive: () }
    }
}

impl<Traits: PortThreading> ops::Index<WaitRef<Traits>> for UnsafeStatic {
    type Output = Wait<Traits>;

    #[inline]
    fn index(&self, index: WaitRef<Traits>) -> &Self::Output {
        // Safety: See `UnsafeStatic::new`
        unsafe { &*index.0.as_ptr() }
    }
}

/// Get a `ListAccessorCell` used to access a wait queue.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            // Safety: A `Wait` is linked into a wait queue only while the
            //         blocked task's stack frame holding it is alive
            unsafe { UnsafeStatic::new() },
            |wait: &Wait<_>| &wait.link,
            $key,
        )
    };
}

/// A blocked task's record in a [`WaitQueue`].
pub(crate) struct Wait<Traits: PortThreading> {
    /// The task that is waiting for something.
    task: Traits::TaskRef,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: SchedLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,

    /// The wait queue `self` belongs to. Only dereferenced while `self` is
    /// linked.
    wait_queue: NonNull<WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// The condition a [`Wait`] waits for and the outcome of the wait.
pub(crate) struct WaitPayload<Traits> {
    pub(crate) bits: EventGroupBits,
    pub(crate) flags: EventGroupWaitFlags,

    /// Written by the waker before unlinking the `Wait`. `None` after the
    /// `Wait` is unlinked means the wait timed out.
    outcome: SchedLockCell<Traits, Option<EventGroupBits>>,
}

/// A queue of tasks blocked on an event group.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    waits: SchedLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,
}

impl<Traits: PortThreading> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WaitQueue")
    }
}

/// The per-task wait state, embedded by a port in each task's control block
/// and handed out by [`PortThreading::task_wait`].
pub struct TaskWait<Traits: PortThreading> {
    /// The wait object describing the ongoing blocking operation of the task.
    current_wait: SchedLockCell<Traits, Option<WaitRef<Traits>>>,
}

// Safety: `current_wait` is only accessed by the owner of the scheduler lock
unsafe impl<Traits: PortThreading> Send for TaskWait<Traits> {}
unsafe impl<Traits: PortThreading> Sync for TaskWait<Traits> {}

impl<Traits: PortThreading> TaskWait<Traits> {
    pub const fn new() -> Self {
        Self {
            current_wait: SchedLockCell::new(None),
        }
    }
}

impl<Traits: PortThreading> Default for TaskWait<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TaskWait")
    }
}

impl<Traits: PortThreading> WaitQueue<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            waits: SchedLockCell::new(intrusive_list::ListHead::new()),
        }
    }

    /// Insert a wait object pertaining to the currently running task to
    /// `queue`, transitioning the task into the Blocked state, and release the
    /// scheduler lock.
    ///
    /// Returns the outcome recorded by the waker, or `None` if the wait timed
    /// out.
    ///
    /// Precondition: Task context, `timeout != 0`
    ///
    /// # Safety
    ///
    /// `queue` must point to a live `WaitQueue`. It may be destroyed while the
    /// task is blocked only after waking up the task with
    /// [`Self::wake_up_all`].
    pub(crate) unsafe fn wait_timeout(
        queue: NonNull<Self>,
        mut guard: SuspendGuard<Traits>,
        bits: EventGroupBits,
        flags: EventGroupWaitFlags,
        timeout: UTicks,
    ) -> Option<EventGroupBits> {
        debug_assert_ne!(timeout, 0);

        let task = Traits::current_task();
        let wait = Wait {
            task,
            link: SchedLockCell::new(None),
            wait_queue: queue,
            payload: WaitPayload {
                bits,
                flags,
                outcome: SchedLockCell::new(None),
            },
        };
        let wait_ref = WaitRef(NonNull::from(&wait));

        {
            let mut lock = guard.borrow_mut();
            // Safety: `queue` is live at this point
            let waits = unsafe { &queue.as_ref().waits };
            list_op(wait_queue_accessor!(waits, lock.borrow_mut()).push_back(wait_ref));

            let task_wait = Traits::task_wait(task);
            assert!(
                task_wait.current_wait.get(&*lock).is_none(),
                "{task:?} is already waiting"
            );
            task_wait.current_wait.replace(&mut *lock, Some(wait_ref));

            // Safety: The scheduler is suspended by us
            unsafe { Traits::block_current_task(timeout) };
        }

        log::trace!("{task:?} blocked on {queue:p}");

        // The task stops running here
        if !guard.resume() {
            // Safety: The scheduler is no longer suspended by us
            unsafe { Traits::yield_within_api() };
        }

        // Whoever unblocked us has unlinked `wait` by now
        let lock = klock::enter_critical::<Traits>();
        assert!(wait.link.get(&*lock).is_none());
        let outcome = wait.payload.outcome.get(&*lock);
        drop(lock);

        log::trace!("{task:?} woke up with outcome {outcome:?}");

        outcome
    }

    /// Wake up every wait object in `self` for which `cond` returns
    /// `Some(outcome)`, in insertion order. `cond` sees each wait object
    /// exactly once.
    pub(crate) fn wake_up_all_conditional(
        &self,
        mut lock: SchedLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>) -> Option<EventGroupBits>,
    ) -> usize {
        let mut num_woken = 0;
        let mut cur = list_op(wait_queue_accessor!(&self.waits, lock.borrow_mut()).front());

        while let Some(wait_ref) = cur {
            // Find the next wait object before we possibly unlink `wait_ref`
            cur = list_op(wait_queue_accessor!(&self.waits, lock.borrow_mut()).next(wait_ref));

            // Safety: `wait_ref` is linked, so it points to a live `Wait`
            let wait = unsafe { wait_ref.0.as_ref() };

            let Some(outcome) = cond(&wait.payload) else {
                continue;
            };

            list_op(wait_queue_accessor!(&self.waits, lock.borrow_mut()).remove(wait_ref));
            complete_wait(lock.borrow_mut(), wait, outcome);
            num_woken += 1;
        }

        num_woken
    }

    /// Wake up every wait object in `self` with the specified outcome.
    pub(crate) fn wake_up_all(
        &self,
        mut lock: SchedLockTokenRefMut<'_, Traits>,
        outcome: EventGroupBits,
    ) -> usize {
        let mut num_woken = 0;

        while let Some(wait_ref) =
            list_op(wait_queue_accessor!(&self.waits, lock.borrow_mut()).pop_front())
        {
            // Safety: `wait_ref` was linked, so it points to a live `Wait`
            let wait = unsafe { wait_ref.0.as_ref() };
            complete_wait(lock.borrow_mut(), wait, outcome);
            num_woken += 1;
        }

        num_woken
    }

    /// Count the wait objects in `self`.
    #[cfg(test)]
    pub(crate) fn len(&self, mut lock: SchedLockTokenRefMut<'_, Traits>) -> usize {
        wait_queue_accessor!(&self.waits, lock.borrow_mut())
            .iter()
            .map(list_op)
            .count()
    }
}

/// Deassociate the specified wait object from its waiting task, record
/// `outcome`, and wake up the task. The wait object must already be unlinked.
fn complete_wait<Traits: PortThreading>(
    mut lock: SchedLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    outcome: EventGroupBits,
) {
    let task_wait = Traits::task_wait(wait.task);

    // Clear `current_wait`
    assert_eq!(
        task_wait.current_wait.get(&*lock),
        Some(WaitRef(wait.into()))
    );
    task_wait.current_wait.replace(&mut *lock, None);

    wait.payload.outcome.replace(&mut *lock, Some(outcome));

    // Safety: The scheduler is suspended by us
    unsafe { Traits::unblock_task(wait.task) };
}

/// End the ongoing wait of `task`, if any, without recording an outcome. The
/// task will observe the wait as timed out.
///
/// Returns `true` if a wait was ended. `false` means the wait has already been
/// ended by someone else, e.g., a set operation that raced with the timeout.
///
/// Meant to be called by a port when the timeout specified by
/// [`PortThreading::block_current_task`] elapses. The port is responsible for
/// making the task ready again.
///
/// # Safety
///
/// The current context must be the owner of the scheduler lock, and it must
/// not be executing any method of this crate.
pub unsafe fn expire_wait<Traits: PortThreading>(task: Traits::TaskRef) -> bool {
    // Safety: Upheld by the caller
    let mut lock = unsafe { klock::assume_sched_lock::<Traits>() };
    let mut lock = lock.borrow_mut();

    let task_wait = Traits::task_wait(task);
    let Some(wait_ref) = task_wait.current_wait.get(&*lock) else {
        return false;
    };

    // Safety: `current_wait` only refers to a linked, live `Wait`
    let wait = unsafe { wait_ref.0.as_ref() };
    // Safety: `wait` is linked, so its wait queue is still alive
    let wait_queue = unsafe { wait.wait_queue.as_ref() };

    list_op(wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut()).remove(wait_ref));
    task_wait.current_wait.replace(&mut *lock, None);

    log::trace!("{task:?} timed out on {wait_queue:p}");

    true
}
