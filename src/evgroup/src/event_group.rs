//! Event groups
use core::{
    alloc::Layout,
    fmt, hash,
    mem::{self, MaybeUninit},
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use crate::{
    error::{CreateEventGroupError, PendCallError, WaitTimeout},
    klock,
    wait::WaitQueue,
    KernelTraits, PendedCall, SchedulerState, UTicks,
};

#[cfg(test)]
mod tests;

/// Unsigned integer type backing event groups.
pub type EventGroupBits = u32;

/// The bits of [`EventGroupBits`] that are reserved and must never be
/// included in a mask passed to an event group operation.
pub const EVENT_BITS_CONTROL_BYTES: EventGroupBits = 0xff00_0000;

bitflags::bitflags! {
    /// Options for [`EventGroup::wait`].
    pub struct EventGroupWaitFlags: u8 {
        /// Wait for all of the specified bits to be set. Without this flag,
        /// the wait completes as soon as any of them is set.
        const ALL = 1 << 0;

        /// Clear the specified bits on successful completion. The bits are
        /// cleared atomically with the completion.
        const CLEAR = 1 << 1;
    }
}

/// Check if `current` satisfies the condition "`wanted` are set", where the
/// interpretation of "are set" depends on [`EventGroupWaitFlags::ALL`].
#[inline]
pub fn wait_condition_met(
    current: EventGroupBits,
    wanted: EventGroupBits,
    flags: EventGroupWaitFlags,
) -> bool {
    if flags.contains(EventGroupWaitFlags::ALL) {
        (current & wanted) == wanted
    } else {
        (current & wanted) != 0
    }
}

/// Where the storage of an event group came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provenance {
    /// Caller-supplied [`StaticEventGroup`]
    Static,
    /// [`PortAlloc::allocate`](crate::PortAlloc::allocate)
    Heap,
}

/// *Event group control block* - the state data of an event group.
pub(crate) struct EventGroupCb<Traits: KernelTraits> {
    /// The event bits. Modified with the scheduler lock held. May be read
    /// without it from an interrupt-level critical section.
    bits: AtomicU32,

    wait_queue: WaitQueue<Traits>,

    provenance: Provenance,

    /// A diagnostic identifier
    number: AtomicUsize,
}

impl<Traits: KernelTraits> EventGroupCb<Traits> {
    const fn new(provenance: Provenance) -> Self {
        Self {
            bits: AtomicU32::new(0),
            wait_queue: WaitQueue::new(),
            provenance,
            number: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn bits(&self) -> EventGroupBits {
        self.bits.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_bits(&self, bits: EventGroupBits) {
        self.bits.store(bits, Ordering::Relaxed);
    }
}

/// Caller-supplied storage for an event group. Pass this to
/// [`EventGroup::new_static`].
///
/// The contents are opaque. The size and alignment are guaranteed to equal
/// those of the internal representation.
#[repr(transparent)]
pub struct StaticEventGroup<Traits: KernelTraits>(MaybeUninit<EventGroupCb<Traits>>);

impl<Traits: KernelTraits> StaticEventGroup<Traits> {
    /// Evaluated once per `Traits` when [`EventGroup::new_static`] is
    /// instantiated. Rejects the build if the buffer could not hold a control
    /// block.
    const LAYOUT_MATCHES: () = assert!(
        mem::size_of::<Self>() == mem::size_of::<EventGroupCb<Traits>>()
            && mem::align_of::<Self>() == mem::align_of::<EventGroupCb<Traits>>()
    );

    pub const fn new() -> Self {
        Self(MaybeUninit::uninit())
    }
}

impl<Traits: KernelTraits> Default for StaticEventGroup<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for StaticEventGroup<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("StaticEventGroup")
    }
}

/// A handle to an event group.
///
/// This is a plain reference that can be freely copied. Using a handle (or any
/// of its copies) after [`EventGroup::delete`] is undefined behavior, hence the
/// `unsafe` on `delete`.
pub struct EventGroup<Traits: KernelTraits> {
    cb: NonNull<EventGroupCb<Traits>>,
}

// Safety: `EventGroupCb` is designed to be shared between tasks and interrupt
//         handlers. All mutation is mediated by the scheduler lock or atomics.
unsafe impl<Traits: KernelTraits> Send for EventGroup<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for EventGroup<Traits> {}

impl<Traits: KernelTraits> Clone for EventGroup<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for EventGroup<Traits> {}

impl<Traits: KernelTraits> PartialEq for EventGroup<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.cb == other.cb
    }
}

impl<Traits: KernelTraits> Eq for EventGroup<Traits> {}

impl<Traits: KernelTraits> hash::Hash for EventGroup<Traits> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.cb.hash(state);
    }
}

impl<Traits: KernelTraits> fmt::Debug for EventGroup<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("EventGroup").field(&self.cb).finish()
    }
}

#[track_caller]
fn expect_valid_bits(bits: EventGroupBits) {
    assert_eq!(
        bits & EVENT_BITS_CONTROL_BYTES,
        0,
        "the mask {bits:#x} intersects the reserved bits"
    );
}

#[track_caller]
fn expect_valid_wait<Traits: KernelTraits>(bits: EventGroupBits, timeout: UTicks) {
    expect_valid_bits(bits);
    assert_ne!(bits, 0, "waiting for an empty set of bits");
    assert!(
        timeout == 0 || Traits::scheduler_state() == SchedulerState::Running,
        "can't block while the scheduler is not running"
    );
}

impl<Traits: KernelTraits> EventGroup<Traits> {
    /// Create an event group in caller-supplied storage. All bits are
    /// initially clear.
    pub fn new_static(buffer: &'static mut StaticEventGroup<Traits>) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = StaticEventGroup::<Traits>::LAYOUT_MATCHES;

        let cb = buffer.0.write(EventGroupCb::new(Provenance::Static));
        let this = Self {
            cb: NonNull::from(cb),
        };
        log::trace!("created {this:?} in static storage");
        this
    }

    /// Create an event group in memory provided by the port's allocator. All
    /// bits are initially clear.
    pub fn new() -> Result<Self, CreateEventGroupError> {
        let layout = Layout::new::<EventGroupCb<Traits>>();
        let Some(ptr) = Traits::allocate(layout) else {
            log::trace!("allocating an event group failed");
            return Err(CreateEventGroupError::NoMemory);
        };

        let cb = ptr.cast::<EventGroupCb<Traits>>();
        // Safety: `ptr` points to a fresh region suitable for `EventGroupCb`
        unsafe { cb.as_ptr().write(EventGroupCb::new(Provenance::Heap)) };

        let this = Self { cb };
        log::trace!("created {this:?} in allocated storage");
        Ok(this)
    }

    /// Reconstruct a handle from [`Self::as_raw`].
    ///
    /// # Safety
    ///
    /// `raw` must have been returned by `as_raw` for an event group that
    /// hasn't been deleted.
    pub unsafe fn from_raw(raw: NonNull<()>) -> Self {
        Self { cb: raw.cast() }
    }

    /// Get a raw pointer identifying the event group.
    pub fn as_raw(self) -> NonNull<()> {
        self.cb.cast()
    }

    #[inline]
    fn cb(&self) -> &EventGroupCb<Traits> {
        // Safety: The event group is alive as long as the handle is usable
        unsafe { self.cb.as_ref() }
    }

    /// Set the specified bits, waking up every task whose wait condition is
    /// now satisfied. Returns the bits as they are after the wake-ups (tasks
    /// waiting with [`EventGroupWaitFlags::CLEAR`] may have cleared some).
    ///
    /// Precondition: Task context
    pub fn set(self, bits: EventGroupBits) -> EventGroupBits {
        expect_valid_bits(bits);
        log::trace!("{self:?}.set({bits:#x})");

        let mut lock = klock::suspend_all::<Traits>();
        let ret = set_bits_inner(self.cb(), lock.borrow_mut(), bits);
        drop(lock);

        ret
    }

    /// Clear the specified bits. Returns the bits as they were before
    /// clearing.
    ///
    /// This doesn't wake up anyone because clearing bits can't satisfy a
    /// wait condition.
    ///
    /// Precondition: Task context
    pub fn clear(self, bits: EventGroupBits) -> EventGroupBits {
        expect_valid_bits(bits);
        log::trace!("{self:?}.clear({bits:#x})");

        let cb = self.cb();
        let _lock = klock::enter_critical::<Traits>();
        let prev = cb.bits();
        cb.set_bits(prev & !bits);
        prev
    }

    /// Get the current bits.
    ///
    /// Precondition: Task context
    pub fn get(self) -> EventGroupBits {
        self.clear(0)
    }

    /// Wait until the specified bits are set, as determined by `flags`.
    ///
    /// Returns the bits that satisfied the condition, as they were before
    /// [`EventGroupWaitFlags::CLEAR`] took effect. Returns [`WaitTimeout`] if
    /// the condition wasn't satisfied within `timeout` ticks. A zero `timeout`
    /// polls without blocking.
    ///
    /// # Panics
    ///
    /// Panics if `bits` is empty or intersects [`EVENT_BITS_CONTROL_BYTES`],
    /// or if `timeout` is not zero and the scheduler is not running.
    pub fn wait(
        self,
        bits: EventGroupBits,
        flags: EventGroupWaitFlags,
        timeout: UTicks,
    ) -> Result<EventGroupBits, WaitTimeout> {
        expect_valid_wait::<Traits>(bits, timeout);
        log::trace!("{self:?}.wait({bits:#x}, {flags:?}, {timeout})");

        let cb = self.cb();
        let lock = klock::suspend_all::<Traits>();
        let current = cb.bits();

        if wait_condition_met(current, bits, flags) {
            if flags.contains(EventGroupWaitFlags::CLEAR) {
                cb.set_bits(current & !bits);
            }
            drop(lock);
            return Ok(current);
        }

        if timeout == 0 {
            drop(lock);
            return Err(WaitTimeout { bits: current });
        }

        let queue = NonNull::from(&cb.wait_queue);
        // Safety: `queue` is live. If the event group is deleted while we are
        //         blocked, `delete` wakes us up first.
        let outcome = unsafe { WaitQueue::wait_timeout(queue, lock, bits, flags, timeout) };
        let ret = finish_wait(self, outcome, |current| {
            let met = wait_condition_met(current, bits, flags);
            (met && flags.contains(EventGroupWaitFlags::CLEAR)).then_some(bits)
        });

        log::trace!("{self:?}.wait({bits:#x}, {flags:?}, {timeout}) = {ret:?}");
        ret
    }

    /// Set `bits_to_set`, then wait until all of `bits_to_wait_for` are set,
    /// and clear `bits_to_wait_for` on success. This is a rendezvous point
    /// for tasks that each contribute some bits.
    ///
    /// Setting and testing happen in one step, so the contributions of tasks
    /// that arrived earlier are always visible to the test. On success,
    /// returns the bits as they were before clearing.
    ///
    /// # Panics
    ///
    /// Panics if either mask intersects [`EVENT_BITS_CONTROL_BYTES`], if
    /// `bits_to_wait_for` is empty, or if `timeout` is not zero and the
    /// scheduler is not running.
    pub fn sync(
        self,
        bits_to_set: EventGroupBits,
        bits_to_wait_for: EventGroupBits,
        timeout: UTicks,
    ) -> Result<EventGroupBits, WaitTimeout> {
        expect_valid_bits(bits_to_set);
        expect_valid_wait::<Traits>(bits_to_wait_for, timeout);
        log::trace!("{self:?}.sync({bits_to_set:#x}, {bits_to_wait_for:#x}, {timeout})");

        let cb = self.cb();
        let mut lock = klock::suspend_all::<Traits>();
        let original = cb.bits();

        set_bits_inner(cb, lock.borrow_mut(), bits_to_set);

        if (original | bits_to_set) & bits_to_wait_for == bits_to_wait_for {
            // The rendezvous consumes the barrier bits
            cb.set_bits(cb.bits() & !bits_to_wait_for);
            drop(lock);
            return Ok(original | bits_to_set);
        }

        if timeout == 0 {
            let current = cb.bits();
            drop(lock);
            return Err(WaitTimeout { bits: current });
        }

        let queue = NonNull::from(&cb.wait_queue);
        // Safety: See `Self::wait`
        let outcome = unsafe {
            WaitQueue::wait_timeout(
                queue,
                lock,
                bits_to_wait_for,
                EventGroupWaitFlags::ALL | EventGroupWaitFlags::CLEAR,
                timeout,
            )
        };
        let ret = finish_wait(self, outcome, |current| {
            (current & bits_to_wait_for == bits_to_wait_for).then_some(bits_to_wait_for)
        });

        log::trace!(
            "{self:?}.sync({bits_to_set:#x}, {bits_to_wait_for:#x}, {timeout}) = {ret:?}"
        );
        ret
    }

    /// Delete the event group. Every task blocked on it is woken up and
    /// receives `Ok(0)`. The storage is released if it was allocated by
    /// [`Self::new`].
    ///
    /// # Safety
    ///
    /// The event group must not be used after this call, through this handle
    /// or any of its copies. No deferred call targeting the event group may be
    /// pending.
    ///
    /// Precondition: Task context
    pub unsafe fn delete(self) {
        log::trace!("{self:?}.delete()");

        let cb = self.cb();
        let mut lock = klock::suspend_all::<Traits>();
        let num_woken = cb.wait_queue.wake_up_all(lock.borrow_mut(), 0);
        drop(lock);

        log::trace!("{self:?} deleted with {num_woken} waiter(s)");

        if cb.provenance == Provenance::Heap {
            let layout = Layout::new::<EventGroupCb<Traits>>();
            // Safety: The woken tasks don't touch `cb` anymore. The caller
            //         won't use it either.
            unsafe {
                self.cb.as_ptr().drop_in_place();
                Traits::deallocate(self.cb.cast(), layout);
            }
        }
    }

    /// Get the current bits from an interrupt handler.
    pub fn get_from_isr(self) -> EventGroupBits {
        let _lock = klock::enter_critical_from_isr::<Traits>();
        self.cb().bits()
    }

    /// Request the specified bits to be set from an interrupt handler. The
    /// request is carried out later by the port's deferred call consumer.
    ///
    /// `higher_priority_task_woken` is set to `true` if the port has to
    /// switch to the consumer task as soon as the interrupt handler returns.
    pub fn set_from_isr(
        self,
        bits: EventGroupBits,
        higher_priority_task_woken: Option<&mut bool>,
    ) -> Result<(), PendCallError> {
        expect_valid_bits(bits);
        log::trace!("{self:?}.set_from_isr({bits:#x})");

        // Safety: `set_bits_callback` requires a live event group, and
        //         `delete` requires no pending calls
        let call = unsafe {
            PendedCall::new(set_bits_callback::<Traits>, self.as_raw().as_ptr(), bits)
        };
        Traits::pend_function_call_from_isr(call, higher_priority_task_woken)
    }

    /// Request the specified bits to be cleared from an interrupt handler.
    /// The request is carried out later by the port's deferred call consumer.
    pub fn clear_from_isr(self, bits: EventGroupBits) -> Result<(), PendCallError> {
        expect_valid_bits(bits);
        log::trace!("{self:?}.clear_from_isr({bits:#x})");

        // Safety: `clear_bits_callback` requires a live event group, and
        //         `delete` requires no pending calls
        let call = unsafe {
            PendedCall::new(clear_bits_callback::<Traits>, self.as_raw().as_ptr(), bits)
        };
        Traits::pend_function_call_from_isr(call, None)
    }

    /// Get a flag indicating whether the event group was created by
    /// [`Self::new_static`].
    pub fn is_static(self) -> bool {
        self.cb().provenance == Provenance::Static
    }

    /// Get the storage passed to [`Self::new_static`], or `None` if the event
    /// group was created by [`Self::new`].
    pub fn static_buffer(self) -> Option<NonNull<StaticEventGroup<Traits>>> {
        self.is_static().then(|| self.cb.cast())
    }

    /// Get the diagnostic identifier of the event group. Zero unless set by
    /// [`Self::set_number`].
    pub fn number(self) -> usize {
        self.cb().number.load(Ordering::Relaxed)
    }

    /// Assign a diagnostic identifier to the event group.
    pub fn set_number(self, number: usize) {
        self.cb().number.store(number, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn num_waiters(self) -> usize {
        let mut lock = klock::suspend_all::<Traits>();
        self.cb().wait_queue.len(lock.borrow_mut())
    }
}

/// The core of [`EventGroup::set`]. Sets `bits_to_set`, wakes up every waiter
/// whose condition is met by the result, and then clears the bits requested by
/// the woken waiters. Returns the final bits.
///
/// All waiters are evaluated against the same value, so a waiter's clearing
/// can't prevent another waiter from waking up in the same pass.
fn set_bits_inner<Traits: KernelTraits>(
    cb: &EventGroupCb<Traits>,
    lock: klock::SchedLockTokenRefMut<'_, Traits>,
    bits_to_set: EventGroupBits,
) -> EventGroupBits {
    let bits = cb.bits() | bits_to_set;
    cb.set_bits(bits);

    let mut bits_to_clear = 0;
    cb.wait_queue.wake_up_all_conditional(lock, |payload| {
        if !wait_condition_met(bits, payload.bits, payload.flags) {
            return None;
        }
        if payload.flags.contains(EventGroupWaitFlags::CLEAR) {
            bits_to_clear |= payload.bits;
        }
        Some(bits)
    });

    let bits = bits & !bits_to_clear;
    cb.set_bits(bits);
    bits
}

/// Produce the result of a blocking operation from the outcome of
/// `WaitQueue::wait_timeout`.
///
/// If the wait timed out, the bits are examined again in a critical section.
/// `clear_on_timeout` returns the bits to clear, if any, given the current
/// bits. The result is a timeout regardless of what it decides.
///
/// The event group is not accessed unless the wait timed out because it may
/// have been deleted otherwise.
fn finish_wait<Traits: KernelTraits>(
    event_group: EventGroup<Traits>,
    outcome: Option<EventGroupBits>,
    clear_on_timeout: impl FnOnce(EventGroupBits) -> Option<EventGroupBits>,
) -> Result<EventGroupBits, WaitTimeout> {
    if let Some(bits) = outcome {
        // Unblocked by a set operation or the deletion of the event group.
        // Any clearing has already been done by the waker.
        return Ok(bits & !EVENT_BITS_CONTROL_BYTES);
    }

    let cb = event_group.cb();
    let lock = klock::enter_critical::<Traits>();
    let current = cb.bits();
    if let Some(bits_to_clear) = clear_on_timeout(current) {
        cb.set_bits(current & !bits_to_clear);
    }
    drop(lock);

    Err(WaitTimeout {
        bits: current & !EVENT_BITS_CONTROL_BYTES,
    })
}

/// Execute a deferred [`EventGroup::set_from_isr`] request.
///
/// # Safety
///
/// `event_group` must be the raw form of a live [`EventGroup`]`<Traits>`.
///
/// Precondition: Task context
pub unsafe fn set_bits_callback<Traits: KernelTraits>(event_group: *mut (), bits: u32) {
    // Safety: Upheld by the caller
    let event_group =
        unsafe { EventGroup::<Traits>::from_raw(NonNull::new_unchecked(event_group)) };
    event_group.set(bits);
}

/// Execute a deferred [`EventGroup::clear_from_isr`] request.
///
/// # Safety
///
/// `event_group` must be the raw form of a live [`EventGroup`]`<Traits>`.
///
/// Precondition: Task context
pub unsafe fn clear_bits_callback<Traits: KernelTraits>(event_group: *mut (), bits: u32) {
    // Safety: Upheld by the caller
    let event_group =
        unsafe { EventGroup::<Traits>::from_raw(NonNull::new_unchecked(event_group)) };
    event_group.clear(bits);
}
