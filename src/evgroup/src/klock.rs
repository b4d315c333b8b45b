//! Scheduler lock and the token-guarded cells it unlocks
//!
//! Every piece of state that must not be touched by two tasks at once is
//! wrapped in a [`SchedLockCell`]. The only way to obtain the token that opens
//! these cells is to hold one of the guards defined here, i.e., to have the
//! scheduler suspended ([`suspend_all`]) or to be inside a task-level critical
//! section ([`enter_critical`]).
use core::{mem::ManuallyDrop, ops};
use tokenlock::UnsyncTokenLock;

use crate::{utils::intrusive_list::CellLike, PortThreading};

pub(crate) struct SchedLockTag<Traits>(Traits);

/// The key that "unlocks" [`SchedLockCell`].
pub(crate) type SchedLockToken<Traits> = tokenlock::UnsyncSingletonToken<SchedLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`SchedLockToken`].
pub(crate) type SchedLockKeyhole<Traits> = tokenlock::SingletonTokenId<SchedLockTag<Traits>>;

/// Borrowed version of [`SuspendGuard`] and [`CriticalGuard`]. This is
/// equivalent to `&'a mut SchedLockToken` but does not consume memory.
///
/// Unlike `&mut _`, this is not reborrowed automatically when passed to a
/// function. Call [`borrow_mut`] to keep the original usable.
///
/// [`borrow_mut`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(crate) type SchedLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, SchedLockTag<Traits>>;

/// Cell type that can be accessed by [`SchedLockToken`].
pub(crate) struct SchedLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, SchedLockKeyhole<Traits>>);

impl<Traits, T> SchedLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(SchedLockKeyhole::new(), x))
    }
}

impl<Traits, T> ops::Deref for SchedLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, SchedLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a, Element: Clone, Traits: PortThreading> CellLike<SchedLockTokenRefMut<'a, Traits>>
    for SchedLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &SchedLockTokenRefMut<'a, Traits>) -> Self::Target {
        (**self).get(&**key)
    }
    fn set(&self, key: &mut SchedLockTokenRefMut<'a, Traits>, value: Self::Target) {
        (**self).replace(&mut **key, value);
    }
    fn modify<T>(
        &self,
        key: &mut SchedLockTokenRefMut<'a, Traits>,
        f: impl FnOnce(&mut Self::Target) -> T,
    ) -> T {
        f((**self).write(&mut **key))
    }
}

/// Suspend the scheduler and get an RAII guard. Other tasks can't run until
/// the guard is dropped or [`SuspendGuard::resume`] is called. Interrupts are
/// still serviced.
///
/// The scheduler lock is not reentrant at the type level: the caller must not
/// hold another [`SuspendGuard`] or [`CriticalGuard`] of the same `Traits`.
pub(crate) fn suspend_all<Traits: PortThreading>() -> SuspendGuard<Traits> {
    // Safety: Paired with `resume_all` in `SuspendGuard`
    unsafe { Traits::suspend_all() };

    SuspendGuard {
        // Safety: No other guard exists in this context. This is upheld by the
        //         caller.
        token: unsafe { SchedLockToken::new_unchecked() },
    }
}

/// RAII guard for a scheduler suspension.
///
/// [`SchedLockToken`] can be borrowed from this type.
pub(crate) struct SuspendGuard<Traits: PortThreading> {
    token: SchedLockToken<Traits>,
}

impl<Traits: PortThreading> SuspendGuard<Traits> {
    /// Construct a [`SchedLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> SchedLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }

    /// Resume the scheduler. Returns `true` if the resumption has already
    /// caused a context switch.
    pub(crate) fn resume(self) -> bool {
        let _ = ManuallyDrop::new(self);
        // Safety: We suspended the scheduler in `suspend_all`
        unsafe { Traits::resume_all() }
    }
}

impl<Traits: PortThreading> Drop for SuspendGuard<Traits> {
    fn drop(&mut self) {
        // Safety: We suspended the scheduler in `suspend_all`
        unsafe {
            Traits::resume_all();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for SuspendGuard<Traits> {
    type Target = SchedLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for SuspendGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Enter a task-level critical section and get an RAII guard.
///
/// The same restriction as [`suspend_all`] applies.
pub(crate) fn enter_critical<Traits: PortThreading>() -> CriticalGuard<Traits> {
    // Safety: Paired with `exit_critical` in `CriticalGuard`
    unsafe { Traits::enter_critical() };

    CriticalGuard {
        // Safety: No other guard exists in this context. This is upheld by the
        //         caller.
        token: unsafe { SchedLockToken::new_unchecked() },
    }
}

/// RAII guard for a task-level critical section.
pub(crate) struct CriticalGuard<Traits: PortThreading> {
    token: SchedLockToken<Traits>,
}

impl<Traits: PortThreading> Drop for CriticalGuard<Traits> {
    fn drop(&mut self) {
        // Safety: We entered the critical section in `enter_critical`
        unsafe {
            Traits::exit_critical();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CriticalGuard<Traits> {
    type Target = SchedLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

/// Mask interrupts from an interrupt handler and get an RAII guard.
///
/// This does not produce a [`SchedLockToken`]. An interrupt handler may run
/// while the scheduler is suspended and must not touch [`SchedLockCell`]s.
pub(crate) fn enter_critical_from_isr<Traits: PortThreading>() -> IsrCriticalGuard<Traits> {
    IsrCriticalGuard {
        // Safety: Paired with `exit_critical_from_isr` in `IsrCriticalGuard`
        mask: unsafe { Traits::enter_critical_from_isr() },
    }
}

/// RAII guard for an interrupt-level critical section.
pub(crate) struct IsrCriticalGuard<Traits: PortThreading> {
    mask: Traits::InterruptMask,
}

impl<Traits: PortThreading> Drop for IsrCriticalGuard<Traits> {
    fn drop(&mut self) {
        // Safety: `mask` was returned by `enter_critical_from_isr`
        unsafe {
            Traits::exit_critical_from_isr(self.mask);
        }
    }
}

/// Assume the scheduler lock is held and get a bare [`SchedLockToken`].
///
/// # Safety
///
/// The caller must be the owner of the scheduler lock (the scheduler is
/// suspended by the current context, or the current context is inside a
/// task-level critical section), and no guard or token of the same `Traits`
/// may be alive at the point of the call.
pub(crate) unsafe fn assume_sched_lock<Traits: PortThreading>() -> SchedLockToken<Traits> {
    // Safety: Upheld by the caller
    unsafe { SchedLockToken::new_unchecked() }
}
