#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use evgroup::{
    wait::expire_wait, KernelTraits, PendCallError, PendedCall, PortThreading, SchedulerState,
    TaskWait, UTicks, WAIT_FOREVER,
};
use spin::Mutex as SpinMutex;
use std::{
    alloc::Layout,
    cell::Cell,
    fmt,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Condvar, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};


/// Used by `use_port!`
#[doc(hidden)]
pub extern crate evgroup;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// Parameters of the simulated system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The real duration of one tick.
    pub tick_period: Duration,
    /// The capacity of the deferred call queue. Requests made by interrupt
    /// handlers while the queue is full are rejected.
    pub deferred_queue_len: usize,
    /// The maximum number of bytes that can be allocated for event groups at
    /// the same time. `None` means unlimited.
    pub heap_limit: Option<usize>,
}

impl Config {
    pub const DEFAULT: Self = Self {
        tick_period: Duration::from_millis(1),
        deferred_queue_len: 10,
        heap_limit: None,
    };
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<TaskRef = TaskRef<Self>, InterruptMask = ()>
{
    fn port_state() -> &'static State<Self>;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State<Traits: PortThreading> {
    config: Config,
    /// The scheduler lock. It's owned by at most one thread at a time and is
    /// reentrant for the owner.
    sched: Mutex<SchedState>,
    sched_released: Condvar,
    /// Held while any context is inside a critical section.
    isr_lock: SpinMutex<()>,
    tasks: SpinMutex<slab::Slab<&'static TaskCb<Traits>>>,
    deferred_send: OnceLock<mpsc::SyncSender<PendedCall>>,
    heap_used: AtomicUsize,
}

#[derive(Debug)]
struct SchedState {
    owner: Option<thread::ThreadId>,
    suspend_nesting: usize,
    critical_nesting: usize,
}

/// Task control block
struct TaskCb<Traits: PortThreading> {
    id: usize,
    name: String,
    /// Protected by `Mutex` so that the task's thread can sleep on `wake`
    st: Mutex<TaskSt>,
    wake: Condvar,
    wait: TaskWait<Traits>,
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskSt {
    Ready,
    /// The task is blocked. When `deadline` passes, the task takes itself out
    /// of the wait queue.
    Blocked { deadline: Option<Instant> },
}

/// Identifies a task created by [`spawn_task`].
pub struct TaskRef<Traits: PortThreading>(&'static TaskCb<Traits>);

impl<Traits: PortThreading> Clone for TaskRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TaskRef<Traits> {}

impl<Traits: PortThreading> PartialEq for TaskRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl<Traits: PortThreading> Eq for TaskRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TaskRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Task({}, {:?})", self.0.id, self.0.name)
    }
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The backing thread for an interrupt context.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);

    /// The slab key of the task backed by the current thread.
    static CURRENT_TASK: Cell<Option<usize>> = Cell::new(None);
}

#[allow(clippy::missing_safety_doc)]
impl<Traits: PortThreading> State<Traits> {
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            sched: Mutex::new(SchedState {
                owner: None,
                suspend_nesting: 0,
                critical_nesting: 0,
            }),
            sched_released: Condvar::new(),
            isr_lock: SpinMutex::new(()),
            tasks: SpinMutex::new(slab::Slab::new()),
            deferred_send: OnceLock::new(),
            heap_used: AtomicUsize::new(0),
        }
    }
}

#[allow(clippy::missing_safety_doc)]
impl<Traits: PortInstance> State<Traits> {
    /// Start the deferred call daemon if it isn't running yet.
    fn boot(&'static self) -> &'static mpsc::SyncSender<PendedCall> {
        self.deferred_send.get_or_init(|| {
            let _ = env_logger::try_init();

            log::trace!("starting the daemon task");
            let (send, recv) = mpsc::sync_channel::<PendedCall>(self.config.deferred_queue_len);
            self.spawn_task("evgroup daemon", move || {
                for call in recv.iter() {
                    log::trace!("executing {call:?}");
                    call.call();
                }
            });
            send
        })
    }

    fn spawn_task(
        &'static self,
        name: &str,
        body: impl FnOnce() + Send + 'static,
    ) -> Task<Traits> {
        let mut tasks = self.tasks.lock();
        let entry = tasks.vacant_entry();
        let id = entry.key();
        let cb: &'static TaskCb<Traits> = Box::leak(Box::new(TaskCb {
            id,
            name: name.to_owned(),
            st: Mutex::new(TaskSt::Ready),
            wake: Condvar::new(),
            wait: TaskWait::new(),
        }));
        entry.insert(cb);
        drop(tasks);

        let join_handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
                CURRENT_TASK.with(|task| task.set(Some(id)));
                log::debug!("{:?} is now running", TaskRef(cb));

                body();

                log::debug!("{:?} exited", TaskRef(cb));
                self.tasks.lock().remove(id);
            })
            .unwrap();

        Task {
            task: TaskRef(cb),
            join_handle,
        }
    }

    /// Acquire the scheduler lock, waiting for other threads to release it.
    fn lock_sched(&self, critical: bool) {
        let me = thread::current().id();
        let mut sched = self.sched.lock().unwrap();
        while sched.owner.map_or(false, |owner| owner != me) {
            sched = self.sched_released.wait(sched).unwrap();
        }
        sched.owner = Some(me);
        if critical {
            sched.critical_nesting += 1;
            if sched.critical_nesting == 1 {
                std::mem::forget(self.isr_lock.lock());
            }
        } else {
            sched.suspend_nesting += 1;
        }
    }

    fn unlock_sched(&self, critical: bool) {
        let mut sched = self.sched.lock().unwrap();
        assert_eq!(sched.owner, Some(thread::current().id()));
        if critical {
            sched.critical_nesting -= 1;
            if sched.critical_nesting == 0 {
                // Safety: We forgot the guard in `lock_sched`
                unsafe { self.isr_lock.force_unlock() };
            }
        } else {
            sched.suspend_nesting -= 1;
        }
        if sched.suspend_nesting == 0 && sched.critical_nesting == 0 {
            sched.owner = None;
            self.sched_released.notify_all();
        }
    }

    pub unsafe fn suspend_all(&self) {
        self.lock_sched(false);
    }

    pub unsafe fn resume_all(&self) -> bool {
        self.unlock_sched(false);
        // Nothing runs in our place; other threads run concurrently anyway
        false
    }

    pub unsafe fn enter_critical(&self) {
        self.lock_sched(true);
    }

    pub unsafe fn exit_critical(&self) {
        self.unlock_sched(true);
    }

    pub unsafe fn enter_critical_from_isr(&self) {
        std::mem::forget(self.isr_lock.lock());
    }

    pub unsafe fn exit_critical_from_isr(&self) {
        // Safety: We forgot the guard in `enter_critical_from_isr`
        unsafe { self.isr_lock.force_unlock() };
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        let sched = self.sched.lock().unwrap();
        if sched.owner == Some(thread::current().id()) && sched.suspend_nesting > 0 {
            return SchedulerState::Suspended;
        }
        drop(sched);

        match THREAD_ROLE.with(|role| role.get()) {
            ThreadRole::Task | ThreadRole::Interrupt => SchedulerState::Running,
            ThreadRole::Unknown => SchedulerState::NotStarted,
        }
    }

    pub fn current_task(&self) -> TaskRef<Traits> {
        let id = CURRENT_TASK
            .with(|task| task.get())
            .expect("not a task context");
        TaskRef(self.tasks.lock()[id])
    }

    pub fn task_wait(&self, task: TaskRef<Traits>) -> &'static TaskWait<Traits> {
        &task.0.wait
    }

    pub unsafe fn block_current_task(&self, timeout: UTicks) {
        let task = self.current_task();
        let deadline =
            (timeout != WAIT_FOREVER).then(|| Instant::now() + self.config.tick_period * timeout);
        log::trace!("{task:?} blocks until {deadline:?}");

        let mut st = task.0.st.lock().unwrap();
        assert_eq!(*st, TaskSt::Ready);
        *st = TaskSt::Blocked { deadline };
    }

    pub unsafe fn unblock_task(&self, task: TaskRef<Traits>) {
        log::trace!("unblocking {task:?}");
        let mut st = task.0.st.lock().unwrap();
        assert_ne!(*st, TaskSt::Ready);
        *st = TaskSt::Ready;
        task.0.wake.notify_one();
    }

    pub unsafe fn yield_within_api(&self) {
        if THREAD_ROLE.with(|role| role.get()) != ThreadRole::Task {
            thread::yield_now();
            return;
        }

        let task = self.current_task();
        let mut st = task.0.st.lock().unwrap();
        loop {
            match *st {
                TaskSt::Ready => break,
                TaskSt::Blocked { deadline: None } => {
                    st = task.0.wake.wait(st).unwrap();
                }
                TaskSt::Blocked {
                    deadline: Some(deadline),
                } => {
                    let now = Instant::now();
                    if now < deadline {
                        st = task.0.wake.wait_timeout(st, deadline - now).unwrap().0;
                        continue;
                    }

                    // The timeout has elapsed. Take the lock in the same order
                    // as `unblock_task`'s callers do.
                    drop(st);
                    self.lock_sched(false);
                    st = task.0.st.lock().unwrap();
                    if *st != TaskSt::Ready {
                        // Safety: We own the scheduler lock and are outside the
                        //         engine's critical sections
                        let expired = unsafe { expire_wait::<Traits>(task) };
                        log::trace!("{task:?} timed out (expired = {expired})");
                        *st = TaskSt::Ready;
                    }
                    drop(st);
                    self.unlock_sched(false);
                    return;
                }
            }
        }
    }

    pub fn pend_function_call_from_isr(
        &'static self,
        call: PendedCall,
        higher_priority_task_woken: Option<&mut bool>,
    ) -> Result<(), PendCallError> {
        match self.boot().try_send(call) {
            Ok(()) => {
                // The daemon task outranks everyone else
                if let Some(woken) = higher_priority_task_woken {
                    *woken = true;
                }
                Ok(())
            }
            Err(mpsc::TrySendError::Full(call)) => {
                log::debug!("deferred call queue overflow, dropping {call:?}");
                Err(PendCallError::QueueOverflow)
            }
            Err(mpsc::TrySendError::Disconnected(_)) => unreachable!("the daemon task exited"),
        }
    }

    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let size = layout.size();
        let limit = self.config.heap_limit.unwrap_or(usize::MAX);
        if self
            .heap_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&new_used| new_used <= limit)
            })
            .is_err()
        {
            log::debug!("allocation of {size} bytes exceeds the heap limit");
            return None;
        }

        // Safety: Event group control blocks are not zero-sized
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) });
        if ptr.is_none() {
            self.heap_used.fetch_sub(size, Ordering::AcqRel);
        }
        ptr
    }

    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: Upheld by the caller
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        self.heap_used.fetch_sub(layout.size(), Ordering::AcqRel);
    }
}

/// A handle to a task created by [`spawn_task`].
pub struct Task<Traits: PortThreading> {
    task: TaskRef<Traits>,
    join_handle: thread::JoinHandle<()>,
}

impl<Traits: PortThreading> Task<Traits> {
    pub fn task_ref(&self) -> TaskRef<Traits> {
        self.task
    }

    /// Get a flag indicating whether the task is currently blocked.
    pub fn is_blocked(&self) -> bool {
        matches!(*self.task.0.st.lock().unwrap(), TaskSt::Blocked { .. })
    }

    /// Wait until the task is blocked.
    pub fn wait_until_blocked(&self) {
        while !self.is_blocked() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Wait for the task to complete. Propagates a panic that occurred in the
    /// task.
    pub fn join(self) {
        if let Err(e) = self.join_handle.join() {
            std::panic::resume_unwind(e);
        }
    }
}

/// Create a task running `body` on a new thread. The task may use all
/// blocking operations of event groups.
pub fn spawn_task<Traits: PortInstance>(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Task<Traits> {
    let state = Traits::port_state();
    state.boot();
    state.spawn_task(name, body)
}

/// Run `handler` in an interrupt context and wait for its completion.
pub fn interrupt<Traits: PortInstance, R: Send>(handler: impl FnOnce() -> R + Send) -> R {
    Traits::port_state().boot();
    thread::scope(|scope| {
        let join_handle = scope.spawn(|| {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
            handler()
        });
        join_handle
            .join()
            .unwrap_or_else(|e| std::panic::resume_unwind(e))
    })
}

/// Temporarily lock the scheduler.
///
/// No task can use event groups until the lock is relinquished. Interrupt
/// handlers can still make requests, but they are not serviced in the
/// meantime.
pub fn lock_scheduler<Traits: PortInstance>() -> SchedulerLockGuard<Traits> {
    let state = Traits::port_state();
    state.lock_sched(false);
    SchedulerLockGuard { state }
}

/// RAII guard returned by [`lock_scheduler`].
pub struct SchedulerLockGuard<Traits: PortInstance> {
    state: &'static State<Traits>,
}

impl<Traits: PortInstance> Drop for SchedulerLockGuard<Traits> {
    fn drop(&mut self) {
        self.state.unlock_sched(false);
    }
}

/// Get the number of bytes currently allocated for event groups.
pub fn heap_used<Traits: PortInstance>() -> usize {
    Traits::port_state().heap_used.load(Ordering::Acquire)
}

/// Define a kernel trait type implementing the port traits of `evgroup`.
///
/// ```rust,ignore
/// evgroup_port_std::use_port!(unsafe struct SystemTraits);
/// ```
///
/// A [`Config`] can be given in the form of
/// `use_port!(unsafe struct SystemTraits, config = CONFIG)`.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $crate::use_port!(unsafe $vis struct $SystemTraits, config = $crate::Config::DEFAULT);
    };
    (unsafe $vis:vis struct $SystemTraits:ident, config = $config:expr) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            #[allow(unused_imports)]
            use super::*;
            use super::$SystemTraits;
            use $crate::evgroup::{
                PendCallError, PendedCall, PortAlloc, PortDeferredCall, PortThreading,
                SchedulerState, TaskWait, UTicks,
            };
            use $crate::{PortInstance, State, TaskRef};
            use ::std::{alloc::Layout, ptr::NonNull};

            pub(super) static PORT_STATE: State<$SystemTraits> = State::new($config);

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State<Self> {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type TaskRef = TaskRef<Self>;
                type InterruptMask = ();

                unsafe fn suspend_all() {
                    unsafe { PORT_STATE.suspend_all() }
                }

                unsafe fn resume_all() -> bool {
                    unsafe { PORT_STATE.resume_all() }
                }

                unsafe fn yield_within_api() {
                    unsafe { PORT_STATE.yield_within_api() }
                }

                unsafe fn enter_critical() {
                    unsafe { PORT_STATE.enter_critical() }
                }

                unsafe fn exit_critical() {
                    unsafe { PORT_STATE.exit_critical() }
                }

                unsafe fn enter_critical_from_isr() {
                    unsafe { PORT_STATE.enter_critical_from_isr() }
                }

                unsafe fn exit_critical_from_isr((): ()) {
                    unsafe { PORT_STATE.exit_critical_from_isr() }
                }

                fn scheduler_state() -> SchedulerState {
                    PORT_STATE.scheduler_state()
                }

                fn current_task() -> Self::TaskRef {
                    PORT_STATE.current_task()
                }

                fn task_wait(task: Self::TaskRef) -> &'static TaskWait<Self> {
                    PORT_STATE.task_wait(task)
                }

                unsafe fn block_current_task(timeout: UTicks) {
                    unsafe { PORT_STATE.block_current_task(timeout) }
                }

                unsafe fn unblock_task(task: Self::TaskRef) {
                    unsafe { PORT_STATE.unblock_task(task) }
                }
            }

            unsafe impl PortDeferredCall for $SystemTraits {
                fn pend_function_call_from_isr(
                    call: PendedCall,
                    higher_priority_task_woken: Option<&mut bool>,
                ) -> Result<(), PendCallError> {
                    PORT_STATE.pend_function_call_from_isr(call, higher_priority_task_woken)
                }
            }

            unsafe impl PortAlloc for $SystemTraits {
                fn allocate(layout: Layout) -> Option<NonNull<u8>> {
                    PORT_STATE.allocate(layout)
                }

                unsafe fn deallocate(ptr: NonNull<u8>, layout: Layout) {
                    unsafe { PORT_STATE.deallocate(ptr, layout) }
                }
            }
        }
    };
}
