//! Tests for event groups running on a deterministic mock port.
//!
//! The mock port runs every "task" on the test thread. When a task blocks,
//! [`PortThreading::yield_within_api`] runs the queued hooks one by one as the
//! next task until the blocked task is unblocked. If no hooks remain, the
//! blocked task's timeout expires. A hook may block in turn, which nests
//! another simulated task.
use quickcheck_macros::quickcheck;
use std::{alloc::Layout, cell::RefCell, collections::VecDeque, ptr::NonNull};

use super::*;
use crate::{
    wait::{expire_wait, TaskWait},
    PendedCall, PortAlloc, PortDeferredCall, PortThreading, ResultCode, WAIT_FOREVER,
};

const NUM_TASKS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TaskId(usize);

#[derive(Default)]
struct MockState {
    started: bool,
    suspend_nesting: usize,
    critical_nesting: usize,
    isr_nesting: usize,
    current: usize,
    /// The timeouts of blocked tasks
    blocked: [Option<UTicks>; NUM_TASKS],
    hooks: VecDeque<Box<dyn FnOnce()>>,
    deferred: VecDeque<PendedCall>,
    deferred_capacity: usize,
    /// The number of allocations that will succeed, `None` = unlimited
    heap_budget: Option<usize>,
    num_yields: usize,
}

thread_local! {
    static MOCK: RefCell<MockState> = RefCell::new(MockState::default());
    static TASK_WAITS: &'static [TaskWait<MockTraits>; NUM_TASKS] =
        Box::leak(Box::new(std::array::from_fn(|_| TaskWait::new())));
}

fn with_mock<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    MOCK.with(|m| f(&mut m.borrow_mut()))
}

struct MockTraits;

unsafe impl PortThreading for MockTraits {
    type TaskRef = TaskId;
    type InterruptMask = ();

    unsafe fn suspend_all() {
        with_mock(|m| m.suspend_nesting += 1);
    }

    unsafe fn resume_all() -> bool {
        with_mock(|m| {
            assert_ne!(m.suspend_nesting, 0);
            m.suspend_nesting -= 1;
        });
        false
    }

    unsafe fn yield_within_api() {
        let task = with_mock(|m| {
            assert_eq!(m.suspend_nesting, 0);
            m.num_yields += 1;
            m.current
        });

        while let Some(timeout) = with_mock(|m| m.blocked[task]) {
            if let Some(hook) = with_mock(|m| m.hooks.pop_front()) {
                as_task(task + 1, hook);
            } else {
                assert_ne!(
                    timeout, WAIT_FOREVER,
                    "task {task} is blocked forever with nothing left to run"
                );
                expire(task);
            }
        }
    }

    unsafe fn enter_critical() {
        with_mock(|m| m.critical_nesting += 1);
    }

    unsafe fn exit_critical() {
        with_mock(|m| {
            assert_ne!(m.critical_nesting, 0);
            m.critical_nesting -= 1;
        });
    }

    unsafe fn enter_critical_from_isr() {
        with_mock(|m| m.isr_nesting += 1);
    }

    unsafe fn exit_critical_from_isr((): ()) {
        with_mock(|m| m.isr_nesting -= 1);
    }

    fn scheduler_state() -> SchedulerState {
        with_mock(|m| {
            if m.suspend_nesting > 0 {
                SchedulerState::Suspended
            } else if m.started {
                SchedulerState::Running
            } else {
                SchedulerState::NotStarted
            }
        })
    }

    fn current_task() -> TaskId {
        TaskId(with_mock(|m| m.current))
    }

    fn task_wait(task: TaskId) -> &'static TaskWait<Self> {
        let task_waits: &'static [_; NUM_TASKS] = TASK_WAITS.with(|w| *w);
        &task_waits[task.0]
    }

    unsafe fn block_current_task(timeout: UTicks) {
        with_mock(|m| {
            assert_ne!(m.suspend_nesting, 0);
            m.blocked[m.current] = Some(timeout);
        });
    }

    unsafe fn unblock_task(task: TaskId) {
        with_mock(|m| {
            assert_ne!(m.suspend_nesting, 0);
            assert!(m.blocked[task.0].take().is_some(), "{task:?} isn't blocked");
        });
    }
}

unsafe impl PortDeferredCall for MockTraits {
    fn pend_function_call_from_isr(
        call: PendedCall,
        higher_priority_task_woken: Option<&mut bool>,
    ) -> Result<(), PendCallError> {
        with_mock(|m| {
            if m.deferred.len() >= m.deferred_capacity {
                return Err(PendCallError::QueueOverflow);
            }
            m.deferred.push_back(call);
            Ok(())
        })?;
        if let Some(woken) = higher_priority_task_woken {
            *woken = true;
        }
        Ok(())
    }
}

unsafe impl PortAlloc for MockTraits {
    fn allocate(layout: Layout) -> Option<NonNull<u8>> {
        let permitted = with_mock(|m| match &mut m.heap_budget {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        });
        // Safety: `EventGroupCb` is not zero-sized
        permitted.then(|| NonNull::new(unsafe { std::alloc::alloc(layout) }))?
    }

    unsafe fn deallocate(ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

fn setup() {
    let _ = env_logger::try_init();
    with_mock(|m| {
        *m = MockState {
            started: true,
            deferred_capacity: 4,
            ..MockState::default()
        }
    });
}

/// Run `f` as the specified task.
fn as_task<R>(task: usize, f: impl FnOnce() -> R) -> R {
    let prev = with_mock(|m| std::mem::replace(&mut m.current, task));
    let ret = f();
    with_mock(|m| m.current = prev);
    ret
}

/// Queue a hook to run while a task is blocked.
fn push_hook(f: impl FnOnce() + 'static) {
    with_mock(|m| m.hooks.push_back(Box::new(f)));
}

/// Expire the timeout of a blocked task, as a port's timer handler would.
fn expire(task: usize) {
    with_mock(|m| m.suspend_nesting += 1);
    // Safety: We are holding the scheduler lock
    let expired = unsafe { expire_wait::<MockTraits>(TaskId(task)) };
    assert!(expired);
    with_mock(|m| {
        m.suspend_nesting -= 1;
        m.blocked[task] = None;
    });
}

fn is_blocked(task: usize) -> bool {
    with_mock(|m| m.blocked[task].is_some())
}

fn num_yields() -> usize {
    with_mock(|m| m.num_yields)
}

/// Execute the queued deferred calls as the consumer task.
fn run_deferred() {
    while let Some(call) = with_mock(|m| m.deferred.pop_front()) {
        as_task(NUM_TASKS - 1, || call.call());
    }
}

fn new_static_group() -> EventGroup<MockTraits> {
    EventGroup::new_static(Box::leak(Box::new(StaticEventGroup::new())))
}

const EMPTY: EventGroupWaitFlags = EventGroupWaitFlags::empty();
const ALL: EventGroupWaitFlags = EventGroupWaitFlags::ALL;
const CLEAR: EventGroupWaitFlags = EventGroupWaitFlags::CLEAR;

#[quickcheck]
fn wait_condition_all(current: u32, wanted: u32) -> bool {
    wait_condition_met(current, wanted, ALL) == (current & wanted == wanted)
        && wait_condition_met(current, wanted, ALL | CLEAR) == (current & wanted == wanted)
}

#[quickcheck]
fn wait_condition_any(current: u32, wanted: u32) -> bool {
    wait_condition_met(current, wanted, EMPTY) == (current & wanted != 0)
        && wait_condition_met(current, wanted, CLEAR) == (current & wanted != 0)
}

#[quickcheck]
fn clear_is_idempotent(initial: u32, mask: u32) {
    setup();
    let (initial, mask) = (
        initial & !EVENT_BITS_CONTROL_BYTES,
        mask & !EVENT_BITS_CONTROL_BYTES,
    );
    let eg = new_static_group();

    eg.set(initial);
    assert_eq!(eg.clear(mask), initial);
    let cleared = initial & !mask;
    assert_eq!(eg.clear(mask), cleared);
    assert_eq!(eg.get(), cleared);
    assert_eq!(num_yields(), 0);
}

#[test]
fn wait_all_with_clear_blocks_until_every_bit_is_set() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        assert_eq!(eg.set(0b001), 0b001);
        assert!(is_blocked(0));
    });
    push_hook(move || {
        // The waiter clears the bits as it wakes up
        assert_eq!(eg.set(0b010), 0b000);
        assert!(!is_blocked(0));
    });

    assert_eq!(eg.wait(0b011, ALL | CLEAR, WAIT_FOREVER), Ok(0b011));
    assert_eq!(eg.get(), 0b000);
    assert_eq!(eg.num_waiters(), 0);
}

#[test]
fn wait_any_wakes_up_on_any_bit() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        eg.set(0b1000);
    });

    assert_eq!(eg.wait(0b1100, EMPTY, WAIT_FOREVER), Ok(0b1000));
    assert_eq!(eg.get(), 0b1000);
}

#[test]
fn poll_unsatisfied_times_out_immediately() {
    setup();
    let eg = new_static_group();
    eg.set(0b100);

    assert_eq!(eg.wait(0b001, EMPTY, 0), Err(WaitTimeout { bits: 0b100 }));
    assert_eq!(eg.get(), 0b100);
    assert_eq!(num_yields(), 0);
}

#[test]
fn satisfied_wait_does_not_block() {
    setup();
    let eg = new_static_group();
    eg.set(0b0110);

    assert_eq!(eg.wait(0b0010, CLEAR, 10), Ok(0b0110));
    assert_eq!(eg.get(), 0b0100);
    assert_eq!(eg.wait(0b0100, ALL, WAIT_FOREVER), Ok(0b0100));
    assert_eq!(num_yields(), 0);
}

#[test]
fn wait_times_out() {
    setup();
    let eg = new_static_group();
    eg.set(0b100);

    assert_eq!(eg.wait(0b001, ALL, 5), Err(WaitTimeout { bits: 0b100 }));
    assert_eq!(eg.num_waiters(), 0);

    // The task can wait again
    push_hook(move || {
        eg.set(0b001);
    });
    assert_eq!(eg.wait(0b001, ALL, 5), Ok(0b101));
}

#[test]
fn timeout_racing_with_set_still_clears() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        // The timeout fires first, and then the bits are set before the
        // waiter gets to run
        expire(0);
        assert_eq!(eg.set(0b011), 0b011);
    });

    assert_eq!(eg.wait(0b011, ALL | CLEAR, 5), Err(WaitTimeout { bits: 0b011 }));
    assert_eq!(eg.get(), 0b000);
}

#[test]
fn timeout_racing_with_set_without_clear() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        expire(0);
        eg.set(0b010);
    });

    assert_eq!(eg.wait(0b011, EMPTY, 5), Err(WaitTimeout { bits: 0b010 }));
    assert_eq!(eg.get(), 0b010);
}

#[test]
fn set_wakes_up_all_matching_waiters_in_one_pass() {
    setup();
    let eg = new_static_group();

    // Task 1
    push_hook(move || {
        assert_eq!(eg.wait(0b01, EMPTY, WAIT_FOREVER), Ok(0b11));
    });
    // Task 2 (runs while tasks 0 and 1 are blocked)
    push_hook(move || {
        assert_eq!(eg.num_waiters(), 2);
        // Task 0's clearing doesn't prevent task 1 from waking up
        assert_eq!(eg.set(0b11), 0b10);
        assert!(!is_blocked(0));
        assert!(!is_blocked(1));
    });

    assert_eq!(eg.wait(0b01, CLEAR, WAIT_FOREVER), Ok(0b11));
    assert_eq!(eg.get(), 0b10);
    assert_eq!(eg.num_waiters(), 0);
}

#[test]
fn set_leaves_unsatisfied_waiters_queued() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        assert_eq!(eg.wait(0b100, EMPTY, WAIT_FOREVER), Ok(0b111));
    });
    push_hook(move || {
        eg.set(0b011);
        assert!(!is_blocked(0));
        assert!(is_blocked(1));
        assert_eq!(eg.num_waiters(), 1);
    });
    push_hook(move || {
        eg.set(0b100);
    });

    assert_eq!(eg.wait(0b011, ALL, WAIT_FOREVER), Ok(0b011));
    assert_eq!(eg.get(), 0b111);
}

#[test]
fn sync_satisfied_by_own_contribution() {
    setup();
    let eg = new_static_group();
    eg.set(0b110);

    assert_eq!(eg.sync(0b001, 0b011, 0), Ok(0b111));
    // The barrier bits are consumed
    assert_eq!(eg.get(), 0b100);
    assert_eq!(num_yields(), 0);
}

#[test]
fn sync_rendezvous_of_two_tasks() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        assert!(is_blocked(0));
        assert_eq!(eg.get(), 0b01);
        assert_eq!(eg.sync(0b10, 0b11, WAIT_FOREVER), Ok(0b11));
    });

    assert_eq!(eg.sync(0b01, 0b11, WAIT_FOREVER), Ok(0b11));
    assert_eq!(eg.get(), 0b00);
}

#[test]
fn sync_rendezvous_of_three_tasks() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        assert_eq!(eg.sync(0b010, 0b111, WAIT_FOREVER), Ok(0b111));
    });
    push_hook(move || {
        assert_eq!(eg.num_waiters(), 2);
        assert_eq!(eg.sync(0b100, 0b111, WAIT_FOREVER), Ok(0b111));
    });

    assert_eq!(eg.sync(0b001, 0b111, WAIT_FOREVER), Ok(0b111));
    assert_eq!(eg.get(), 0b000);
}

#[test]
fn sync_poll_keeps_contribution() {
    setup();
    let eg = new_static_group();

    assert_eq!(eg.sync(0b01, 0b11, 0), Err(WaitTimeout { bits: 0b01 }));
    assert_eq!(eg.get(), 0b01);
}

#[test]
fn sync_times_out() {
    setup();
    let eg = new_static_group();

    assert_eq!(eg.sync(0b01, 0b11, 3), Err(WaitTimeout { bits: 0b01 }));
    assert_eq!(eg.num_waiters(), 0);
}

#[test]
fn sync_timeout_racing_with_barrier() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        expire(0);
        eg.set(0b10);
    });

    assert_eq!(eg.sync(0b01, 0b11, 3), Err(WaitTimeout { bits: 0b11 }));
    assert_eq!(eg.get(), 0b00);
}

#[test]
fn delete_wakes_up_waiters_with_zero() {
    setup();
    let eg = EventGroup::<MockTraits>::new().unwrap();
    eg.set(0b1000);

    push_hook(move || {
        assert_eq!(eg.wait(0b0001, ALL, WAIT_FOREVER), Ok(0));
    });
    push_hook(move || {
        assert_eq!(eg.num_waiters(), 2);
        // Safety: Nobody touches `eg` after this
        unsafe { eg.delete() };
    });

    assert_eq!(eg.wait(0b0011, ALL | CLEAR, WAIT_FOREVER), Ok(0));
}

#[test]
fn delete_without_waiters() {
    setup();
    let eg = new_static_group();
    eg.set(0b1);
    // Safety: Nobody touches `eg` after this
    unsafe { eg.delete() };
    assert_eq!(num_yields(), 0);
}

#[test]
fn allocation_failure() {
    setup();
    with_mock(|m| m.heap_budget = Some(1));

    let eg = EventGroup::<MockTraits>::new().unwrap();
    assert_eq!(
        EventGroup::<MockTraits>::new().unwrap_err(),
        CreateEventGroupError::NoMemory
    );
    assert_eq!(
        ResultCode::from(CreateEventGroupError::NoMemory),
        ResultCode::NoMemory
    );

    // Safety: Nobody touches `eg` after this
    unsafe { eg.delete() };
}

#[test]
fn storage_provenance() {
    setup();
    let buffer = Box::leak(Box::new(StaticEventGroup::new()));
    let buffer_ptr = NonNull::from(&mut *buffer);
    let eg = EventGroup::<MockTraits>::new_static(buffer);
    assert!(eg.is_static());
    assert_eq!(eg.static_buffer(), Some(buffer_ptr));

    let eg = EventGroup::<MockTraits>::new().unwrap();
    assert!(!eg.is_static());
    assert_eq!(eg.static_buffer(), None);
    // Safety: Nobody touches `eg` after this
    unsafe { eg.delete() };
}

#[test]
fn diagnostic_number() {
    setup();
    let eg = new_static_group();
    assert_eq!(eg.number(), 0);
    eg.set_number(42);
    assert_eq!(eg.number(), 42);
}

#[test]
fn set_and_clear_from_isr_are_deferred() {
    setup();
    let eg = new_static_group();

    let mut woken = false;
    assert_eq!(eg.set_from_isr(0b110, Some(&mut woken)), Ok(()));
    assert!(woken);
    assert_eq!(eg.get_from_isr(), 0);

    run_deferred();
    assert_eq!(eg.get_from_isr(), 0b110);

    assert_eq!(eg.clear_from_isr(0b010), Ok(()));
    assert_eq!(eg.get_from_isr(), 0b110);

    run_deferred();
    assert_eq!(eg.get_from_isr(), 0b100);
    assert_eq!(with_mock(|m| m.isr_nesting), 0);
}

#[test]
fn deferred_queue_overflow() {
    setup();
    with_mock(|m| m.deferred_capacity = 2);
    let eg = new_static_group();

    assert_eq!(eg.set_from_isr(0b001, None), Ok(()));
    assert_eq!(eg.set_from_isr(0b010, None), Ok(()));
    assert_eq!(
        eg.set_from_isr(0b100, None),
        Err(PendCallError::QueueOverflow)
    );
    assert_eq!(
        ResultCode::from(eg.clear_from_isr(0b001)),
        ResultCode::QueueOverflow
    );

    run_deferred();
    assert_eq!(eg.get(), 0b011);
}

#[test]
fn deferred_set_wakes_up_waiter() {
    setup();
    let eg = new_static_group();

    push_hook(move || {
        eg.set_from_isr(0b100, None).unwrap();
        assert!(is_blocked(0));
        run_deferred();
    });

    assert_eq!(eg.wait(0b100, CLEAR, WAIT_FOREVER), Ok(0b100));
    assert_eq!(eg.get(), 0);
}

#[test]
fn poll_before_start() {
    setup();
    with_mock(|m| m.started = false);
    let eg = new_static_group();

    assert_eq!(eg.wait(0b1, ALL, 0), Err(WaitTimeout { bits: 0 }));
    assert_eq!(eg.sync(0b1, 0b1, 0), Ok(0b1));
}

#[test]
#[should_panic(expected = "can't block while the scheduler is not running")]
fn blocking_before_start() {
    setup();
    with_mock(|m| m.started = false);
    let eg = new_static_group();
    let _ = eg.wait(0b1, ALL, 10);
}

#[test]
#[should_panic(expected = "can't block while the scheduler is not running")]
fn blocking_while_suspended() {
    setup();
    let eg = new_static_group();
    let _lock = klock::suspend_all::<MockTraits>();
    let _ = eg.sync(0b1, 0b11, WAIT_FOREVER);
}

#[test]
#[should_panic(expected = "intersects the reserved bits")]
fn wait_for_reserved_bits() {
    setup();
    let _ = new_static_group().wait(0x0100_0000, EMPTY, 0);
}

#[test]
#[should_panic(expected = "waiting for an empty set of bits")]
fn wait_for_nothing() {
    setup();
    let _ = new_static_group().wait(0, ALL, 0);
}

#[test]
#[should_panic(expected = "intersects the reserved bits")]
fn set_reserved_bits() {
    setup();
    new_static_group().set(0x8000_0000);
}

#[test]
#[should_panic(expected = "intersects the reserved bits")]
fn clear_reserved_bits() {
    setup();
    new_static_group().clear(EVENT_BITS_CONTROL_BYTES);
}

#[test]
#[should_panic(expected = "intersects the reserved bits")]
fn sync_with_reserved_bits() {
    setup();
    let _ = new_static_group().sync(0x0200_0000, 0b1, 0);
}
