//! Blocking waits and set operations across real threads
use evgroup::{
    EventGroup, EventGroupWaitFlags as Flags, StaticEventGroup, WaitTimeout, WAIT_FOREVER,
};
use evgroup_port_std::{spawn_task, Task};
use std::time::{Duration, Instant};

evgroup_port_std::use_port!(unsafe struct SystemTraits);

fn setter(eg: EventGroup<SystemTraits>, bits: &'static [u32]) -> Task<SystemTraits> {
    spawn_task::<SystemTraits>("setter", move || {
        for &b in bits {
            eg.set(b);
        }
    })
}

#[test]
fn wait_all_is_not_lost() {
    let eg = EventGroup::<SystemTraits>::new().unwrap();

    let waiter = spawn_task::<SystemTraits>("waiter", move || {
        assert_eq!(eg.wait(0b11, Flags::ALL | Flags::CLEAR, WAIT_FOREVER), Ok(0b11));
    });
    waiter.wait_until_blocked();

    setter(eg, &[0b01, 0b10]).join();
    waiter.join();

    assert_eq!(eg.get(), 0);
    unsafe { eg.delete() };
}

#[test]
fn set_wakes_up_every_matching_waiter() {
    let eg = EventGroup::<SystemTraits>::new().unwrap();

    let waiters: Vec<_> = [0b001, 0b011, 0b101]
        .into_iter()
        .map(|mask| {
            spawn_task::<SystemTraits>("waiter", move || {
                assert_eq!(eg.wait(mask, Flags::empty(), WAIT_FOREVER), Ok(0b001));
            })
        })
        .collect();
    let bystander = spawn_task::<SystemTraits>("bystander", move || {
        assert_eq!(eg.wait(0b110, Flags::ALL, WAIT_FOREVER), Ok(0b111));
    });
    for waiter in &waiters {
        waiter.wait_until_blocked();
    }
    bystander.wait_until_blocked();

    setter(eg, &[0b001]).join();
    for waiter in waiters {
        waiter.join();
    }
    assert!(bystander.is_blocked());

    setter(eg, &[0b110]).join();
    bystander.join();

    assert_eq!(eg.get(), 0b111);
    unsafe { eg.delete() };
}

#[test]
fn wait_times_out() {
    let eg = EventGroup::<SystemTraits>::new().unwrap();

    spawn_task::<SystemTraits>("waiter", move || {
        let start = Instant::now();
        assert_eq!(
            eg.wait(0b1, Flags::ALL | Flags::CLEAR, 20),
            Err(WaitTimeout { bits: 0 })
        );
        assert!(start.elapsed() >= Duration::from_millis(20));

        assert_eq!(eg.wait(0b1, Flags::ALL, 0), Err(WaitTimeout { bits: 0 }));
    })
    .join();

    unsafe { eg.delete() };
}

#[test]
fn delete_releases_waiters() {
    let eg = EventGroup::<SystemTraits>::new().unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            spawn_task::<SystemTraits>("waiter", move || {
                assert_eq!(eg.wait(0b1000, Flags::ALL, WAIT_FOREVER), Ok(0));
            })
        })
        .collect();
    for waiter in &waiters {
        waiter.wait_until_blocked();
    }

    spawn_task::<SystemTraits>("deleter", move || unsafe { eg.delete() }).join();
    for waiter in waiters {
        waiter.join();
    }
}

#[test]
fn static_event_group() {
    let buffer = Box::leak(Box::new(StaticEventGroup::new()));
    let buffer_ptr = std::ptr::NonNull::from(&mut *buffer);
    let eg = EventGroup::<SystemTraits>::new_static(buffer);
    assert!(eg.is_static());
    assert_eq!(eg.static_buffer(), Some(buffer_ptr));

    let waiter = spawn_task::<SystemTraits>("waiter", move || {
        assert_eq!(eg.wait(0b10, Flags::CLEAR, WAIT_FOREVER), Ok(0b11));
    });
    waiter.wait_until_blocked();
    setter(eg, &[0b11]).join();
    waiter.join();

    assert_eq!(eg.get(), 0b01);
    unsafe { eg.delete() };
}
