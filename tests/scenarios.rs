use costep::{CothreadState, Group, Message, SendError, MIN_STK_CAP, MIN_STK_NUM};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn factorial(n: usize) -> f64 {
    (1..=n).fold(1.0, |acc, x| acc * x as f64)
}

/// Yields `factorial(0) .. factorial(n-1)` one at a time, then exits.
fn counter_entry(me: &costep::Cothread, first: Message) {
    let n = first.into_usize();
    for i in 0..n {
        let f = factorial(i);
        me.r#yield(Message::from_raw(f.to_bits()));
    }
}

#[test]
fn s1_producer_consumer_factorial_yield() {
    init_logging();
    let group = Group::create(MIN_STK_NUM, MIN_STK_CAP);
    let main = group.main();
    let producer = main.create(counter_entry, false);

    let mut replies = Vec::new();
    loop {
        match main.send(&producer, Message::from_usize(100)) {
            Ok(reply) => replies.push(f64::from_bits(reply.into_raw())),
            Err(SendError::Closed) => break,
        }
    }

    assert_eq!(replies.len(), 100);
    assert_eq!(replies[0], 1.0);
    assert_eq!(replies[1], 1.0);
    assert_eq!(replies[5], 120.0);
    assert_eq!(producer.state(), CothreadState::Exited);

    producer.destroy();
    group.destroy();
}

/// Spawns a child alternating light-weight and heavy storage, sends it one
/// less than its own count, and tears it down once the send completes.
fn recursive_entry(me: &costep::Cothread, first: Message) {
    let n = first.into_usize();
    if n > 0 {
        let light = n % 2 == 1;
        let child = me.create(recursive_entry, light);
        let _ = me.send(&child, Message::from_usize(n - 1));
        child.destroy();
    }
}

#[test]
fn s2_recursive_spawn_alternating_modes() {
    init_logging();
    let group = Group::create(MIN_STK_NUM, MIN_STK_CAP);
    let main = group.main();
    let root = main.create(recursive_entry, false);

    let result = main.send(&root, Message::from_usize(1000));

    assert_eq!(result, Err(SendError::Closed));
    assert_eq!(root.state(), CothreadState::Exited);

    root.destroy();
    group.destroy();
}

fn immediate_exit_entry(_me: &costep::Cothread, _first: Message) {}

#[test]
fn s3_send_to_exited_is_reported_not_fatal() {
    init_logging();
    let group = Group::create(MIN_STK_NUM, MIN_STK_CAP);
    let main = group.main();
    let child = main.create(immediate_exit_entry, true);

    assert_eq!(main.send(&child, Message::NONE), Err(SendError::Closed));
    assert_eq!(child.state(), CothreadState::Exited);
    // A second send to the same already-exited target must also be reported,
    // not panic, and must not attempt another switch.
    assert_eq!(main.send(&child, Message::NONE), Err(SendError::Closed));

    child.destroy();
    group.destroy();
}

#[test]
#[should_panic(expected = "cannot send across cothread groups")]
fn s4_cross_group_send_is_fatal() {
    init_logging();
    let group1 = Group::create(MIN_STK_NUM, MIN_STK_CAP);
    let group2 = Group::create(MIN_STK_NUM, MIN_STK_CAP);
    let main1 = group1.main();
    let main2 = group2.main();
    let child2 = main2.create(immediate_exit_entry, true);

    let _ = main1.send(&child2, Message::NONE);
}

#[test]
fn reply_and_yield_are_distinct_states_for_identical_transitions() {
    init_logging();
    let group = Group::create(MIN_STK_NUM, MIN_STK_CAP);
    let main = group.main();

    fn yielder(me: &costep::Cothread, first: Message) {
        me.r#yield(first);
    }
    fn replier(me: &costep::Cothread, first: Message) {
        me.reply(first);
    }

    let a = main.create(yielder, true);
    let b = main.create(replier, true);

    main.send(&a, Message::NONE).unwrap();
    main.send(&b, Message::NONE).unwrap();

    assert_eq!(a.state(), CothreadState::Yielding);
    assert_eq!(b.state(), CothreadState::Replying);

    // Let both finish (fall off the end) so they can be cleanly destroyed.
    main.send(&a, Message::NONE).unwrap_err();
    main.send(&b, Message::NONE).unwrap_err();

    a.destroy();
    b.destroy();
    group.destroy();
}
