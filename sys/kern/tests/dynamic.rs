// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end behavior of the dynamic kernel in the hosted simulation.

use std::sync::Mutex;

use kern::arch::SimEnv;
use kern::dynamic::Kernel;
use kern::env::EnvironmentClock;
use kern::trace::Event;
use kern::{
    Args, ContextId, ObjectId, Receipt, Reflex, ResultCode, Ticks, Timestamp,
    NO_ARGS,
};

type K = Kernel<SimEnv>;

fn kernel_at(now: Timestamp) -> &'static K {
    let k: &'static K = Box::leak(Box::new(Kernel::new(SimEnv::starting_at(now))));
    k.init();
    k
}

fn kernel() -> &'static K {
    kernel_at(Timestamp::ZERO)
}

fn events(k: &K) -> Vec<Event> {
    k.with_state(|s| s.trace.events().collect())
}

#[test]
fn earliest_deadline_runs_first() {
    static LOG: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    fn note(_: &'static K, _: ObjectId, args: &Args) -> ResultCode {
        LOG.lock().unwrap().push(args.as_bytes()[0]);
        ResultCode::OK
    }

    let k = kernel();
    for (i, (bl, dl)) in [(0, 10), (1, 5), (2, 3)].into_iter().enumerate() {
        let i = i as u8;
        k.after_before(Ticks(bl), Ticks(dl), ObjectId(i), note, &[i]);
    }
    // Let every baseline pass before the kernel starts looking.
    k.env().elapse(Ticks(3));
    k.run();

    assert_eq!(*LOG.lock().unwrap(), [2, 1, 0]);
    let dispatched = events(k)
        .into_iter()
        .filter(|e| matches!(e, Event::Dispatched { .. }))
        .count();
    assert_eq!(dispatched, 3);
    k.with_state(|s| s.check()).unwrap();
}

#[test]
fn baseline_gates_start() {
    static LOG: Mutex<Vec<Timestamp>> = Mutex::new(Vec::new());
    fn stamp(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push(k.env().timer_get());
        ResultCode::OK
    }

    let k = kernel();
    k.after(Ticks(100), ObjectId(0), stamp, NO_ARGS);
    k.after(Ticks(40), ObjectId(1), stamp, NO_ARGS);
    k.run();
    assert_eq!(*LOG.lock().unwrap(), [Timestamp(40), Timestamp(100)]);
}

#[test]
fn cancel_withdraws_once() {
    static LOG: Mutex<Vec<Timestamp>> = Mutex::new(Vec::new());
    fn stamp(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push(k.env().timer_get());
        ResultCode::OK
    }

    let k = kernel();
    let mut early = k.after_with_receipt(Ticks(50), ObjectId(0), stamp, NO_ARGS);
    k.after(Ticks(60), ObjectId(0), stamp, NO_ARGS);

    assert!(k.cancel(&mut early));
    assert!(early.is_empty());
    assert!(!k.cancel(&mut early), "second cancel is a no-op");
    assert!(!k.cancel(&mut Receipt::new()));
    assert_eq!(k.env().alarm(), Some(Timestamp(60)), "alarm follows new head");

    k.run();
    assert_eq!(*LOG.lock().unwrap(), [Timestamp(60)]);
}

#[test]
fn cancelling_last_waiting_message_pulls_alarm_in() {
    fn never(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        panic!("cancelled message ran");
    }

    let k = kernel();
    k.env().elapse(Ticks(5));
    let mut r = k.after_with_receipt(Ticks(1_000), ObjectId(0), never, NO_ARGS);
    assert!(k.cancel(&mut r));
    assert_eq!(k.env().alarm(), Some(Timestamp(5)));
    k.run();
}

#[test]
fn started_message_cannot_be_cancelled() {
    static RECEIPT: Mutex<Receipt> = Mutex::new(Receipt::new());
    static LOG: Mutex<Vec<bool>> = Mutex::new(Vec::new());
    fn try_cancel_self(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        let cancelled = k.cancel(&mut RECEIPT.lock().unwrap());
        LOG.lock().unwrap().push(cancelled);
        ResultCode::OK
    }

    let k = kernel();
    *RECEIPT.lock().unwrap() =
        k.after_with_receipt(Ticks(10), ObjectId(0), try_cancel_self, NO_ARGS);
    k.run();
    assert_eq!(*LOG.lock().unwrap(), [false]);
}

#[test]
fn ordering_survives_clock_wrap() {
    static LOG: Mutex<Vec<Timestamp>> = Mutex::new(Vec::new());
    fn stamp(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push(k.env().timer_get());
        ResultCode::OK
    }

    let k = kernel_at(Timestamp(0xFFFF_FFF0));
    k.after(Ticks(0x20), ObjectId(0), stamp, NO_ARGS);
    k.after(Ticks(0x08), ObjectId(1), stamp, NO_ARGS);
    k.run();
    assert_eq!(
        *LOG.lock().unwrap(),
        [Timestamp(0xFFFF_FFF8), Timestamp(0x10)]
    );
}

#[test]
fn urgent_message_preempts() {
    static LOG: Mutex<Vec<&str>> = Mutex::new(Vec::new());
    fn slow(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push("slow start");
        k.env().elapse(Ticks(20));
        LOG.lock().unwrap().push("slow end");
        ResultCode::OK
    }
    fn fast(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push("fast");
        ResultCode::OK
    }

    let k = kernel();
    k.before(Ticks(100), ObjectId(0), slow, NO_ARGS);
    k.after_before(Ticks(10), Ticks(5), ObjectId(1), fast, NO_ARGS);
    k.run();

    assert_eq!(*LOG.lock().unwrap(), ["slow start", "fast", "slow end"]);
    assert!(events(k).contains(&Event::Switched {
        from: ContextId(0),
        to: ContextId(1)
    }));
    k.with_state(|s| s.check()).unwrap();
}

#[test]
fn later_deadline_waits_its_turn() {
    static LOG: Mutex<Vec<&str>> = Mutex::new(Vec::new());
    fn slow(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push("slow start");
        k.env().elapse(Ticks(20));
        LOG.lock().unwrap().push("slow end");
        ResultCode::OK
    }
    fn lax(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push("lax");
        ResultCode::OK
    }

    let k = kernel();
    k.before(Ticks(30), ObjectId(0), slow, NO_ARGS);
    k.after_before(Ticks(10), Ticks(100), ObjectId(1), lax, NO_ARGS);
    k.run();
    assert_eq!(*LOG.lock().unwrap(), ["slow start", "slow end", "lax"]);
}

#[test]
fn contended_object_runs_owner_first() {
    static LOG: Mutex<Vec<&str>> = Mutex::new(Vec::new());
    fn slow(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push("slow start");
        k.env().elapse(Ticks(20));
        LOG.lock().unwrap().push("slow end");
        ResultCode::OK
    }
    fn fast(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push("fast");
        ResultCode::OK
    }

    let shared = ObjectId(0);
    let k = kernel();
    k.before(Ticks(100), shared, slow, NO_ARGS);
    k.after_before(Ticks(10), Ticks(5), shared, fast, NO_ARGS);
    k.run();

    assert_eq!(*LOG.lock().unwrap(), ["slow start", "slow end", "fast"]);
    let ev = events(k);
    assert!(ev.contains(&Event::Blocked {
        context: ContextId(1),
        on: shared
    }));
    assert!(ev.contains(&Event::Unblocked {
        context: ContextId(1),
        on: shared
    }));
    k.with_state(|s| {
        assert_eq!(s.owner(shared), None);
        s.check()
    })
    .unwrap();
}

#[test]
fn blocked_chain_runs_innermost_owner() {
    static LOG: Mutex<Vec<&str>> = Mutex::new(Vec::new());
    const A: ObjectId = ObjectId(0);
    const B: ObjectId = ObjectId(1);
    fn log(s: &'static str) {
        LOG.lock().unwrap().push(s);
    }
    fn low(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        log("low start");
        k.env().elapse(Ticks(30));
        log("low end");
        ResultCode::OK
    }
    fn mid_in_a(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        log("mid in a");
        ResultCode::OK
    }
    // Holds B, then wants A from `low`.
    fn mid(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        log("mid start");
        k.request(A, mid_in_a, NO_ARGS);
        log("mid end");
        ResultCode::OK
    }
    // Wants B from `mid`.
    fn high(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        log("high");
        ResultCode::OK
    }

    let k = kernel();
    k.before(Ticks(100), A, low, NO_ARGS);
    k.after_before(Ticks(10), Ticks(50), B, mid, NO_ARGS);
    k.after_before(Ticks(20), Ticks(5), B, high, NO_ARGS);
    k.run();

    assert_eq!(
        *LOG.lock().unwrap(),
        ["low start", "mid start", "low end", "mid in a", "mid end", "high"]
    );
    let unblocked: Vec<_> = events(k)
        .into_iter()
        .filter(|e| matches!(e, Event::Unblocked { .. }))
        .collect();
    assert_eq!(
        unblocked,
        [
            Event::Unblocked {
                context: ContextId(1),
                on: A
            },
            Event::Unblocked {
                context: ContextId(2),
                on: B
            },
        ]
    );
    k.with_state(|s| {
        assert_eq!(s.owner(A), None);
        assert_eq!(s.owner(B), None);
        s.check()
    })
    .unwrap();
}

#[test]
fn request_returns_method_result() {
    static LOG: Mutex<Vec<i32>> = Mutex::new(Vec::new());
    fn double(_: &'static K, _: ObjectId, args: &Args) -> ResultCode {
        ResultCode(2 * i32::from(args.as_bytes()[0]))
    }
    fn caller(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        let r = k.request(ObjectId(1), double, &[21]);
        LOG.lock().unwrap().push(r.0);
        ResultCode::OK
    }

    let k = kernel();
    k.async_call(ObjectId(0), caller, NO_ARGS);
    k.run();
    assert_eq!(*LOG.lock().unwrap(), [42]);
}

#[test]
fn posts_count_from_senders_baseline() {
    static LOG: Mutex<Vec<Timestamp>> = Mutex::new(Vec::new());
    fn tick(k: &'static K, to: ObjectId, _: &Args) -> ResultCode {
        let mut log = LOG.lock().unwrap();
        log.push(k.env().timer_get());
        let n = log.len();
        drop(log);
        // Take a while; the next period still counts from this one's start.
        k.env().elapse(Ticks(7));
        if n < 3 {
            k.after(Ticks(100), to, tick, NO_ARGS);
        }
        ResultCode::OK
    }

    let k = kernel();
    k.after(Ticks(100), ObjectId(0), tick, NO_ARGS);
    k.run();
    assert_eq!(
        *LOG.lock().unwrap(),
        [Timestamp(100), Timestamp(200), Timestamp(300)]
    );
}

#[test]
fn baseline_never_falls_behind_now() {
    static LOG: Mutex<Vec<Timestamp>> = Mutex::new(Vec::new());
    fn late(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push(k.env().timer_get());
        ResultCode::OK
    }
    fn overrun(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        k.env().elapse(Ticks(50));
        k.after(Ticks(10), ObjectId(1), late, NO_ARGS);
        k.with_state(|s| {
            let m = s.messages.peek(kern::msg::Queue::Active).unwrap();
            assert_eq!(m.baseline, Timestamp(51));
        });
        ResultCode::OK
    }

    let k = kernel();
    k.async_call(ObjectId(0), overrun, NO_ARGS);
    k.run();
    assert_eq!(*LOG.lock().unwrap(), [Timestamp(51)]);
}

#[test]
fn interrupt_posts_from_its_timestamp() {
    static LOG: Mutex<Vec<(&str, Timestamp)>> = Mutex::new(Vec::new());
    fn button(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        LOG.lock().unwrap().push(("button", k.env().timer_get()));
        ResultCode::OK
    }
    fn busy(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        k.env().elapse(Ticks(5));
        k.env().interrupt(|| {
            k.before(Ticks(2), ObjectId(1), button, NO_ARGS);
            k.schedule();
        });
        LOG.lock().unwrap().push(("busy", k.env().timer_get()));
        ResultCode::OK
    }

    let k = kernel();
    k.before(Ticks(1_000), ObjectId(0), busy, NO_ARGS);
    k.run();
    assert_eq!(
        *LOG.lock().unwrap(),
        [("button", Timestamp(6)), ("busy", Timestamp(6))]
    );
}

#[test]
#[should_panic(expected = "deadlock")]
fn lock_cycle_is_fatal() {
    const A: ObjectId = ObjectId(0);
    const B: ObjectId = ObjectId(1);
    fn noop(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        ResultCode::OK
    }
    // Holds A, then wants B.
    fn first(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        k.env().elapse(Ticks(10));
        k.request(B, noop, NO_ARGS)
    }
    // Holds B, then wants A.
    fn second(k: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        k.request(A, noop, NO_ARGS)
    }

    let k = kernel();
    k.before(Ticks(100), A, first, NO_ARGS);
    k.after_before(Ticks(5), Ticks(1), B, second, NO_ARGS);
    k.run();
}

#[test]
#[should_panic(expected = "out of threads")]
fn preemption_deeper_than_context_pool_is_fatal() {
    fn dive(k: &'static K, _: ObjectId, args: &Args) -> ResultCode {
        let depth = args.as_bytes()[0];
        let next = depth + 1;
        k.before(
            Ticks(100 - u32::from(next)),
            ObjectId(next),
            dive,
            &[next],
        );
        k.schedule();
        ResultCode::OK
    }

    let k = kernel();
    k.before(Ticks(100), ObjectId(0), dive, &[0]);
    k.run();
}

#[test]
#[should_panic(expected = "out of messages")]
fn message_pool_exhaustion_is_fatal() {
    fn noop(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        ResultCode::OK
    }

    let k = kernel();
    for _ in 0..=kern::NUM_MESSAGES {
        k.after(Ticks(10), ObjectId(0), noop, NO_ARGS);
    }
}

#[test]
#[should_panic(expected = "exceeds")]
fn oversized_argument_is_fatal() {
    fn noop(_: &'static K, _: ObjectId, _: &Args) -> ResultCode {
        ResultCode::OK
    }

    let k = kernel();
    k.async_call(ObjectId(0), noop, &[0; kern::ARGS_SIZE + 1]);
}
