// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted simulation environment.
//!
//! Time is virtual. The clock is a 16-bit simulated counter extended to the
//! full timestamp range by an `EpochTimer`, so clock wraps and epoch
//! rollovers happen as often as they would on a small microcontroller timer.
//! Time only moves when `idle` sleeps or when application code calls
//! `elapse` to stand in for doing work, and interrupts are delivered
//! synchronously at those points unless the caller is protected.
//!
//! Worker contexts are OS threads, but only one of them runs at a time: a
//! baton records which context may run, and `context_dispatch` hands it over
//! and waits to get it back. The context that starts the kernel is the idle
//! context.
//!
//! A fatal error reported on a worker context is carried back to the idle
//! context and raised there as a panic, so that it reaches the caller of
//! `run`. The worker is left parked.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

use abi::{ContextId, Ticks, Timestamp};
use epoch_timer::sim::SimulatedCounter;
use epoch_timer::{CompareCounter, EpochTimer};

use crate::env::{
    AlarmHandler, ContextEntry, Environment, EnvironmentClock,
    EnvironmentContext, EnvironmentCriticalSection,
};
use crate::fail::{Epitaph, Fatal};
use crate::profiling;

type Clock = EpochTimer<SimulatedCounter<16>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimEnv {
    clock: Mutex<Clock>,
    protected: AtomicBool,
    /// Time the interrupt being handled was raised.
    irq_time: Mutex<Option<Timestamp>>,
    alarm: OnceLock<&'static dyn AlarmHandler>,
    contexts: Mutex<Vec<Slot>>,
    baton: Arc<Baton>,
}

struct Slot {
    ctx: ContextId,
    entry: &'static dyn ContextEntry,
    started: bool,
}

struct Baton {
    state: Mutex<BatonState>,
    turn: Condvar,
}

struct BatonState {
    running: ContextId,
    failure: Option<Epitaph>,
}

impl Baton {
    fn running(&self) -> ContextId {
        lock(&self.state).running
    }

    fn wait_for(&self, me: ContextId) {
        let mut state = lock(&self.state);
        while state.running != me {
            state = self
                .turn
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Passes the baton from `me` to `to`, then waits for it to come back.
    fn hand_over(&self, me: ContextId, to: ContextId) {
        let failure = {
            let mut state = lock(&self.state);
            state.running = to;
            self.turn.notify_all();
            while state.running != me {
                state = self
                    .turn
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if me.is_idle() {
                state.failure.take()
            } else {
                None
            }
        };
        if let Some(epitaph) = failure {
            panic!("{}", epitaph.as_str());
        }
    }

    /// Records a failure on a worker context and wakes the idle context to
    /// report it.
    fn fail(&self, epitaph: Epitaph) {
        let mut state = lock(&self.state);
        state.failure = Some(epitaph);
        state.running = ContextId::IDLE;
        self.turn.notify_all();
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    pub fn new() -> Self {
        Self::starting_at(Timestamp::ZERO)
    }

    /// Creates an environment whose clock reads `now`, for exercising clock
    /// wraparound.
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            clock: Mutex::new(EpochTimer::new(SimulatedCounter::new(now.0), now)),
            protected: AtomicBool::new(true),
            irq_time: Mutex::new(None),
            alarm: OnceLock::new(),
            contexts: Mutex::new(Vec::new()),
            baton: Arc::new(Baton {
                state: Mutex::new(BatonState {
                    running: ContextId::IDLE,
                    failure: None,
                }),
                turn: Condvar::new(),
            }),
        }
    }

    /// The alarm time currently set, if any.
    pub fn alarm(&self) -> Option<Timestamp> {
        lock(&self.clock).alarm()
    }

    /// The context currently allowed to run.
    pub fn running(&self) -> ContextId {
        self.baton.running()
    }

    /// Lets `ticks` of virtual time pass, as if the caller were busy. Timer
    /// interrupts falling due meanwhile are delivered at their due times
    /// unless the caller is protected, in which case they wait.
    pub fn elapse(&self, ticks: Ticks) {
        let mut left = ticks.0;
        while left > 0 {
            left -= lock(&self.clock).counter_mut().advance(left);
            if !self.is_protected() {
                self.deliver();
            }
        }
    }

    /// Runs `isr` as an interrupt handler: protected, with the timestamp
    /// fixed at the time of entry.
    pub fn interrupt<R>(&self, isr: impl FnOnce() -> R) -> R {
        profiling::event_isr_enter();
        let was = self.protected.swap(true, Ordering::SeqCst);
        let now = self.timer_get();
        let outer = lock(&self.irq_time).replace(now);
        let r = isr();
        *lock(&self.irq_time) = outer;
        self.protected.store(was, Ordering::SeqCst);
        profiling::event_isr_exit();
        r
    }

    /// Services pending counter interrupts.
    fn deliver(&self) {
        loop {
            let fired = {
                let mut clock = lock(&self.clock);
                if clock.counter().overflow_pending() {
                    clock.on_overflow();
                    continue;
                }
                if !clock.counter().compare_pending() || self.alarm.get().is_none()
                {
                    return;
                }
                clock.on_compare()
            };
            if let Some(now) = fired {
                self.fire_alarm(now);
            }
        }
    }

    fn fire_alarm(&self, now: Timestamp) {
        let Some(&handler) = self.alarm.get() else {
            return;
        };
        let was = self.protected.swap(true, Ordering::SeqCst);
        let outer = lock(&self.irq_time).replace(now);
        handler.alarm(now);
        *lock(&self.irq_time) = outer;
        self.protected.store(was, Ordering::SeqCst);
    }

    /// Spawns the thread for `ctx` on its first dispatch.
    fn ensure_started(&self, ctx: ContextId) {
        if ctx.is_idle() {
            return;
        }
        let entry = {
            let mut contexts = lock(&self.contexts);
            match contexts.iter_mut().find(|s| s.ctx == ctx) {
                Some(slot) if slot.started => return,
                Some(slot) => {
                    slot.started = true;
                    Some(slot.entry)
                }
                None => None,
            }
        };
        let Some(entry) = entry else {
            self.panic(Fatal::Sanity("dispatch to uninitialized context"));
        };

        let baton = Arc::clone(&self.baton);
        let spawned = thread::Builder::new()
            .name(format!("context-{}", ctx.0))
            .spawn(move || {
                baton.wait_for(ctx);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    entry.enter(ctx);
                }));
                if let Err(payload) = outcome {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                        .unwrap_or("context panicked");
                    baton.fail(Epitaph::new(msg));
                }
            });
        if spawned.is_err() {
            self.panic(Fatal::OutOfThreads);
        }
    }
}

impl EnvironmentCriticalSection for SimEnv {
    fn protect(&self, on: bool) {
        self.protected.store(on, Ordering::SeqCst);
    }

    fn is_protected(&self) -> bool {
        self.protected.load(Ordering::SeqCst)
    }
}

impl EnvironmentClock for SimEnv {
    const TICK_HZ: u32 = 32_768;

    fn timer_start(&self, handler: &'static dyn AlarmHandler) {
        // Starting twice keeps the first handler.
        self.alarm.set(handler).ok();
    }

    fn timer_set(&self, alarm: Timestamp) {
        lock(&self.clock).set(alarm);
    }

    fn timer_get(&self) -> Timestamp {
        lock(&self.clock).now()
    }

    fn timestamp(&self) -> Timestamp {
        let irq_time = *lock(&self.irq_time);
        irq_time.unwrap_or_else(|| self.timer_get())
    }
}

impl EnvironmentContext for SimEnv {
    fn context_init(
        &self,
        ctx: ContextId,
        _stack_size: usize,
        entry: &'static dyn ContextEntry,
    ) {
        let mut contexts = lock(&self.contexts);
        contexts.retain(|s| s.ctx != ctx);
        contexts.push(Slot {
            ctx,
            entry,
            started: false,
        });
    }

    fn context_dispatch(&self, ctx: ContextId) {
        let me = self.baton.running();
        if me == ctx {
            return;
        }
        self.ensure_started(ctx);
        // Interrupt time belongs to the context that took the interrupt.
        let irq_time = lock(&self.irq_time).take();
        self.baton.hand_over(me, ctx);
        *lock(&self.irq_time) = irq_time;
    }
}

impl Environment for SimEnv {
    fn init(&self) {
        self.protect(true);
    }

    fn panic(&self, fatal: Fatal) -> ! {
        let epitaph = Epitaph::new(fatal);
        if self.baton.running().is_idle() {
            panic!("{}", epitaph.as_str());
        }
        self.baton.fail(epitaph);
        loop {
            thread::park();
        }
    }

    /// Sleeps until the next timer interrupt and delivers it, for as long as
    /// an alarm is set. Returns once nothing is left to wait for.
    fn idle(&self) {
        self.protect(false);
        self.deliver();
        loop {
            {
                let mut clock = lock(&self.clock);
                if !clock.is_armed() {
                    break;
                }
                clock.counter_mut().advance(u32::MAX);
            }
            self.deliver();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Mutex<Vec<Timestamp>>);

    impl AlarmHandler for Recorder {
        fn alarm(&'static self, now: Timestamp) {
            lock(&self.0).push(now);
        }
    }

    fn recorder() -> &'static Recorder {
        Box::leak(Box::new(Recorder(Mutex::new(Vec::new()))))
    }

    #[test]
    fn idle_sleeps_until_alarm() {
        let env = SimEnv::new();
        let rec = recorder();
        env.timer_start(rec);
        env.timer_set(Timestamp(1_000));
        env.idle();
        assert_eq!(*lock(&rec.0), [Timestamp(1_000)]);
        assert_eq!(env.timer_get(), Timestamp(1_000));
    }

    #[test]
    fn alarm_across_clock_wrap() {
        let env = SimEnv::starting_at(Timestamp(0xFFFF_FF00));
        let rec = recorder();
        env.timer_start(rec);
        env.timer_set(Timestamp(0x100));
        env.idle();
        assert_eq!(*lock(&rec.0), [Timestamp(0x100)]);
    }

    #[test]
    fn protected_elapse_defers_delivery() {
        let env = SimEnv::new();
        let rec = recorder();
        env.timer_start(rec);
        env.timer_set(Timestamp(10));
        env.elapse(Ticks(20));
        assert!(lock(&rec.0).is_empty());

        env.protect(false);
        env.elapse(Ticks(1));
        assert_eq!(*lock(&rec.0), [Timestamp(21)]);
    }

    #[test]
    fn unprotected_elapse_delivers_on_time() {
        let env = SimEnv::new();
        let rec = recorder();
        env.timer_start(rec);
        env.protect(false);
        env.timer_set(Timestamp(70_000));
        env.elapse(Ticks(100_000));
        assert_eq!(*lock(&rec.0), [Timestamp(70_000)]);
        assert_eq!(env.timer_get(), Timestamp(100_000));
    }

    #[test]
    fn timestamp_is_fixed_inside_interrupt() {
        let env = SimEnv::new();
        env.elapse(Ticks(5));
        let seen = env.interrupt(|| {
            env.elapse(Ticks(3));
            env.timestamp()
        });
        assert_eq!(seen, Timestamp(5));
        assert_eq!(env.timestamp(), Timestamp(8));
    }

    struct Stamper {
        env: &'static SimEnv,
        seen: Mutex<Option<Timestamp>>,
    }

    impl ContextEntry for Stamper {
        fn enter(&'static self, _ctx: ContextId) -> ! {
            *lock(&self.seen) = Some(self.env.timestamp());
            self.env.context_dispatch(ContextId::IDLE);
            loop {
                thread::park();
            }
        }
    }

    #[test]
    fn context_dispatched_from_interrupt_reads_current_time() {
        let env: &'static SimEnv = Box::leak(Box::new(SimEnv::new()));
        let stamper = Box::leak(Box::new(Stamper {
            env,
            seen: Mutex::new(None),
        }));
        env.context_init(ContextId(0), 0, stamper);
        env.elapse(Ticks(5));
        env.interrupt(|| {
            env.elapse(Ticks(3));
            env.context_dispatch(ContextId(0));
            assert_eq!(env.timestamp(), Timestamp(5));
        });
        assert_eq!(*lock(&stamper.seen), Some(Timestamp(8)));
    }

    #[test]
    #[should_panic(expected = "out of messages")]
    fn panic_on_idle_context_unwinds() {
        SimEnv::new().panic(Fatal::OutOfMessages);
    }
}
