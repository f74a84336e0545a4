// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SRP kernel: earliest-deadline-first scheduling under the stack
//! resource policy, on a single stack.
//!
//! Messages run to completion as nested calls on the caller's stack, most
//! recently started first, tracked by the pool's `running` queue. A message
//! is admitted only if
//!
//! - nothing is running, or
//! - none of the resources its object may end up holding (its requirement
//!   closure, see `ceiling`) is currently held, and its deadline is strictly
//!   earlier than that of the message on top of `running`.
//!
//! Admission guarantees that every request made while a message runs finds
//! its object free, so requests never wait. A request that does find its
//! object held means the object table under-declares requirements, and is
//! fatal.

use abi::{ObjectId, ResourceSet, ResultCode, Ticks, Timestamp};

use crate::api::{Method, Reflex};
use crate::args::Args;
use crate::ceiling::{close_requirements, ObjectDecl};
use crate::cell::StateCell;
use crate::env::{AlarmHandler, Environment};
use crate::fail::Fatal;
use crate::msg::{Job, MessagePool, Queue, Receipt};
use crate::profiling;
use crate::startup::Start;
use crate::trace::{trace, Event, Trace};
use crate::{NUM_MESSAGES, NUM_OBJECTS, TRACE_DEPTH};

/// Scheduler state of the SRP kernel.
pub struct SrpState<M> {
    pub messages: MessagePool<M, NUM_MESSAGES>,
    closures: [ResourceSet; NUM_OBJECTS],
    objects: usize,
    in_use: ResourceSet,
    pub trace: Trace<TRACE_DEPTH>,
}

impl<M: Copy> Default for SrpState<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Copy> SrpState<M> {
    pub fn new() -> Self {
        Self {
            messages: MessagePool::new(),
            closures: [ResourceSet::EMPTY; NUM_OBJECTS],
            objects: 0,
            in_use: ResourceSet::EMPTY,
            trace: Trace::new(),
        }
    }

    /// Loads the object table.
    pub fn load(&mut self, decls: &[ObjectDecl]) -> Result<(), Fatal> {
        close_requirements(decls, &mut self.closures)?;
        self.objects = decls.len();
        Ok(())
    }

    /// Requirement closure of `obj`.
    pub fn closure(&self, obj: ObjectId) -> Result<ResourceSet, Fatal> {
        if obj.index() >= self.objects {
            return Err(Fatal::UnknownObject(obj));
        }
        Ok(self.closures[obj.index()])
    }

    /// Resources held by requests in progress.
    pub fn in_use(&self) -> ResourceSet {
        self.in_use
    }

    /// Baseline of the innermost running message.
    pub fn running_baseline(&self) -> Option<Timestamp> {
        self.messages.peek(Queue::Running).map(|m| m.baseline)
    }

    /// Applies the admission test to the head of `active`. If it passes, the
    /// message moves onto `running` and is returned to be run.
    pub fn admit(&mut self) -> Result<Option<Job<M>>, Fatal> {
        let Some(head) = self.messages.peek(Queue::Active) else {
            return Ok(None);
        };
        let (to, deadline) = (head.to, head.deadline);

        if let Some(top) = self.messages.peek(Queue::Running) {
            if !self.in_use.is_disjoint(self.closure(to)?) {
                return Ok(None);
            }
            if !deadline.is_before(top.deadline) {
                return Ok(None);
            }
        }

        let idx = self
            .messages
            .dequeue(Queue::Active)
            .ok_or(Fatal::Sanity("active head vanished"))?;
        self.messages.push_running(idx);
        trace!(self.trace, Event::Dispatched { msg: idx, to });
        self.messages.job(idx).map(Some)
    }

    /// Takes `obj`'s resource for a request.
    pub fn acquire(&mut self, obj: ObjectId) -> Result<(), Fatal> {
        self.closure(obj)?;
        if self.in_use.contains(obj) {
            return Err(Fatal::ResourceBusy(obj));
        }
        self.in_use.insert(ResourceSet::of(obj));
        Ok(())
    }

    /// Gives back `obj`'s resource. If the request was the one made on
    /// behalf of the innermost running message, that message is done and is
    /// retired; returns whether it was.
    pub fn release(&mut self, obj: ObjectId) -> Result<bool, Fatal> {
        if !self.in_use.contains(obj) {
            return Err(Fatal::Sanity("releasing a resource not held"));
        }
        self.in_use.remove(ResourceSet::of(obj));

        match self.messages.peek(Queue::Running) {
            Some(m) if m.to == obj => {
                if let Some(idx) = self.messages.pop_running() {
                    self.messages.release(idx);
                    trace!(self.trace, Event::Retired(idx));
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// An SRP kernel running in environment `E`, over a static object table.
pub struct SrpKernel<E: 'static> {
    env: E,
    objects: &'static [ObjectDecl],
    state: StateCell<SrpState<Method<SrpKernel<E>>>>,
}

impl<E> SrpKernel<E>
where
    E: Environment + Sync + 'static,
{
    pub fn new(env: E, objects: &'static [ObjectDecl]) -> Self {
        Self {
            env,
            objects,
            state: StateCell::new(SrpState::new()),
        }
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Runs `body` with the scheduler state, for inspection.
    pub fn with_state<R>(
        &self,
        body: impl FnOnce(&mut SrpState<Method<Self>>) -> R,
    ) -> R {
        self.state.with(body)
    }

    fn check<T>(&self, r: Result<T, Fatal>) -> T {
        match r {
            Ok(v) => v,
            Err(fatal) => self.env.panic(fatal),
        }
    }

    /// Brings up the environment and computes the resource requirements of
    /// the object table.
    pub fn init(&'static self) {
        self.env.init();
        let loaded = self.state.with(|s| s.load(self.objects));
        self.check(loaded);
    }

    /// Points the alarm at anything posted during initialization, starts the
    /// clock and idles.
    pub fn run(&'static self) {
        let due = self
            .state
            .with(|s| s.messages.peek(Queue::Active).map(|m| m.baseline));
        if let Some(t) = due {
            self.env.timer_set(t);
        }
        self.env.timer_start(self);
        self.env.idle();
    }

    /// Promotes every message due at `now`, and re-arms the alarm for the
    /// next one. Returns whether the head of `active` changed.
    pub fn expired(&self, now: Timestamp) -> bool {
        let (changed, next) = self.state.with(|s| {
            trace!(s.trace, Event::Expired(now));
            let changed = s.messages.expire(now);
            (changed, s.messages.peek(Queue::Inactive).map(|m| m.baseline))
        });
        if let Some(t) = next {
            self.env.timer_set(t);
        }
        changed
    }

    /// Runs admissible messages until the head of `active` fails admission.
    /// Must be called protected.
    fn dispatch(&'static self) {
        loop {
            let job = self.state.with(|s| s.admit());
            let Some(job) = self.check(job) else {
                return;
            };
            profiling::event_dispatch(job.msg);
            self.env.protect(false);
            self.call(job.to, job.method, &job.args, true);
            self.env.protect(true);
        }
    }

    /// Makes a request. `root` marks the request that runs a message; its
    /// caller goes on dispatching, so it does not.
    fn call(
        &'static self,
        to: ObjectId,
        method: Method<Self>,
        args: &Args,
        root: bool,
    ) -> ResultCode {
        let was = self.env.is_protected();
        self.env.protect(true);
        let acquired = self.state.with(|s| s.acquire(to));
        self.check(acquired);

        self.env.protect(was);
        let result = method(self, to, args);
        self.env.protect(true);

        let released = self.state.with(|s| s.release(to));
        self.check(released);
        if !root {
            self.dispatch();
        }
        self.env.protect(was);
        result
    }
}

impl<E> Reflex for SrpKernel<E>
where
    E: Environment + Sync + 'static,
{
    fn action_with_receipt(
        &'static self,
        bl: Ticks,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> Receipt {
        let args = self.check(Args::copy_from(args));
        let protected = self.env.is_protected();
        self.env.protect(true);
        let now = self.env.timer_get();
        let timestamp = self.env.timestamp();

        let posted = self.state.with(|s| {
            s.closure(to)?;
            let base = match s.running_baseline() {
                Some(b) if !protected => b,
                _ => timestamp,
            };
            let p = s.messages.post(base, now, bl, dl, to, method, args)?;
            let m = s.messages.get(p.index);
            trace!(
                s.trace,
                Event::Posted {
                    msg: p.index,
                    to,
                    baseline: m.baseline,
                    deadline: m.deadline,
                }
            );
            Ok((s.messages.id(p.index), p.alarm))
        });
        let (id, alarm) = self.check(posted);
        if let Some(t) = alarm {
            self.env.timer_set(t);
        }
        self.env.protect(protected);
        Receipt::linked(id)
    }

    fn request(
        &'static self,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> ResultCode {
        let args = self.check(Args::copy_from(args));
        self.call(to, method, &args, false)
    }

    fn cancel(&self, receipt: &mut Receipt) -> bool {
        let Some(id) = receipt.take() else {
            return false;
        };
        let was = self.env.is_protected();
        self.env.protect(true);
        let r = self.state.with(|s| {
            let outcome = s.messages.cancel(id)?;
            if outcome.is_some() {
                trace!(s.trace, Event::Cancelled(id.index()));
            }
            Ok((outcome, s.messages.peek(Queue::Inactive).map(|m| m.baseline)))
        });
        let (outcome, next) = self.check(r);
        if let (Some(true), Some(t)) = (outcome, next) {
            self.env.timer_set(t);
        }
        self.env.protect(was);
        outcome.is_some()
    }

    fn schedule(&'static self) {
        let was = self.env.is_protected();
        self.env.protect(true);
        self.dispatch();
        self.env.protect(was);
    }
}

impl<E> AlarmHandler for SrpKernel<E>
where
    E: Environment + Sync + 'static,
{
    fn alarm(&'static self, now: Timestamp) {
        profiling::event_alarm_enter();
        self.expired(now);
        profiling::event_alarm_exit();
        self.schedule();
    }
}

impl<E> Start for SrpKernel<E>
where
    E: Environment + Sync + 'static,
{
    fn init(&'static self) {
        SrpKernel::init(self)
    }

    fn run(&'static self) {
        SrpKernel::run(self)
    }
}
