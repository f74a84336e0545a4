// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot alarms on a narrow hardware counter.
//!
//! Most of the timers we run the kernel on are 16 bits wide, while kernel time
//! is 32 bits. `EpochTimer` bridges the two:
//!
//! - The hardware counter runs freely and wraps at `CompareCounter::MODULUS`.
//!   Each wrap starts a new *epoch*.
//!
//! - The counter's overflow interrupt must call `EpochTimer::on_overflow`,
//!   which advances the software epoch base by one modulus.
//!
//! - `EpochTimer::set` translates an absolute alarm time into a compare value.
//!   The compare unit is only armed if the alarm falls within the current
//!   epoch; otherwise the overflow handler arms it once its epoch comes
//!   around.
//!
//! - The compare interrupt must call `EpochTimer::on_compare`, which returns
//!   the current time if the alarm is due.
//!
//! **Note:** arming races the counter. If the counter passes the compare value
//! between reading the count and enabling the compare unit, the match is lost,
//! so arming re-reads the counter and retries until the target is still ahead.

#![cfg_attr(target_os = "none", no_std)]

use abi::{Ticks, Timestamp};

/// A free-running hardware counter with a single compare unit.
pub trait CompareCounter {
    /// Number of distinct counter values. The counter counts from zero to
    /// `MODULUS - 1` and wraps. Must not exceed `1 << 31`.
    const MODULUS: u32;

    fn count(&self) -> u32;

    /// Loads the compare register. `value` is below `MODULUS`.
    fn set_compare(&mut self, value: u32);

    fn set_compare_enabled(&mut self, enabled: bool);

    /// Checks whether the counter has wrapped since the overflow flag was last
    /// cleared.
    fn overflow_pending(&self) -> bool;

    fn clear_overflow(&mut self);

    fn clear_compare(&mut self);
}

pub struct EpochTimer<C> {
    counter: C,
    /// Kernel time at which the counter last read zero.
    base: Timestamp,
    alarm: Option<Timestamp>,
}

impl<C: CompareCounter> EpochTimer<C> {
    /// Wraps `counter`, declaring the present instant to be `now`.
    pub fn new(counter: C, now: Timestamp) -> Self {
        let base = Timestamp(now.0.wrapping_sub(counter.count()));
        Self {
            counter,
            base,
            alarm: None,
        }
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }

    pub fn counter_mut(&mut self) -> &mut C {
        &mut self.counter
    }

    /// Returns the current time.
    pub fn now(&self) -> Timestamp {
        let (base, count) = self.epoch();
        base + Ticks(count)
    }

    /// Returns the pending alarm time, if any.
    pub fn alarm(&self) -> Option<Timestamp> {
        self.alarm
    }

    pub fn is_armed(&self) -> bool {
        self.alarm.is_some()
    }

    /// Sets the alarm to go off at `alarm`, replacing any prior setting.
    ///
    /// The alarm is guaranteed to go off at or after `alarm`. An alarm time
    /// that has already passed goes off on the next counter tick.
    pub fn set(&mut self, alarm: Timestamp) {
        self.alarm = Some(alarm);
        self.arm();
    }

    pub fn clear(&mut self) {
        self.alarm = None;
        self.counter.set_compare_enabled(false);
    }

    /// Handles the counter overflow interrupt.
    pub fn on_overflow(&mut self) {
        self.base = self.base + Ticks(C::MODULUS);
        self.counter.clear_overflow();
        self.arm();
    }

    /// Handles the compare interrupt, returning the current time if the alarm
    /// is due. The alarm is disarmed when it fires.
    pub fn on_compare(&mut self) -> Option<Timestamp> {
        self.counter.clear_compare();
        let alarm = match self.alarm {
            Some(alarm) => alarm,
            None => {
                self.counter.set_compare_enabled(false);
                return None;
            }
        };

        let now = self.now();
        if alarm.is_at_or_before(now) {
            self.clear();
            Some(now)
        } else {
            // Compare matched in an earlier epoch's slot; try again.
            self.arm();
            None
        }
    }

    /// Reads the epoch base and the counter consistently. A wrap that the
    /// overflow handler has not seen yet is folded into the base.
    fn epoch(&self) -> (Timestamp, u32) {
        let count = self.counter.count();
        if self.counter.overflow_pending() && count < C::MODULUS / 2 {
            (self.base + Ticks(C::MODULUS), count)
        } else {
            (self.base, count)
        }
    }

    fn arm(&mut self) {
        let Some(alarm) = self.alarm else {
            self.counter.set_compare_enabled(false);
            return;
        };

        let (base, _) = self.epoch();
        let offset = alarm.ticks_since(base).0 as i32;
        if offset == C::MODULUS as i32 {
            // Due on the first tick of the next epoch, which is the wrap.
            self.counter.set_compare(0);
            self.counter.set_compare_enabled(true);
            return;
        }
        if offset > C::MODULUS as i32 {
            // Not this epoch. The overflow handler will get to it.
            self.counter.set_compare_enabled(false);
            return;
        }

        loop {
            let count = self.counter.count();
            let target = if offset <= count as i32 {
                count + 1
            } else {
                offset as u32
            };
            self.counter.set_compare(target % C::MODULUS);
            self.counter.set_compare_enabled(true);

            if self.counter.count() < target {
                break;
            }
        }
    }
}

/// A counter that only moves when told to, for hosted environments and tests.
#[cfg(not(target_os = "none"))]
pub mod sim {
    use super::CompareCounter;

    /// A simulated `BITS`-wide counter. `BITS` must be at most 31.
    #[derive(Clone, Debug, Default)]
    pub struct SimulatedCounter<const BITS: u32> {
        count: u32,
        compare: u32,
        compare_enabled: bool,
        compare_flag: bool,
        overflow_flag: bool,
    }

    impl<const BITS: u32> SimulatedCounter<BITS> {
        const MOD: u32 = 1 << BITS;

        pub fn new(count: u32) -> Self {
            Self {
                count: count % Self::MOD,
                ..Self::default()
            }
        }

        pub fn compare_pending(&self) -> bool {
            self.compare_flag
        }

        pub fn compare_enabled(&self) -> bool {
            self.compare_enabled
        }

        pub fn compare(&self) -> u32 {
            self.compare
        }

        /// Advances the counter by at most `max` ticks, stopping on the tick
        /// that raises an interrupt flag. Returns the number of ticks taken.
        pub fn advance(&mut self, max: u32) -> u32 {
            let mut step = max.min(Self::MOD - self.count);
            if self.compare_enabled {
                let to_compare =
                    (self.compare + Self::MOD - self.count - 1) % Self::MOD + 1;
                step = step.min(to_compare);
            }
            if step == 0 {
                return 0;
            }

            self.count = (self.count + step) % Self::MOD;
            if self.count == 0 {
                self.overflow_flag = true;
            }
            if self.compare_enabled && self.count == self.compare {
                self.compare_flag = true;
            }
            step
        }
    }

    impl<const BITS: u32> CompareCounter for SimulatedCounter<BITS> {
        const MODULUS: u32 = 1 << BITS;

        fn count(&self) -> u32 {
            self.count
        }

        fn set_compare(&mut self, value: u32) {
            self.compare = value;
        }

        fn set_compare_enabled(&mut self, enabled: bool) {
            self.compare_enabled = enabled;
        }

        fn overflow_pending(&self) -> bool {
            self.overflow_flag
        }

        fn clear_overflow(&mut self) {
            self.overflow_flag = false;
        }

        fn clear_compare(&mut self) {
            self.compare_flag = false;
        }
    }
}
