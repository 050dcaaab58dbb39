//! Timer sources
//!
//! A timer holds an absolute deadline on a selectable [`Clock`], not an
//! interval. The loop never re-arms a fired timer: its callback receives the
//! deadline that was due (not "now") and the timer keeps firing on every
//! iteration until the caller sets a new deadline, disables it or destroys
//! it (level semantics). One-shot behavior is therefore spelled
//! `mainloop.disable_timer(token)` inside the callback.
//!
//! A disabled timer has no deadline and contributes neither to the poll
//! timeout nor to dispatch.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Clock;
use crate::sources::TimerToken;
use crate::{Error, Mainloop};

pub(crate) type TimerCallback<'l, Data> =
    Rc<RefCell<dyn FnMut(&mut Mainloop<'l, Data>, TimerToken, Duration, &mut Data) + 'l>>;

pub(crate) struct TimerSource<'l, Data> {
    pub(crate) clock: Clock,
    /// Absolute deadline since the clock's epoch; `None` = disabled.
    pub(crate) deadline: Option<Duration>,
    pub(crate) callback: TimerCallback<'l, Data>,
}

impl<'l, Data> Mainloop<'l, Data> {
    /// Adds a timer on [`Clock::Realtime`], armed for `deadline` if one is
    /// given and disabled otherwise.
    ///
    /// The callback receives the deadline that should have fired, which is
    /// in the past by however long the poll and dispatch were delayed.
    pub fn add_timer<F>(&mut self, deadline: Option<Duration>, callback: F) -> TimerToken
    where
        F: FnMut(&mut Mainloop<'l, Data>, TimerToken, Duration, &mut Data) + 'l,
    {
        self.timers.insert(TimerSource {
            clock: Clock::Realtime,
            deadline,
            callback: Rc::new(RefCell::new(callback)),
        })
    }

    /// Arms the timer for an absolute deadline on its current clock,
    /// enabling it. Takes effect immediately, also for an iteration already
    /// in flight.
    pub fn set_timer_deadline(&mut self, token: TimerToken, deadline: Duration) {
        self.timers[token].deadline = Some(deadline);
    }

    /// Arms the timer for `delay` from now on its current clock, enabling
    /// it, and returns the resulting absolute deadline.
    ///
    /// If the clock cannot be read the timer is disabled and the failure is
    /// returned.
    pub fn set_timer_deadline_in(
        &mut self,
        token: TimerToken,
        delay: Duration,
    ) -> crate::Result<Duration> {
        let timer = &mut self.timers[token];
        match timer.clock.now() {
            Ok(now) => {
                let deadline = now + delay;
                timer.deadline = Some(deadline);
                Ok(deadline)
            }
            Err(source) => {
                timer.deadline = None;
                Err(Error::Clock {
                    clock: timer.clock,
                    source,
                })
            }
        }
    }

    /// Moves the timer to a different clock. This always disables it: the
    /// previously set deadline is meaningless on another clock.
    pub fn set_timer_clock(&mut self, token: TimerToken, clock: Clock) {
        let timer = &mut self.timers[token];
        timer.clock = clock;
        timer.deadline = None;
    }

    /// Disables the timer, whatever deadline is currently set.
    pub fn disable_timer(&mut self, token: TimerToken) {
        self.timers[token].deadline = None;
    }

    /// Whether the timer is armed.
    pub fn timer_enabled(&self, token: TimerToken) -> bool {
        self.timers[token].deadline.is_some()
    }

    /// The armed deadline, or `None` for a disabled timer.
    pub fn timer_deadline(&self, token: TimerToken) -> Option<Duration> {
        self.timers[token].deadline
    }

    /// The clock the timer's deadline lives on.
    pub fn timer_clock(&self, token: TimerToken) -> Clock {
        self.timers[token].clock
    }

    /// Destroys the timer.
    pub fn remove_timer(&mut self, token: TimerToken) {
        self.timers
            .remove(token)
            .expect("timer source used after destruction");
    }
}
