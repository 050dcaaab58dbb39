//! The reactor core: phase state machine and combined descriptor table
//!
//! An iteration is four phases. `prepare` rebuilds the combined descriptor
//! table from every source and computes the poll timeout. `query` exposes
//! that table to an external driver. `poll` waits on it (or the driver waits
//! however it likes). `dispatch` walks the results and invokes callbacks in
//! a fixed order: IO, then custom, then timer, then defer sources.
//!
//! [`iterate`](Mainloop::iterate) chains the four phases for the common case
//! of the loop driving itself. Driving the phases by hand is the embedding
//! path: `query` the table, merge it into a foreign poll set, and feed the
//! filled entries back through `dispatch`.
//!
//! The loop returns to the idle phase before the first callback of a
//! dispatch runs, so callbacks may start nested iterations, add sources, or
//! destroy any source, including their own.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use slotmap::SlotMap;

use crate::clock::ClockCache;
use crate::sources::custom::CustomEntry;
use crate::sources::defer::DeferSource;
use crate::sources::io::IoSource;
use crate::sources::timer::TimerSource;
use crate::sources::{CustomToken, DeferToken, IoToken, TimerToken};
use crate::sys::{PollFd, Poller, Readiness, SysPoller};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Prepared,
    Polled,
}

/// Maps a run of the descriptor table back to the source that contributed
/// it. Rebuilt by every prepare, taken out of the loop by dispatch.
#[derive(Clone, Copy)]
enum Slot {
    Io {
        token: IoToken,
        fd: RawFd,
        index: usize,
    },
    Custom {
        token: CustomToken,
        start: usize,
        len: usize,
    },
}

/// A single-threaded event reactor multiplexing IO, timer, defer and custom
/// sources over one `poll(2)` table.
///
/// `Data` is a caller-owned state threaded as `&mut Data` into every
/// callback, so callbacks can share mutable state without `Rc<RefCell<..>>`
/// gymnastics. Use `()` if you do not need it.
///
/// Sources are addressed through generation-checked tokens. Using the token
/// of a destroyed source is a programmer error and panics.
pub struct Mainloop<'l, Data> {
    pub(crate) ios: SlotMap<IoToken, IoSource<'l, Data>>,
    pub(crate) timers: SlotMap<TimerToken, TimerSource<'l, Data>>,
    pub(crate) defers: SlotMap<DeferToken, DeferSource<'l, Data>>,
    pub(crate) customs: SlotMap<CustomToken, CustomEntry<'l, Data>>,
    poller: Box<dyn Poller + 'l>,
    /// The combined descriptor table of the current iteration.
    table: Vec<PollFd>,
    slots: Vec<Slot>,
    /// Length the table had when prepared; `dispatch` buffers must match it.
    prepared_len: usize,
    /// Timeout computed by the last prepare, in poll(2) milliseconds.
    timeout: i32,
    phase: Phase,
}

impl<'l, Data> Mainloop<'l, Data> {
    /// Creates a loop backed by [`SysPoller`], i.e. `poll(2)`.
    pub fn new() -> Mainloop<'l, Data> {
        Mainloop::with_poller(Box::new(SysPoller))
    }

    /// Creates a loop backed by a custom [`Poller`].
    pub fn with_poller(poller: Box<dyn Poller + 'l>) -> Mainloop<'l, Data> {
        Mainloop {
            ios: SlotMap::with_key(),
            timers: SlotMap::with_key(),
            defers: SlotMap::with_key(),
            customs: SlotMap::with_key(),
            poller,
            table: Vec::new(),
            slots: Vec::new(),
            prepared_len: 0,
            timeout: -1,
            phase: Phase::Idle,
        }
    }

    /// Rebuilds the descriptor table and computes the poll timeout.
    ///
    /// Custom sources are prepared first, so whatever they do to the other
    /// sources is reflected in this same iteration. An adapter still owed a
    /// dispatch is only re-queried, never re-prepared.
    pub fn prepare(&mut self) {
        self.table.clear();
        self.slots.clear();
        let mut timeout = -1;

        let custom_keys: Vec<CustomToken> = self.customs.keys().collect();
        for token in custom_keys {
            let (source, owes_dispatch) = {
                let Some(entry) = self.customs.get_mut(token) else {
                    continue;
                };
                let owed = entry.pending;
                entry.pending = true;
                (entry.source.clone(), owed)
            };
            if !owes_dispatch {
                source.prepare(self);
            }

            let (count, custom_timeout) = source.query(&mut []);
            let start = self.table.len();
            self.table.resize(start + count, PollFd::unused());
            let (recount, retimeout) = source.query(&mut self.table[start..]);
            let len = count.min(recount);
            if recount != count || retimeout != custom_timeout {
                log::warn!(
                    "[polloop] custom source changed its query within one phase \
                     ({count} fds / {custom_timeout} ms, then {recount} / {retimeout})"
                );
                self.table.truncate(start + len);
            }
            for entry in &mut self.table[start..] {
                entry.readiness = Readiness::EMPTY;
            }

            self.slots.push(Slot::Custom { token, start, len });
            timeout = merge_timeout(timeout, custom_timeout);
        }

        // one entry per IO source; empty interest is still tabled, since
        // error, hangup and invalid cannot be opted out of
        for (token, source) in &self.ios {
            let index = self.table.len();
            self.table.push(PollFd::new(source.fd, source.interest));
            self.slots.push(Slot::Io {
                token,
                fd: source.fd,
                index,
            });
        }

        if self.defers.values().any(|defer| defer.enabled) {
            timeout = 0;
        }

        let mut clocks = ClockCache::new();
        for timer in self.timers.values() {
            let Some(deadline) = timer.deadline else {
                continue;
            };
            let Some(now) = clocks.now(timer.clock) else {
                continue;
            };
            timeout = merge_timeout(timeout, remaining_ms(deadline, now));
        }

        self.prepared_len = self.table.len();
        self.timeout = timeout;
        self.phase = Phase::Prepared;
    }

    /// Copies the prepared descriptor table into `fds` and returns the total
    /// number of entries together with the prepared timeout in milliseconds
    /// (`-1` to block indefinitely, `0` to not block at all).
    ///
    /// If `fds` is too small only a prefix is copied; call again with a
    /// buffer of the returned size for the full table. The table does not
    /// change between `prepare` and `dispatch`.
    ///
    /// # Panics
    ///
    /// Panics when called outside the prepared phase.
    pub fn query(&mut self, fds: &mut [PollFd]) -> (usize, i32) {
        assert_eq!(
            self.phase,
            Phase::Prepared,
            "query called without a prepare"
        );
        let filled = fds.len().min(self.table.len());
        fds[..filled].copy_from_slice(&self.table[..filled]);
        (self.table.len(), self.timeout)
    }

    /// Waits for readiness on the prepared table, for at most `timeout`
    /// milliseconds. Interruption by a signal is retried transparently with
    /// the remaining timeout.
    ///
    /// On failure the table's results are zeroed and [`Error::Poll`] is
    /// returned; custom sources are still owed their dispatch, so run
    /// [`dispatch`](Mainloop::dispatch) even then.
    ///
    /// # Panics
    ///
    /// Panics when called outside the prepared phase.
    pub fn poll(&mut self, timeout: i32) -> Result<usize> {
        assert_eq!(self.phase, Phase::Prepared, "poll called without a prepare");
        for entry in &mut self.table {
            entry.readiness = Readiness::EMPTY;
        }

        let start = Instant::now();
        let mut remaining = timeout;
        loop {
            match self.poller.poll(&mut self.table, remaining) {
                Ok(ready) => {
                    self.phase = Phase::Polled;
                    return Ok(ready);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if timeout > 0 {
                        let elapsed = start.elapsed().as_millis().min(timeout as u128) as i32;
                        remaining = timeout - elapsed;
                    }
                }
                Err(err) => {
                    for entry in &mut self.table {
                        entry.readiness = Readiness::EMPTY;
                    }
                    self.phase = Phase::Polled;
                    return Err(Error::Poll(err));
                }
            }
        }
    }

    /// Invokes the callbacks of everything that is ready.
    ///
    /// `fds` must be the table of the current iteration as handed out by
    /// [`query`](Mainloop::query), readiness filled in either by
    /// [`poll`](Mainloop::poll) or by an external wait. Callbacks run in
    /// source-kind order: IO sources with surviving readiness, custom
    /// sources owed a dispatch, timers whose deadline has passed, enabled
    /// defers. The loop is idle again before the first callback starts, so
    /// callbacks may freely add, destroy or iterate. A source added by one
    /// of these callbacks first participates in the next iteration.
    ///
    /// # Panics
    ///
    /// Panics when called without a preceding `prepare`, or when `fds` does
    /// not have the prepared table's length.
    pub fn dispatch(&mut self, fds: &[PollFd], data: &mut Data) {
        assert_ne!(self.phase, Phase::Idle, "dispatch called without a prepare");
        assert_eq!(
            fds.len(),
            self.prepared_len,
            "dispatch buffer does not match the prepared descriptor table"
        );

        let slots = mem::take(&mut self.slots);
        // timers and defers created by a callback of this dispatch are not
        // in these snapshots; they join from the next iteration
        let timer_keys: Vec<TimerToken> = self.timers.keys().collect();
        let defer_keys: Vec<DeferToken> = self.defers.keys().collect();
        self.phase = Phase::Idle;

        for slot in &slots {
            let Slot::Io { token, fd, index } = *slot else {
                continue;
            };
            let entry = fds[index];
            debug_assert_eq!(entry.fd, fd, "descriptor table reordered by the caller");
            if entry.readiness.is_empty() {
                continue;
            }
            // mask against the interest as of now, not as of prepare
            let (readiness, callback) = match self.ios.get(token) {
                Some(source) => (
                    entry.readiness.masked_by(source.interest),
                    source.callback.clone(),
                ),
                None => continue,
            };
            if readiness.is_empty() {
                continue;
            }
            match callback.try_borrow_mut() {
                Ok(mut callback) => (&mut *callback)(self, token, readiness, data),
                Err(_) => log::warn!("[polloop] skipping re-entrant dispatch of an IO source"),
            };
        }

        for slot in &slots {
            let Slot::Custom { token, start, len } = *slot else {
                continue;
            };
            let source = match self.customs.get_mut(token) {
                // a nested iteration may already have delivered the dispatch
                Some(entry) if entry.pending => {
                    entry.pending = false;
                    entry.source.clone()
                }
                _ => continue,
            };
            source.dispatch(self, &fds[start..start + len], data);
        }

        let mut clocks = ClockCache::new();
        for token in timer_keys {
            let (deadline, callback) = {
                let Some(timer) = self.timers.get(token) else {
                    continue;
                };
                let Some(deadline) = timer.deadline else {
                    continue;
                };
                let Some(now) = clocks.now(timer.clock) else {
                    continue;
                };
                if deadline > now {
                    continue;
                }
                (deadline, timer.callback.clone())
            };
            match callback.try_borrow_mut() {
                Ok(mut callback) => (&mut *callback)(self, token, deadline, data),
                Err(_) => log::warn!("[polloop] skipping re-entrant dispatch of a timer source"),
            };
        }

        for token in defer_keys {
            let callback = {
                let Some(defer) = self.defers.get(token) else {
                    continue;
                };
                if !defer.enabled {
                    continue;
                }
                defer.callback.clone()
            };
            match callback.try_borrow_mut() {
                Ok(mut callback) => (&mut *callback)(self, token, data),
                Err(_) => log::warn!("[polloop] skipping re-entrant dispatch of a defer source"),
            };
        }
    }

    /// Runs one full iteration: prepare, poll, dispatch.
    ///
    /// With `block` the poll waits for the prepared timeout; without it the
    /// poll returns immediately and only already-pending work runs. Dispatch
    /// happens even when the poll fails, since custom adapters are owed it;
    /// the poll error is returned afterwards.
    pub fn iterate(&mut self, block: bool, data: &mut Data) -> Result<()> {
        self.prepare();
        let timeout = if block { self.timeout } else { 0 };
        let polled = self.poll(timeout).map(|_| ());

        let table = mem::take(&mut self.table);
        self.dispatch(&table, data);
        self.table = table;
        polled
    }

    /// Visits every IO source. The callback may destroy the visited source,
    /// or any other.
    pub fn for_each_io(&mut self, mut f: impl FnMut(&mut Self, IoToken)) {
        let keys: Vec<IoToken> = self.ios.keys().collect();
        for token in keys {
            if self.ios.contains_key(token) {
                f(self, token);
            }
        }
    }

    /// Visits every timer source. The callback may destroy the visited
    /// source, or any other.
    pub fn for_each_timer(&mut self, mut f: impl FnMut(&mut Self, TimerToken)) {
        let keys: Vec<TimerToken> = self.timers.keys().collect();
        for token in keys {
            if self.timers.contains_key(token) {
                f(self, token);
            }
        }
    }

    /// Visits every defer source. The callback may destroy the visited
    /// source, or any other.
    pub fn for_each_defer(&mut self, mut f: impl FnMut(&mut Self, DeferToken)) {
        let keys: Vec<DeferToken> = self.defers.keys().collect();
        for token in keys {
            if self.defers.contains_key(token) {
                f(self, token);
            }
        }
    }

    /// Visits every custom source. The callback may destroy the visited
    /// source, or any other.
    pub fn for_each_custom(&mut self, mut f: impl FnMut(&mut Self, CustomToken)) {
        let keys: Vec<CustomToken> = self.customs.keys().collect();
        for token in keys {
            if self.customs.contains_key(token) {
                f(self, token);
            }
        }
    }
}

impl<'l, Data> Default for Mainloop<'l, Data> {
    fn default() -> Mainloop<'l, Data> {
        Mainloop::new()
    }
}

fn merge_timeout(current: i32, candidate: i32) -> i32 {
    if candidate < 0 {
        current
    } else if current < 0 {
        candidate
    } else {
        current.min(candidate)
    }
}

/// Milliseconds from `now` until `deadline`, rounded up so the poll never
/// wakes before the deadline, clamped into poll(2)'s timeout range.
fn remaining_ms(deadline: Duration, now: Duration) -> i32 {
    if deadline <= now {
        return 0;
    }
    let ms = ((deadline - now).as_nanos() + 999_999) / 1_000_000;
    ms.min(i32::MAX as u128) as i32
}
