//! Custom sources: foreign-loop adapters
//!
//! A custom source follows the same prepare/query/dispatch discipline as the
//! loop itself, which makes the composition recursive: an adapter can bridge
//! a foreign event loop, or embed one [`Mainloop`](crate::Mainloop) inside
//! another (see the tests below for a full embedding).
//!
//! The loop guarantees the adapter:
//! - `query` and `dispatch` are never called without a preceding `prepare`;
//! - after each `prepare` there is exactly one `dispatch` before `prepare`
//!   may be called again, unless the source or the loop is destroyed first,
//!   in which case the owed dispatch is skipped, never delivered late;
//! - `query` is only called between `prepare` and that `dispatch`.
//!
//! These hold across nested iterations: a dispatch counts as delivered the
//! moment the callback starts, so an adapter starting a nested iteration
//! from inside its own `dispatch` will see `prepare` again before that
//! `dispatch` returns. This is why the trait takes `&self`: adapters keep
//! their mutable state in `Cell`/`RefCell` and stay re-enterable.
//!
//! In return the adapter must return identical results from `query` until
//! the next `prepare`, and must not touch the owning loop from `query` (it
//! receives no loop reference, so this is enforced by construction).
//! `prepare` may reconfigure or destroy the loop's other, non-custom
//! sources, but must not drive the loop's phases.

use std::rc::Rc;

use crate::sources::CustomToken;
use crate::sys::PollFd;
use crate::Mainloop;

/// An externally implemented event source, integrated through the loop's
/// own three-phase protocol.
pub trait CustomSource<'l, Data> {
    /// Called once per owed dispatch during the loop's prepare phase, to
    /// rebuild the descriptors and timeout that `query` will report.
    ///
    /// May reconfigure or destroy the loop's other, non-custom sources
    /// through `_mainloop`; the change is honored by this same iteration,
    /// since custom sources are prepared before everything else is
    /// scanned. Must not start an iteration of the owning loop.
    fn prepare(&self, _mainloop: &mut Mainloop<'l, Data>) {}

    /// Reports the prepared descriptors and timeout.
    ///
    /// Writes up to `fds.len()` entries and returns the total number of
    /// available entries plus the timeout in milliseconds (`-1` for no
    /// demand, `0` for "already ready"). May be called several times per
    /// phase and must return the same data each time.
    fn query(&self, fds: &mut [PollFd]) -> (usize, i32);

    /// Called exactly once per prepare, after the poll, with exactly the
    /// entries this source contributed, readiness filled in.
    ///
    /// Invoked even when nothing fired (a zero-timeout or custom-declared
    /// ready iteration produces no real I/O activity), so the
    /// implementation has to check the readiness itself. It may drive
    /// nested iterations through `mainloop`.
    fn dispatch(&self, mainloop: &mut Mainloop<'l, Data>, fds: &[PollFd], data: &mut Data);
}

pub(crate) struct CustomEntry<'l, Data> {
    pub(crate) source: Rc<dyn CustomSource<'l, Data> + 'l>,
    /// Set when the loop calls `prepare`, cleared the moment `dispatch`
    /// starts. Guards the exactly-one-dispatch-per-prepare contract across
    /// nested iterations.
    pub(crate) pending: bool,
}

impl<'l, Data> Mainloop<'l, Data> {
    /// Adds a custom source. Keep a clone of the `Rc` to reach the adapter's
    /// state from outside the loop.
    pub fn add_custom(&mut self, source: Rc<dyn CustomSource<'l, Data> + 'l>) -> CustomToken {
        self.customs.insert(CustomEntry {
            source,
            pending: false,
        })
    }

    /// Destroys the custom source. A dispatch still owed to it is skipped.
    pub fn remove_custom(&mut self, token: CustomToken) {
        self.customs
            .remove(token)
            .expect("custom source used after destruction");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::sources::DeferToken;
    use crate::sys::Interest;

    /// Contributes no descriptors and a fixed timeout, counting protocol
    /// calls.
    struct TimeoutOnly {
        timeout: i32,
        prepares: Cell<u32>,
        queries: Cell<u32>,
        dispatches: Cell<u32>,
    }

    impl TimeoutOnly {
        fn new(timeout: i32) -> Rc<TimeoutOnly> {
            Rc::new(TimeoutOnly {
                timeout,
                prepares: Cell::new(0),
                queries: Cell::new(0),
                dispatches: Cell::new(0),
            })
        }
    }

    impl<'l> CustomSource<'l, ()> for TimeoutOnly {
        fn prepare(&self, _mainloop: &mut Mainloop<'l, ()>) {
            self.prepares.set(self.prepares.get() + 1);
        }

        fn query(&self, _fds: &mut [PollFd]) -> (usize, i32) {
            self.queries.set(self.queries.get() + 1);
            (0, self.timeout)
        }

        fn dispatch(&self, _mainloop: &mut Mainloop<'l, ()>, fds: &[PollFd], _data: &mut ()) {
            assert!(fds.is_empty());
            self.dispatches.set(self.dispatches.get() + 1);
        }
    }

    #[test]
    fn custom_timeout_bounds_the_iteration() {
        let mut mainloop = Mainloop::<()>::new();
        let source = TimeoutOnly::new(5);
        mainloop.add_custom(source.clone());

        mainloop.prepare();
        let (count, timeout) = mainloop.query(&mut []);
        assert_eq!(count, 0);
        assert_eq!(timeout, 5);

        mainloop.dispatch(&[], &mut ());
        assert_eq!(source.dispatches.get(), 1);
    }

    #[test]
    fn exactly_one_dispatch_per_prepare() {
        let mut mainloop = Mainloop::<()>::new();
        let source = TimeoutOnly::new(0);
        mainloop.add_custom(source.clone());

        for round in 1..=3u32 {
            mainloop.iterate(false, &mut ()).unwrap();
            assert_eq!(source.prepares.get(), round);
            assert_eq!(source.dispatches.get(), round);
        }
        assert!(source.queries.get() >= 3);
    }

    #[test]
    fn destroyed_source_skips_its_owed_dispatch() {
        let mut mainloop = Mainloop::<()>::new();
        let source = TimeoutOnly::new(0);
        let token = mainloop.add_custom(source.clone());

        mainloop.prepare();
        mainloop.query(&mut []);
        mainloop.remove_custom(token);
        mainloop.dispatch(&[], &mut ());

        assert_eq!(source.prepares.get(), 1);
        assert_eq!(source.dispatches.get(), 0);
    }

    /// Starts one nested iteration from inside its own dispatch, verifying
    /// that `prepare` legitimately runs again before `dispatch` returns.
    struct NestingSource {
        nested: Cell<bool>,
        prepares_seen_inside_dispatch: Cell<u32>,
        prepares: Cell<u32>,
    }

    impl<'l> CustomSource<'l, ()> for NestingSource {
        fn prepare(&self, _mainloop: &mut Mainloop<'l, ()>) {
            self.prepares.set(self.prepares.get() + 1);
        }

        fn query(&self, _fds: &mut [PollFd]) -> (usize, i32) {
            (0, 0)
        }

        fn dispatch(&self, mainloop: &mut Mainloop<'l, ()>, _fds: &[PollFd], data: &mut ()) {
            if !self.nested.replace(true) {
                let before = self.prepares.get();
                mainloop.iterate(false, data).unwrap();
                self.prepares_seen_inside_dispatch
                    .set(self.prepares.get() - before);
            }
        }
    }

    #[test]
    fn nested_iteration_re_prepares_the_adapter() {
        let mut mainloop = Mainloop::<()>::new();
        let source = Rc::new(NestingSource {
            nested: Cell::new(false),
            prepares_seen_inside_dispatch: Cell::new(0),
            prepares: Cell::new(0),
        });
        mainloop.add_custom(source.clone());

        mainloop.iterate(false, &mut ()).unwrap();
        assert_eq!(source.prepares_seen_inside_dispatch.get(), 1);
    }

    /// Disables a sibling defer from inside its own prepare.
    struct Silencer {
        defer: Cell<Option<DeferToken>>,
    }

    impl<'l> CustomSource<'l, u32> for Silencer {
        fn prepare(&self, mainloop: &mut Mainloop<'l, u32>) {
            if let Some(token) = self.defer.take() {
                mainloop.set_defer_enabled(token, false);
            }
        }

        fn query(&self, _fds: &mut [PollFd]) -> (usize, i32) {
            (0, -1)
        }

        fn dispatch(&self, _mainloop: &mut Mainloop<'l, u32>, _fds: &[PollFd], _data: &mut u32) {}
    }

    #[test]
    fn prepare_may_reconfigure_sibling_sources() {
        let mut mainloop = Mainloop::<u32>::new();
        let defer = mainloop.add_defer(|_, _, hits| *hits += 1);
        mainloop.add_custom(Rc::new(Silencer {
            defer: Cell::new(Some(defer)),
        }));

        // the disable lands during prepare, before the defer is scanned
        let mut hits = 0;
        mainloop.iterate(false, &mut hits).unwrap();
        assert_eq!(hits, 0);
        assert!(!mainloop.defer_enabled(defer));

        mainloop.set_defer_enabled(defer, true);
        mainloop.iterate(false, &mut hits).unwrap();
        assert_eq!(hits, 1);
    }

    /// A whole mainloop embedded into another through the adapter protocol.
    struct Embedded {
        inner: RefCell<Mainloop<'static, u32>>,
        inner_data: RefCell<u32>,
    }

    impl<'l, Data> CustomSource<'l, Data> for Embedded {
        fn prepare(&self, _mainloop: &mut Mainloop<'l, Data>) {
            self.inner.borrow_mut().prepare();
        }

        fn query(&self, fds: &mut [PollFd]) -> (usize, i32) {
            self.inner.borrow_mut().query(fds)
        }

        fn dispatch(&self, _mainloop: &mut Mainloop<'l, Data>, fds: &[PollFd], _data: &mut Data) {
            self.inner
                .borrow_mut()
                .dispatch(fds, &mut self.inner_data.borrow_mut());
        }
    }

    #[test]
    fn embedded_mainloop_runs_inside_its_host() {
        let (read, write) = rustix::pipe::pipe().unwrap();

        let mut inner = Mainloop::<u32>::new();
        inner.add_io(&read, Interest::READ, |_, _, readiness, hits| {
            assert!(readiness.readable);
            *hits += 1;
        });

        let mut outer = Mainloop::<()>::new();
        let embedded = Rc::new(Embedded {
            inner: RefCell::new(inner),
            inner_data: RefCell::new(0),
        });
        outer.add_custom(embedded.clone());

        // quiet inner loop: nothing fires
        outer.iterate(false, &mut ()).unwrap();
        assert_eq!(*embedded.inner_data.borrow(), 0);

        // the inner loop's descriptor surfaces through the outer poll
        rustix::io::write(&write, b"x").unwrap();
        outer.iterate(false, &mut ()).unwrap();
        assert_eq!(*embedded.inner_data.borrow(), 1);

        // drain so the next round is quiet again
        let mut buf = [0u8; 8];
        rustix::io::read(&read, &mut buf).unwrap();
        outer.iterate(false, &mut ()).unwrap();
        assert_eq!(*embedded.inner_data.borrow(), 1);
    }

    #[test]
    fn embedded_defer_forces_zero_timeout_on_the_host() {
        let mut inner = Mainloop::<u32>::new();
        inner.add_defer(|_, _, hits| *hits += 1);

        let mut outer = Mainloop::<()>::new();
        let embedded = Rc::new(Embedded {
            inner: RefCell::new(inner),
            inner_data: RefCell::new(0),
        });
        outer.add_custom(embedded.clone());

        outer.prepare();
        let (_, timeout) = outer.query(&mut []);
        assert_eq!(timeout, 0);

        outer.dispatch(&[], &mut ());
        assert_eq!(*embedded.inner_data.borrow(), 1);
    }
}
