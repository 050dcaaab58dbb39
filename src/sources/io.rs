//! IO sources
//!
//! An IO source watches one file descriptor for the events in its interest
//! mask. The descriptor is not owned: the caller keeps it open for as long
//! as the source exists (a descriptor closed behind the loop's back is
//! reported as `invalid`, not dereferenced).
//!
//! Interest changes take effect starting with the next `prepare`. A result
//! already gathered by the current iteration's poll is still delivered, but
//! masked against the interest at dispatch time: bits disabled mid-iteration
//! are filtered out, while error, hangup and invalid always pass since they
//! can never be requested.

use std::cell::RefCell;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::rc::Rc;

use crate::sources::IoToken;
use crate::sys::{Interest, Readiness};
use crate::Mainloop;

pub(crate) type IoCallback<'l, Data> =
    Rc<RefCell<dyn FnMut(&mut Mainloop<'l, Data>, IoToken, Readiness, &mut Data) + 'l>>;

pub(crate) struct IoSource<'l, Data> {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
    pub(crate) callback: IoCallback<'l, Data>,
}

impl<'l, Data> Mainloop<'l, Data> {
    /// Adds an IO source watching `fd` for `interest`.
    ///
    /// The callback is invoked during dispatch with the readiness that
    /// fired, which may include error, hangup or invalid conditions that
    /// were never requested.
    pub fn add_io<F>(&mut self, fd: impl AsFd, interest: Interest, callback: F) -> IoToken
    where
        F: FnMut(&mut Mainloop<'l, Data>, IoToken, Readiness, &mut Data) + 'l,
    {
        self.ios.insert(IoSource {
            fd: fd.as_fd().as_raw_fd(),
            interest,
            callback: Rc::new(RefCell::new(callback)),
        })
    }

    /// Replaces the source's interest mask, effective from the next prepare.
    pub fn set_io_interest(&mut self, token: IoToken, interest: Interest) {
        self.ios[token].interest = interest;
    }

    /// The source's current interest mask.
    pub fn io_interest(&self, token: IoToken) -> Interest {
        self.ios[token].interest
    }

    /// The descriptor the source watches.
    pub fn io_fd(&self, token: IoToken) -> RawFd {
        self.ios[token].fd
    }

    /// Destroys the source. It is removed from all future phases, and a
    /// result already polled for it in the current iteration is dropped.
    pub fn remove_io(&mut self, token: IoToken) {
        self.ios
            .remove(token)
            .expect("IO source used after destruction");
    }
}
