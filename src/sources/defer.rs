//! Defer sources
//!
//! A defer source is a callback that runs on every iteration while it is
//! enabled, after all IO, custom and timer callbacks of that iteration. It
//! has no deadline; at least one enabled defer forces the iteration's poll
//! timeout to zero so the loop never blocks past it.
//!
//! Defers are created enabled and are not one-shot: disable or destroy the
//! source inside its callback for one-shot behavior.

use std::cell::RefCell;
use std::rc::Rc;

use crate::sources::DeferToken;
use crate::Mainloop;

pub(crate) type DeferCallback<'l, Data> =
    Rc<RefCell<dyn FnMut(&mut Mainloop<'l, Data>, DeferToken, &mut Data) + 'l>>;

pub(crate) struct DeferSource<'l, Data> {
    pub(crate) enabled: bool,
    pub(crate) callback: DeferCallback<'l, Data>,
}

impl<'l, Data> Mainloop<'l, Data> {
    /// Adds a defer source, enabled, so its callback runs starting with the
    /// next iteration.
    pub fn add_defer<F>(&mut self, callback: F) -> DeferToken
    where
        F: FnMut(&mut Mainloop<'l, Data>, DeferToken, &mut Data) + 'l,
    {
        self.defers.insert(DeferSource {
            enabled: true,
            callback: Rc::new(RefCell::new(callback)),
        })
    }

    /// Enables or disables the defer source. Takes effect immediately: a
    /// defer disabled mid-iteration will not run in that iteration's
    /// dispatch.
    pub fn set_defer_enabled(&mut self, token: DeferToken, enabled: bool) {
        self.defers[token].enabled = enabled;
    }

    /// Whether the defer source is enabled.
    pub fn defer_enabled(&self, token: DeferToken) -> bool {
        self.defers[token].enabled
    }

    /// Destroys the defer source.
    pub fn remove_defer(&mut self, token: DeferToken) {
        self.defers
            .remove(token)
            .expect("defer source used after destruction");
    }
}
