//! The four event source kinds
//!
//! Every source belongs to exactly one [`Mainloop`](crate::Mainloop) and is
//! addressed through a generation-checked token handed out at creation.
//! Tokens of destroyed sources are rejected loudly: accessor operations
//! panic rather than touching a slot that may have been reused.

pub mod custom;
pub mod defer;
pub mod io;
pub mod timer;

slotmap::new_key_type! {
    /// Handle to an IO source owned by a [`Mainloop`](crate::Mainloop).
    pub struct IoToken;

    /// Handle to a timer source owned by a [`Mainloop`](crate::Mainloop).
    pub struct TimerToken;

    /// Handle to a defer source owned by a [`Mainloop`](crate::Mainloop).
    pub struct DeferToken;

    /// Handle to a custom source owned by a [`Mainloop`](crate::Mainloop).
    pub struct CustomToken;
}
