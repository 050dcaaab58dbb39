//! Single-threaded, callback-based event reactor built on `poll(2)`.
//!
//! A [`Mainloop`] multiplexes four kinds of event sources over one combined
//! descriptor table:
//!
//! - **IO sources** watch a file descriptor for readiness,
//! - **timer sources** fire when an absolute deadline on a selectable
//!   [`Clock`] passes,
//! - **defer sources** run on every iteration while enabled,
//! - **custom sources** integrate a foreign event loop through the reactor's
//!   own prepare/query/dispatch protocol (see [`CustomSource`]).
//!
//! Each iteration is the four-phase cycle prepare → query → poll → dispatch.
//! [`Mainloop::iterate`] runs one full cycle; the phases are also drivable
//! individually, so the whole loop can in turn be embedded into an external
//! poll-based loop.
//!
//! The loop is strictly single-threaded and re-entrant: callbacks receive
//! `&mut Mainloop` and may add sources, destroy sources (their own
//! included), or run nested iterations.
//!
//! Callbacks additionally receive a `&mut Data` reference to a caller-owned
//! state, which is how independent callbacks share mutable state without
//! reference-counting ceremony:
//!
//! ```
//! use polloop::Mainloop;
//!
//! let mut mainloop = Mainloop::<u32>::new();
//! mainloop.add_defer(|mainloop, token, hits| {
//!     *hits += 1;
//!     mainloop.remove_defer(token);
//! });
//!
//! let mut hits = 0;
//! mainloop.iterate(false, &mut hits).unwrap();
//! mainloop.iterate(false, &mut hits).unwrap();
//! assert_eq!(hits, 1);
//! ```
#![warn(missing_docs)]

mod clock;
mod error;
mod loop_logic;
pub mod sources;
mod sys;

pub use clock::Clock;
pub use error::{Error, Result};
pub use loop_logic::Mainloop;
pub use sources::custom::CustomSource;
pub use sources::{CustomToken, DeferToken, IoToken, TimerToken};
pub use sys::{Interest, PollFd, Poller, Readiness, SysPoller};
