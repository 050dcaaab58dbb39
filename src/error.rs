use std::io;

use crate::clock::Clock;

/// Errors the loop can surface to its caller.
///
/// Phase misuse (calling `query`, `poll` or `dispatch` without a prior
/// `prepare`, or handing `dispatch` a buffer that does not match the queried
/// table) and use of a destroyed source's token are programmer errors and
/// panic instead of being reported here.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The underlying poll primitive failed for a reason other than
    /// interruption. The iteration is over, but the loop stays usable.
    #[error("polling the prepared descriptor table failed")]
    Poll(#[source] io::Error),

    /// Reading a timer's clock failed while arming a relative deadline.
    /// The affected timer has been disabled.
    #[error("reading the {clock:?} clock failed")]
    Clock {
        /// The clock that could not be read.
        clock: Clock,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },
}

/// The crate-wide result type.
pub type Result<T> = core::result::Result<T, Error>;
