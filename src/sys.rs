//! The descriptor table and the underlying poll primitive
//!
//! [`PollFd`] is one entry of the combined descriptor table the loop builds
//! during `prepare`. External integrations receive these entries from
//! [`query`](crate::Mainloop::query), perform their own wait, fill in the
//! [`Readiness`] results and hand the buffer back to
//! [`dispatch`](crate::Mainloop::dispatch).
//!
//! [`Poller`] abstracts the blocking wait itself; the default [`SysPoller`]
//! is a thin wrapper around `poll(2)`.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use rustix::event::{self, PollFlags};

/// Interest to register regarding a file descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Interest {
    /// Wait for the descriptor to be readable.
    pub readable: bool,

    /// Wait for the descriptor to be writable.
    pub writable: bool,
}

impl Interest {
    /// Shorthand for empty interest.
    ///
    /// A source with empty interest still reports error, hangup and invalid
    /// conditions, exactly like a `pollfd` with no requested events.
    pub const EMPTY: Interest = Interest {
        readable: false,
        writable: false,
    };

    /// Shorthand for read interest.
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };

    /// Shorthand for write interest.
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };

    /// Shorthand for read and write interest.
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// Readiness reported for one file descriptor.
///
/// The error, hangup and invalid bits can be set even though they were never
/// requested, matching `poll(2)` semantics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The descriptor is readable.
    pub readable: bool,

    /// The descriptor is writable.
    pub writable: bool,

    /// The descriptor is in an error state.
    pub error: bool,

    /// The peer hung up.
    pub hangup: bool,

    /// The descriptor is not open.
    pub invalid: bool,
}

impl Readiness {
    /// Shorthand for empty readiness.
    pub const EMPTY: Readiness = Readiness {
        readable: false,
        writable: false,
        error: false,
        hangup: false,
        invalid: false,
    };

    /// Whether no condition at all is set.
    pub fn is_empty(self) -> bool {
        self == Readiness::EMPTY
    }

    /// Restricts readable/writable to the given interest. Error, hangup and
    /// invalid always pass, since they cannot be requested in the first
    /// place.
    pub(crate) fn masked_by(self, interest: Interest) -> Readiness {
        Readiness {
            readable: self.readable && interest.readable,
            writable: self.writable && interest.writable,
            ..self
        }
    }
}

/// One entry of the combined descriptor table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollFd {
    /// The descriptor to wait on. The loop does not own it; the caller keeps
    /// it open for as long as it is registered.
    pub fd: RawFd,

    /// The events to wait for.
    pub interest: Interest,

    /// The events that fired, filled in by the poll step.
    pub readiness: Readiness,
}

impl PollFd {
    /// A new entry with empty readiness.
    pub fn new(fd: RawFd, interest: Interest) -> PollFd {
        PollFd {
            fd,
            interest,
            readiness: Readiness::EMPTY,
        }
    }

    /// A placeholder entry polling nothing, used to size buffers.
    pub(crate) fn unused() -> PollFd {
        PollFd::new(-1, Interest::EMPTY)
    }
}

/// The blocking multiplex primitive the loop runs on.
///
/// Implementations wait on every entry of `fds` for at most `timeout`
/// milliseconds (`-1` blocks indefinitely, `0` returns immediately), fill in
/// each entry's `readiness` and return how many entries fired. Entries with a
/// negative `fd` poll nothing and must be reported empty.
///
/// Interruption by a signal should be returned as
/// [`io::ErrorKind::Interrupted`]; the loop retries it transparently.
pub trait Poller {
    /// Wait for readiness on the given table.
    fn poll(&mut self, fds: &mut [PollFd], timeout: i32) -> io::Result<usize>;
}

/// The default [`Poller`], backed by `poll(2)`.
#[derive(Debug, Default)]
pub struct SysPoller;

impl Poller for SysPoller {
    fn poll(&mut self, fds: &mut [PollFd], timeout: i32) -> io::Result<usize> {
        let mut raw = Vec::with_capacity(fds.len());
        let mut indices = Vec::with_capacity(fds.len());
        for (index, entry) in fds.iter().enumerate() {
            if entry.fd < 0 {
                continue;
            }
            // SAFETY: descriptors are caller-managed. A descriptor closed
            // behind our back is reported by poll(2) as invalid, never
            // dereferenced.
            let borrowed = unsafe { BorrowedFd::borrow_raw(entry.fd) };
            raw.push(event::PollFd::from_borrowed_fd(
                borrowed,
                flags_from_interest(entry.interest),
            ));
            indices.push(index);
        }

        let ready = event::poll(&mut raw, timeout).map_err(io::Error::from)?;

        for (pollfd, index) in raw.iter().zip(indices) {
            fds[index].readiness = readiness_from_flags(pollfd.revents());
        }
        Ok(ready)
    }
}

fn flags_from_interest(interest: Interest) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.readable {
        flags |= PollFlags::IN;
    }
    if interest.writable {
        flags |= PollFlags::OUT;
    }
    flags
}

fn readiness_from_flags(flags: PollFlags) -> Readiness {
    Readiness {
        readable: flags.intersects(PollFlags::IN | PollFlags::PRI),
        writable: flags.contains(PollFlags::OUT),
        error: flags.contains(PollFlags::ERR),
        hangup: flags.contains(PollFlags::HUP),
        invalid: flags.contains(PollFlags::NVAL),
    }
}
