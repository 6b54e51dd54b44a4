//! Level-triggered readiness polling over `poll(2)`.
//!
//! [`PollSet`] gathers many descriptors for one `poll(2)` call per cycle;
//! [`poll_fd`] asks about a single descriptor.

// poll(2) needs raw descriptors
#![allow(unsafe_code)]

use smallvec::SmallVec;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::time::Duration;

/// Events to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
    pub const BOTH: Self = Self {
        read: true,
        write: true,
    };

    /// Read always, write only when asked.
    #[must_use]
    pub const fn read_and(write: bool) -> Self {
        Self { read: true, write }
    }

    fn as_events(self) -> libc::c_short {
        let mut events = 0;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// Events reported by the OS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(u16);

impl Readiness {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(1);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const HANGUP: Self = Self(1 << 2);
    pub const ERROR: Self = Self(1 << 3);

    fn from_revents(revents: libc::c_short) -> Self {
        let mut r = Self::NONE;
        if revents & libc::POLLIN != 0 {
            r = r | Self::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            r = r | Self::WRITABLE;
        }
        if revents & libc::POLLHUP != 0 {
            r = r | Self::HANGUP;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            r = r | Self::ERROR;
        }
        r
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[must_use]
    pub const fn is_hangup(self) -> bool {
        self.contains(Self::HANGUP)
    }

    #[must_use]
    pub const fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    /// Something a receive call must look at: data, hangup or an error.
    #[must_use]
    pub const fn needs_receive(self) -> bool {
        self.0 & (Self::READABLE.0 | Self::HANGUP.0 | Self::ERROR.0) != 0
    }
}

impl BitOr for Readiness {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

fn timeout_ms(timeout: Duration) -> libc::c_int {
    libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX)
}

fn sys_poll(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let nfds = libc::nfds_t::try_from(fds.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many descriptors"))?;
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout_ms(timeout)) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(rc as usize)
}

/// Wait up to `timeout` for `interest` on one descriptor.
///
/// An interrupted wait reports no events.
pub fn poll_fd(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
    let mut fds = [libc::pollfd {
        fd,
        events: interest.as_events(),
        revents: 0,
    }];
    let n = sys_poll(&mut fds, timeout)?;
    if n == 0 {
        return Ok(Readiness::NONE);
    }
    Ok(Readiness::from_revents(fds[0].revents))
}

/// Descriptors polled together in one cycle.
///
/// Entries are addressed by the index returned from [`PollSet::push`]. The set
/// is meant to be cleared and rebuilt every cycle.
#[derive(Default)]
pub struct PollSet {
    fds: SmallVec<[libc::pollfd; 32]>,
}

impl PollSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn push(&mut self, fd: RawFd, interest: Interest) -> usize {
        self.fds.push(libc::pollfd {
            fd,
            events: interest.as_events(),
            revents: 0,
        });
        self.fds.len() - 1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// One `poll(2)` across the whole set. Returns how many entries have
    /// events; 0 on timeout or interruption.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        for fd in &mut self.fds {
            fd.revents = 0;
        }
        sys_poll(&mut self.fds, timeout)
    }

    /// Events of entry `index` from the last [`PollSet::wait`].
    #[must_use]
    pub fn readiness(&self, index: usize) -> Readiness {
        self.fds
            .get(index)
            .map_or(Readiness::NONE, |fd| Readiness::from_revents(fd.revents))
    }
}

impl std::fmt::Debug for PollSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSet").field("len", &self.fds.len()).finish()
    }
}
