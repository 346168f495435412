use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;

/// What a channel wants to be woken for.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    #[inline]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// What the readiness backend last reported for a channel.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(0b0001);
    pub const WRITABLE: Readiness = Readiness(0b0010);
    pub const HANGUP: Readiness = Readiness(0b0100);
    pub const ERROR: Readiness = Readiness(0b1000);

    #[inline]
    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Hangup and error both need a read to surface the close or the errno.
    #[inline]
    pub fn wants_read(self) -> bool {
        self.0 & (Self::READABLE.0 | Self::HANGUP.0 | Self::ERROR.0) != 0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

/// Stable handle into a loop's channel arena.
///
/// The generation changes every time a slot is reused, so a handle held by a
/// queued kernel event or task can be checked before it is dereferenced.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelHandle {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelRole {
    /// A listening socket; readiness means "accept now".
    Listener,
    /// An accepted client connection.
    Client,
    /// The loop's own eventfd, signalled when descriptors are handed over.
    Waker,
}

/// Registration record for one socket.
pub struct Channel {
    pub handle: ChannelHandle,
    pub fd: RawFd,
    pub role: ChannelRole,
    pub interest: Interest,
    pub observed: Readiness,
    pub peer: Option<SocketAddr>,

    /// Last bytes of the previous read, rescanned with the next one so a
    /// priority marker split across two reads is still found.
    pub marker_tail: Vec<u8>,
}

impl Channel {
    pub fn new(handle: ChannelHandle, fd: RawFd, role: ChannelRole) -> Self {
        Self {
            handle,
            fd,
            role,
            interest: Interest::READABLE,
            observed: Readiness::EMPTY,
            peer: None,
            marker_tail: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_bits() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!Interest::READABLE.is_writable());
    }

    #[test]
    fn test_hangup_wants_read() {
        assert!(Readiness::HANGUP.wants_read());
        assert!(!Readiness::WRITABLE.wants_read());
        let mut r = Readiness::EMPTY;
        r |= Readiness::READABLE;
        assert!(r.contains(Readiness::READABLE));
        assert!(!r.contains(Readiness::READABLE | Readiness::ERROR));
    }
}
