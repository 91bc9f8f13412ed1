//! Readiness plumbing for the multi thread.
//!
//! Every descriptor registered with the multi's epoll set carries an
//! [`EventToken`] packed into the 64-bit user data, so the loop can dispatch by
//! pattern matching instead of pointer identity.

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

/// Identifier of a client within one multi.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u32);

impl ClientId {
    /// Numeric value, for logging and status reports.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of a client's descriptors became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Audio,
    Control,
    Drain,
}

/// Source of a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventToken {
    MultiWake,
    Client(ClientId, EventKind),
}

const WAKE_DATA: u64 = u64::MAX;

impl EventToken {
    pub(crate) fn encode(self) -> u64 {
        match self {
            EventToken::MultiWake => WAKE_DATA,
            EventToken::Client(id, kind) => {
                let kind = match kind {
                    EventKind::Audio => 0,
                    EventKind::Control => 1,
                    EventKind::Drain => 2,
                };
                ((id.0 as u64) << 8) | kind
            }
        }
    }

    pub(crate) fn decode(data: u64) -> Option<Self> {
        if data == WAKE_DATA {
            return Some(EventToken::MultiWake);
        }
        let id = ClientId((data >> 8) as u32);
        let kind = match data & 0xff {
            0 => EventKind::Audio,
            1 => EventKind::Control,
            2 => EventKind::Drain,
            _ => return None,
        };
        Some(EventToken::Client(id, kind))
    }
}

/// The epoll set driving one multi thread.
pub(crate) struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub(crate) fn new() -> Result<Self, Errno> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
        })
    }

    pub(crate) fn register<F: AsFd>(
        &self,
        fd: F,
        flags: EpollFlags,
        token: EventToken,
    ) -> Result<(), Errno> {
        self.epoll.add(fd, EpollEvent::new(flags, token.encode()))
    }

    pub(crate) fn deregister<F: AsFd>(&self, fd: F) {
        // ENOENT here only means the descriptor was never watched.
        let _ = self.epoll.delete(fd);
    }

    /// Block until at least one event is ready. Interrupted waits are retried.
    pub(crate) fn wait(&self, events: &mut [EpollEvent]) -> Result<usize, Errno> {
        loop {
            match self.epoll.wait(events, EpollTimeout::NONE) {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        }
    }
}

/// Message carried by the wake channel into the multi thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeMessage {
    /// New work is pending; the count is the number of coalesced wakes.
    Data(u64),
    /// The thread must terminate.
    Shutdown,
}

/// Binary wake signal into the multi thread.
pub(crate) struct WakeChannel {
    doorbell: EventFd,
    shutdown: AtomicBool,
}

impl WakeChannel {
    pub(crate) fn new() -> Result<Self, Errno> {
        Ok(Self {
            doorbell: EventFd::from_value_and_flags(
                0,
                EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK,
            )?,
            shutdown: AtomicBool::new(false),
        })
    }

    pub(crate) fn post(&self, message: WakeMessage) {
        let count = match message {
            WakeMessage::Data(count) => count.max(1),
            WakeMessage::Shutdown => {
                self.shutdown.store(true, Ordering::Release);
                1
            }
        };
        // EAGAIN only once the counter is about to overflow, and it is
        // already non-zero then.
        let _ = self.doorbell.write(count);
    }

    /// Consume pending wakes. Returns `None` when the doorbell was not rung.
    pub(crate) fn take(&self) -> Option<WakeMessage> {
        let count = self.doorbell.read().ok();
        if self.shutdown.load(Ordering::Acquire) {
            return Some(WakeMessage::Shutdown);
        }
        count.map(WakeMessage::Data)
    }

    /// Re-arm after a shutdown so a new thread can be started.
    pub(crate) fn rearm(&self) {
        self.shutdown.store(false, Ordering::Release);
        let _ = self.doorbell.read();
    }

    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        self.doorbell.as_fd()
    }
}

/// Binary "data ready" signal from the multi thread to the transport thread.
pub(crate) struct DataReady {
    signal: EventFd,
}

impl DataReady {
    pub(crate) fn new() -> Result<Self, Errno> {
        Ok(Self {
            signal: EventFd::from_value_and_flags(
                0,
                EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK,
            )?,
        })
    }

    pub(crate) fn raise(&self) {
        let _ = self.signal.write(1);
    }

    /// Clear the signal. Never blocks.
    pub(crate) fn clear(&self) -> bool {
        self.signal.read().is_ok()
    }

    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        self.signal.as_fd()
    }
}
