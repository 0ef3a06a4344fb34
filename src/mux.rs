//! Readiness multiplexing.
//!
//! [`Multiplexer`] wraps the platform readiness facility through `mio`
//! (epoll, kqueue, IOCP or the `poll(2)` fallback, whichever the target
//! provides). Sources are always watched for read readiness; write readiness
//! is only requested while a socket has a backlog of unsent bytes.
//!
//! Registration goes through a shared [`mio::Registry`] and can happen from
//! any thread, concurrently with a [`Multiplexer::poll`] in progress.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

/// Reserved for waking up the poll loop. Never handed out to a source.
pub const WAKER: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;

/// A descriptor reported ready by [`Multiplexer::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    pub writable: bool,
}

impl Ready {
    pub fn readable(token: Token) -> Self {
        Self {
            token,
            writable: false,
        }
    }
}

struct Inner {
    poll: Poll,
    events: Events,
}

pub struct Multiplexer {
    inner: Mutex<Inner>,
    registry: mio::Registry,
    waker: Waker,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(&registry, WAKER)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            }),
            registry,
            waker,
        })
    }

    pub fn register<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.register(source, token, Interest::READABLE)
    }

    pub fn unregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.deregister(source)
    }

    /// Additionally watch `source` for write readiness.
    pub fn watch_writable<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry
            .reregister(source, token, Interest::READABLE | Interest::WRITABLE)
    }

    /// Go back to watching `source` for read readiness only.
    pub fn unwatch_writable<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.reregister(source, token, Interest::READABLE)
    }

    /// Wait up to `timeout` for ready descriptors.
    ///
    /// Returns an empty list on timeout, on a wakeup and when the wait was
    /// interrupted by a signal.
    pub fn poll(&self, timeout: Duration) -> io::Result<Vec<Ready>> {
        let mut inner = self.inner.lock();
        let Inner { poll, events } = &mut *inner;

        match poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let ready = events
            .iter()
            .filter(|event| event.token() != WAKER)
            .map(|event| Ready {
                token: event.token(),
                writable: event.is_writable(),
            })
            .collect();

        Ok(ready)
    }

    /// Make a concurrent or the next [`Multiplexer::poll`] return early.
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
