use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::thread_pool::{ThreadPool, ThreadPoolCurrent};

bitflags! {
    /// Socket operations a handler can be ready for.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Ready: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl Ready {
    pub(crate) fn to_interest(self) -> Option<Interest> {
        match (self.contains(Ready::READ), self.contains(Ready::WRITE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Something the thread pool drives I/O for: a connection or an acceptor.
///
/// `message` runs on a pool thread with the ready operations; it must
/// drain the socket until it would block (the selector is edge-triggered)
/// and call `pool.io_completed(current)` before running user code.
pub(crate) trait EventHandler: Send + Sync {
    fn message(self: Arc<Self>, pool: &Arc<ThreadPool>, ready: Ready, current: &mut ThreadPoolCurrent);

    /// Runs once after the handler was removed from the selector.
    fn finished(self: Arc<Self>, pool: &Arc<ThreadPool>);

    fn register_source(&self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;

    fn reregister_source(
        &self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister_source(&self, registry: &Registry) -> io::Result<()>;

    fn description(&self) -> String;
}

/// Token 0 wakes the leader out of `select`, for the work queue and for
/// shutdown.
const WAKE_TOKEN: Token = Token(0);

struct PollParts {
    poll: Poll,
    events: Events,
}

/// Readiness multiplexer: one leader thread at a time blocks in
/// [`Selector::select`]; registration happens from any thread through the
/// shared registry.
pub(crate) struct Selector {
    parts: Mutex<PollParts>,
    registry: Registry,
    waker: Waker,
    next_token: AtomicUsize,
}

impl Selector {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Selector {
            parts: Mutex::new(PollParts { poll, events: Events::with_capacity(256) }),
            registry,
            waker,
            next_token: AtomicUsize::new(1),
        })
    }

    pub fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Interrupt a blocked [`Selector::select`].
    pub fn wake(&self) {
        // A failed wake can only mean the poll is being torn down.
        let _ = self.waker.wake();
    }

    /// Block until readiness events arrive; coalesces per token.
    /// Returns true when the wake token fired.
    pub fn select(
        &self,
        timeout: Option<Duration>,
        out: &mut Vec<(Token, Ready)>,
    ) -> io::Result<bool> {
        let mut parts = self.parts.lock();
        let PollParts { poll, events } = &mut *parts;
        match poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e),
        }
        let mut woken = false;
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                woken = true;
                continue;
            }
            let mut ready = Ready::empty();
            if event.is_readable() || event.is_read_closed() {
                ready |= Ready::READ;
            }
            if event.is_writable() || event.is_write_closed() {
                ready |= Ready::WRITE;
            }
            if event.is_error() {
                // Surface errors through a read attempt.
                ready |= Ready::READ;
            }
            if ready.is_empty() {
                continue;
            }
            match out.iter_mut().find(|(t, _)| *t == event.token()) {
                Some((_, existing)) => *existing |= ready,
                None => out.push((event.token(), ready)),
            }
        }
        Ok(woken)
    }
}
