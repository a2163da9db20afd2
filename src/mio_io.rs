//! The socket multiplexer shared by all connections.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic;
use std::time::Duration;

use parking_lot::Mutex;

/// Token of the waker used to interrupt a blocking poll.
pub const WAKE_TOKEN: mio::Token = mio::Token(0);
/// Token of the listening socket.
pub const LISTENER_TOKEN: mio::Token = mio::Token(1);

#[derive(Debug)]
pub struct TokenTally {
	tally: atomic::AtomicUsize,
}

impl TokenTally {
	/// Create a new [TokenTally] that starts after the reserved tokens.
	pub fn new() -> TokenTally {
		TokenTally {
			tally: atomic::AtomicUsize::new(LISTENER_TOKEN.0 + 1),
		}
	}

	/// Get the next token to use.
	pub fn next(&self) -> mio::Token {
		let t = self.tally.fetch_add(1, atomic::Ordering::AcqRel);
		assert_ne!(t, usize::max_value(), "mio token overflow");
		mio::Token(t)
	}
}

/// A socket that became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
	pub token: mio::Token,
	pub readable: bool,
	pub writable: bool,
}

struct Polled {
	poll: mio::Poll,
	events: mio::Events,
	ready: VecDeque<Readiness>,
}

/// Wraps a [mio::Poll] so that any thread can take the polling turn.
///
/// Sources are registered edge-triggered. Whoever handles a readiness event
/// must reregister the source when done to re-arm it.
pub struct Multiplexer {
	polled: Mutex<Polled>,
	registry: mio::Registry,
	waker: mio::Waker,
	tokens: TokenTally,
}

impl Multiplexer {
	pub fn new() -> io::Result<Multiplexer> {
		let poll = mio::Poll::new()?;
		let registry = poll.registry().try_clone()?;
		let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
		Ok(Multiplexer {
			polled: Mutex::new(Polled {
				poll,
				events: mio::Events::with_capacity(1024),
				ready: VecDeque::new(),
			}),
			registry,
			waker,
			tokens: TokenTally::new(),
		})
	}

	/// Get a fresh token for a new source.
	pub fn next_token(&self) -> mio::Token {
		self.tokens.next()
	}

	pub fn register<S>(&self, source: &mut S, token: mio::Token, interest: mio::Interest) -> io::Result<()>
	where
		S: mio::event::Source + ?Sized,
	{
		self.registry.register(source, token, interest)
	}

	pub fn reregister<S>(&self, source: &mut S, token: mio::Token, interest: mio::Interest) -> io::Result<()>
	where
		S: mio::event::Source + ?Sized,
	{
		self.registry.reregister(source, token, interest)
	}

	pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
	where
		S: mio::event::Source + ?Sized,
	{
		self.registry.deregister(source)
	}

	/// Interrupt a thread blocked in [Multiplexer::try_next].
	pub fn wake(&self) -> io::Result<()> {
		self.waker.wake()
	}

	/// Get the next ready socket, polling for at most `timeout` if none
	/// are queued.
	pub fn try_next(&self, timeout: Duration) -> io::Result<Option<Readiness>> {
		let mut polled = self.polled.lock();
		if let Some(ready) = polled.ready.pop_front() {
			return Ok(Some(ready));
		}

		let polled = &mut *polled;
		match polled.poll.poll(&mut polled.events, Some(timeout)) {
			Ok(()) => {}
			Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
			Err(e) => return Err(e),
		}

		for ev in polled.events.iter() {
			if ev.token() == WAKE_TOKEN {
				continue;
			}
			// Errors and hangups surface on the next read or write.
			polled.ready.push_back(Readiness {
				token: ev.token(),
				readable: ev.is_readable() || ev.is_read_closed() || ev.is_error(),
				writable: ev.is_writable() || ev.is_write_closed(),
			});
		}
		Ok(polled.ready.pop_front())
	}
}
