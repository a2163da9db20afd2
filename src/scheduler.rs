//! An elastic produce/consume task engine.
//!
//! Every worker thread alternates between producing a task and running it.
//! Only one thread produces at a time. When the producing thread finds a
//! task and no other thread is left to produce, it spawns a new one before
//! running the task, up to a maximum. A thread that finds no work while
//! others are producing exits, so the pool shrinks back when idle.
//!
//! The producer may block while producing, for example polling sockets, but
//! only when it's the sole producer. Otherwise it's asked not to.

use std::{fmt, io, panic, thread};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::waitgroup::WaitGroup;

/// A unit of work.
pub struct Task {
	name: &'static str,
	job: Box<dyn FnOnce() + Send>,
}

impl Task {
	pub fn new(name: &'static str, job: impl FnOnce() + Send + 'static) -> Task {
		Task {
			name,
			job: Box::new(job),
		}
	}

	/// Name of the task, for logging.
	pub fn name(&self) -> &'static str {
		self.name
	}

	fn run(self) {
		(self.job)()
	}
}

impl fmt::Debug for Task {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Task({})", self.name)
	}
}

/// Produces the tasks for a [Scheduler].
pub trait Producer: Send + Sync + 'static {
	/// Produce the next task, if there is any.
	///
	/// If `can_block` is true, the producer may wait a short while for work
	/// to show up.
	fn produce_task(&self, can_block: bool) -> Option<Task>;

	/// Interrupt a blocking [Producer::produce_task] call.
	fn wake(&self) {}
}

impl<T: Producer> Producer for Arc<T> {
	fn produce_task(&self, can_block: bool) -> Option<Task> {
		(**self).produce_task(can_block)
	}

	fn wake(&self) {
		(**self).wake()
	}
}

/// Scheduler statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
	/// Threads currently alive.
	pub active_threads: usize,
	/// The most threads that were ever alive at once.
	pub greatest_active_threads: usize,
	/// Threads currently running a task.
	pub consumers: usize,
	pub tasks_produced: u64,
	pub tasks_consumed: u64,
	/// Times a thread was wanted but the maximum was reached or spawning
	/// failed.
	pub spawn_failures: u64,
}

struct State {
	stats: Stats,
	/// A spawned thread hasn't started producing yet.
	thread_pending: bool,
}

struct Shared<P> {
	name: String,
	producer: P,
	max_threads: usize,
	state: Mutex<State>,
	/// Held while producing.
	produce_lock: Mutex<()>,
	stopping: AtomicBool,
	/// Cloned into every thread, taken at shutdown.
	wg: Mutex<Option<WaitGroup>>,
}

/// Runs the tasks of a [Producer] on an elastic pool of threads.
pub struct Scheduler<P: Producer> {
	shared: Arc<Shared<P>>,
	wg: Mutex<Option<WaitGroup>>,
}

impl<P: Producer> Scheduler<P> {
	/// Create a new scheduler. No threads are started until [Scheduler::start].
	pub fn new(name: impl Into<String>, producer: P, max_threads: usize) -> Scheduler<P> {
		let wg = WaitGroup::new();
		Scheduler {
			shared: Arc::new(Shared {
				name: name.into(),
				producer,
				max_threads: max_threads.max(1),
				state: Mutex::new(State {
					stats: Stats::default(),
					thread_pending: false,
				}),
				produce_lock: Mutex::new(()),
				stopping: AtomicBool::new(false),
				wg: Mutex::new(Some(wg.clone())),
			}),
			wg: Mutex::new(Some(wg)),
		}
	}

	pub fn producer(&self) -> &P {
		&self.shared.producer
	}

	/// Start the first thread.
	pub fn start(&self) -> io::Result<()> {
		let mut state = self.shared.state.lock();
		if state.stats.active_threads > 0 {
			return Ok(());
		}
		state.stats.active_threads = 1;
		state.stats.greatest_active_threads = state.stats.greatest_active_threads.max(1);
		state.thread_pending = true;
		drop(state);

		if let Err(e) = spawn(&self.shared) {
			let mut state = self.shared.state.lock();
			state.stats.active_threads = 0;
			state.thread_pending = false;
			return Err(e);
		}
		Ok(())
	}

	pub fn stats(&self) -> Stats {
		self.shared.state.lock().stats
	}

	/// Stop producing and wait up to `grace` for running tasks to finish.
	///
	/// Returns false if some threads were still busy when the time ran out.
	pub fn shutdown(&self, grace: Duration) -> bool {
		self.shared.stopping.store(true, Ordering::SeqCst);
		self.shared.producer.wake();
		self.shared.wg.lock().take();

		match self.wg.lock().take() {
			Some(wg) => wg.wait_timeout(grace),
			None => true,
		}
	}
}

fn spawn<P: Producer>(shared: &Arc<Shared<P>>) -> io::Result<()> {
	let wg = match shared.wg.lock().clone() {
		Some(wg) => wg,
		None => return Err(io::Error::new(io::ErrorKind::Other, "scheduler stopped")),
	};
	let shared2 = shared.clone();
	thread::Builder::new()
		.name(format!("{}-worker", shared.name))
		.spawn(move || {
			run(&shared2);
			drop(wg);
		})
		.map(|_| ())
}

/// The loop of each worker thread.
fn run<P: Producer>(shared: &Arc<Shared<P>>) {
	shared.state.lock().thread_pending = false;

	loop {
		if shared.stopping.load(Ordering::SeqCst) {
			break;
		}

		let task = {
			let _producing = shared.produce_lock.lock();
			if shared.stopping.load(Ordering::SeqCst) {
				break;
			}
			let can_block = {
				let state = shared.state.lock();
				state.stats.active_threads - state.stats.consumers <= 1
			};
			shared.producer.produce_task(can_block)
		};

		let mut state = shared.state.lock();
		let task = match task {
			Some(t) => t,
			None => {
				// Leave the producing to the others.
				if state.stats.active_threads - state.stats.consumers > 1 {
					state.stats.active_threads -= 1;
					trace!("Idle {} thread exiting", shared.name);
					return;
				}
				continue;
			}
		};

		state.stats.tasks_produced += 1;
		state.stats.consumers += 1;
		// Nobody is left to produce.
		if !state.thread_pending && state.stats.active_threads == state.stats.consumers {
			if state.stats.active_threads < shared.max_threads {
				state.thread_pending = true;
				state.stats.active_threads += 1;
				state.stats.greatest_active_threads =
					state.stats.greatest_active_threads.max(state.stats.active_threads);
				drop(state);

				if let Err(e) = spawn(shared) {
					if !shared.stopping.load(Ordering::SeqCst) {
						warn!("Failed to spawn {} thread: {}", shared.name, e);
					}
					let mut state = shared.state.lock();
					state.thread_pending = false;
					state.stats.active_threads -= 1;
					state.stats.spawn_failures += 1;
				}
			} else {
				state.stats.spawn_failures += 1;
				drop(state);
			}
		} else {
			drop(state);
		}

		let name = task.name();
		trace!("Running {} task", name);
		if panic::catch_unwind(panic::AssertUnwindSafe(|| task.run())).is_err() {
			warn!("Task {} panicked", name);
		}

		let mut state = shared.state.lock();
		state.stats.consumers -= 1;
		state.stats.tasks_consumed += 1;
	}

	shared.state.lock().stats.active_threads -= 1;
	trace!("{} thread stopped", shared.name);
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;
	use std::time::Instant;

	/// Hands out a fixed number of tasks that each take a while.
	struct Counted {
		remaining: AtomicUsize,
		done: Arc<AtomicUsize>,
		task_time: Duration,
	}

	impl Counted {
		fn new(tasks: usize, task_time: Duration) -> Counted {
			Counted {
				remaining: AtomicUsize::new(tasks),
				done: Arc::new(AtomicUsize::new(0)),
				task_time,
			}
		}
	}

	impl Producer for Counted {
		fn produce_task(&self, can_block: bool) -> Option<Task> {
			let left = self.remaining.load(Ordering::SeqCst);
			if left == 0 {
				if can_block {
					thread::sleep(Duration::from_millis(5));
				}
				return None;
			}
			self.remaining.store(left - 1, Ordering::SeqCst);

			let done = self.done.clone();
			let time = self.task_time;
			Some(Task::new("count", move || {
				thread::sleep(time);
				done.fetch_add(1, Ordering::SeqCst);
			}))
		}
	}

	fn wait_for(mut f: impl FnMut() -> bool) -> bool {
		let start = Instant::now();
		while start.elapsed() < Duration::from_secs(10) {
			if f() {
				return true;
			}
			thread::sleep(Duration::from_millis(5));
		}
		false
	}

	#[test]
	fn runs_all_tasks() {
		let sched = Scheduler::new("test", Counted::new(100, Duration::from_millis(0)), 4);
		let done = sched.producer().done.clone();
		sched.start().unwrap();

		assert!(wait_for(|| done.load(Ordering::SeqCst) == 100));
		assert!(wait_for(|| sched.stats().tasks_consumed == 100));
		let stats = sched.stats();
		assert_eq!(stats.tasks_produced, 100);
		assert!(stats.active_threads >= 1);
		assert!(sched.shutdown(Duration::from_secs(5)));
		assert_eq!(sched.stats().active_threads, 0);
	}

	#[test]
	fn grows_and_shrinks() {
		let sched = Scheduler::new("test", Counted::new(8, Duration::from_millis(100)), 4);
		let done = sched.producer().done.clone();
		sched.start().unwrap();

		assert!(wait_for(|| done.load(Ordering::SeqCst) == 8));
		let stats = sched.stats();
		assert!(stats.greatest_active_threads > 1);
		assert!(stats.greatest_active_threads <= 4);

		// Idle again, down to the single producing thread.
		assert!(wait_for(|| sched.stats().active_threads == 1));
		assert!(sched.shutdown(Duration::from_secs(5)));
	}

	#[test]
	fn survives_panics() {
		struct Panicky(AtomicUsize);
		impl Producer for Panicky {
			fn produce_task(&self, _: bool) -> Option<Task> {
				match self.0.fetch_add(1, Ordering::SeqCst) {
					0 => Some(Task::new("panic", || panic!("boom"))),
					_ => {
						thread::sleep(Duration::from_millis(5));
						None
					}
				}
			}
		}

		let sched = Scheduler::new("test", Panicky(AtomicUsize::new(0)), 2);
		sched.start().unwrap();
		assert!(wait_for(|| sched.stats().tasks_consumed == 1));
		assert!(sched.shutdown(Duration::from_secs(5)));
	}
}
