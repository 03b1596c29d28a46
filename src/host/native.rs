//! In-process reference host
//!
//! An [`ExecutionHost`] that runs each execution context on its own OS
//! thread with a mailbox event loop. Worker "scripts" are Rust entry
//! functions registered under a location string; asking for an unregistered
//! location fails at spawn time.
//!
//! Host-defined delivery discipline, documented per the host contract:
//! - inbound messages are dispatched at-most-once, in mailbox order, on the
//!   context thread
//! - replies reach the creator's receiver synchronously on the context
//!   thread
//! - wire strings that fail to parse are logged and dropped by the loop
//!   rather than killing the context
//! - dropping the context handle shuts the loop down and joins the thread
//!
//! Contexts also get a timer facility (`set_timeout`, `set_interval`,
//! `clear_timer`); timer callbacks run on the context thread, interleaved
//! with message dispatch, driven by a min-heap of deadlines.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::bridge::WorkerScope;
use crate::error::{WorkerError, WorkerResult};
use crate::host::{ExecutionHost, ReplySender};
use crate::worker::{WorkerId, WorkerReceiver};

/// Entry function run inside a spawned execution context
pub type WorkerEntry = Arc<dyn Fn(&WorkerContext) + Send + Sync>;

// ============================================================================
// Mailbox
// ============================================================================

enum ContextTask {
    /// Wire string inbound from the creator
    Message(String),
    Shutdown,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<ContextTask>>,
    ready: Condvar,
}

impl Mailbox {
    fn push(&self, task: ContextTask) {
        self.queue.lock().push_back(task);
        self.ready.notify_one();
    }

    /// Pop the next task, waiting up to `timeout` (or indefinitely when
    /// `None`) for one to arrive.
    fn wait_pop(&self, timeout: Option<Duration>) -> Option<ContextTask> {
        let mut queue = self.queue.lock();
        match timeout {
            Some(timeout) => {
                if queue.is_empty() {
                    self.ready.wait_for(&mut queue, timeout);
                }
            }
            None => {
                while queue.is_empty() {
                    self.ready.wait(&mut queue);
                }
            }
        }
        queue.pop_front()
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Handle to one scheduled timer, scoped to its execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

enum TimerTask {
    Once(Box<dyn FnOnce() + Send>),
    Repeat(Box<dyn FnMut() + Send>, Duration),
}

/// A timer entry in the priority queue
struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    task: TimerTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    /// Ids with a heap entry, plus repeat timers whose callback is running.
    /// `cancelled` is always a subset of this, so clearing an id that
    /// already fired leaves nothing behind.
    live: HashSet<TimerId>,
    cancelled: HashSet<TimerId>,
}

#[derive(Default)]
struct TimerQueue {
    state: Mutex<TimerState>,
    counter: AtomicU64,
}

impl TimerQueue {
    fn schedule(&self, deadline: Instant, task: TimerTask) -> TimerId {
        let id = TimerId(self.counter.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock();
        state.live.insert(id);
        state.heap.push(TimerEntry { deadline, id, task });
        id
    }

    /// Push the next round of a repeat timer; its id is still live
    fn reschedule(&self, id: TimerId, deadline: Instant, task: TimerTask) {
        self.state.lock().heap.push(TimerEntry { deadline, id, task });
    }

    /// Mark a pending timer cancelled. Ids that are no longer scheduled are
    /// ignored outright.
    fn cancel(&self, id: TimerId) {
        let mut state = self.state.lock();
        if state.live.contains(&id) {
            state.cancelled.insert(id);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().heap.peek().map(|entry| entry.deadline)
    }

    /// Pop the next entry due at `now`, discarding cancelled ones
    fn pop_due(&self, now: Instant) -> Option<TimerEntry> {
        let mut state = self.state.lock();
        loop {
            let due = state.heap.peek().map(|entry| entry.deadline <= now)?;
            if !due {
                return None;
            }
            let entry = state.heap.pop()?;
            if state.cancelled.remove(&entry.id) {
                state.live.remove(&entry.id);
                continue;
            }
            // A one-shot is finished once popped; a repeat stays live while
            // its callback runs so the callback can still clear it.
            if matches!(&entry.task, TimerTask::Once(_)) {
                state.live.remove(&entry.id);
            }
            return Some(entry);
        }
    }

    /// Retire a repeat timer's round after its callback ran. Returns true
    /// if the timer was cleared in the meantime and must not be rescheduled.
    fn finish_repeat(&self, id: TimerId) -> bool {
        let mut state = self.state.lock();
        if state.cancelled.remove(&id) {
            state.live.remove(&id);
            true
        } else {
            false
        }
    }
}

/// Run every timer whose deadline has passed
fn fire_due_timers(timers: &TimerQueue) {
    let now = Instant::now();
    while let Some(entry) = timers.pop_due(now) {
        match entry.task {
            TimerTask::Once(callback) => callback(),
            TimerTask::Repeat(mut callback, period) => {
                callback();
                if !timers.finish_repeat(entry.id) {
                    timers.reschedule(
                        entry.id,
                        Instant::now() + period,
                        TimerTask::Repeat(callback, period),
                    );
                }
            }
        }
    }
}

// ============================================================================
// Worker context - what an entry function sees
// ============================================================================

/// The execution context's view of itself: its messaging scope, the opaque
/// options the creator passed, and a timer facility
///
/// Clones share the same scope and timer queue, so entry functions can move
/// a clone into timer or message callbacks.
#[derive(Clone)]
pub struct WorkerContext {
    scope: WorkerScope,
    options: Option<Value>,
    timers: Arc<TimerQueue>,
}

impl WorkerContext {
    /// The messaging bridge for this context
    pub fn scope(&self) -> &WorkerScope {
        &self.scope
    }

    /// The options value the creator passed, untouched
    pub fn options(&self) -> Option<&Value> {
        self.options.as_ref()
    }

    /// Send a payload back to the creator. See [`WorkerScope::post_message`].
    pub fn post_message<T: Serialize>(&self, payload: T) -> WorkerResult<()> {
        self.scope.post_message(payload)
    }

    /// Install the context's message callback
    pub fn set_onmessage<F>(&self, handler: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.scope.set_onmessage(handler);
    }

    pub fn clear_onmessage(&self) {
        self.scope.clear_onmessage();
    }

    /// Run `callback` once on this context's thread after `delay`
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.timers
            .schedule(Instant::now() + delay, TimerTask::Once(Box::new(callback)))
    }

    /// Run `callback` on this context's thread every `period`
    pub fn set_interval<F>(&self, period: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timers.schedule(
            Instant::now() + period,
            TimerTask::Repeat(Box::new(callback), period),
        )
    }

    /// Cancel a pending timeout or interval. Cancelling a timer that already
    /// fired (or was never scheduled here) does nothing.
    pub fn clear_timer(&self, id: TimerId) {
        self.timers.cancel(id);
    }
}

// ============================================================================
// Reply path - context thread back to the creator
// ============================================================================

struct NativeReply {
    receiver: WorkerReceiver,
}

impl ReplySender for NativeReply {
    fn send_from_context(&self, wire: &str) {
        // Synchronous delivery on the context thread; a malformed reply is
        // the host's to report, since nothing above this frame handles it.
        if let Err(err) = self.receiver.deliver(wire) {
            error!(worker = %self.receiver.id(), %err, "dropping malformed reply");
        }
    }
}

// ============================================================================
// The host
// ============================================================================

/// Opaque context reference returned by [`ThreadHost::create_context`],
/// owned by the `Worker` that requested it
pub struct NativeContext {
    mailbox: Arc<Mailbox>,
    thread: Option<JoinHandle<()>>,
    worker_id: WorkerId,
}

impl Drop for NativeContext {
    fn drop(&mut self) {
        self.mailbox.push(ContextTask::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(worker = %self.worker_id, "execution context released");
    }
}

/// An in-process host that backs each execution context with an OS thread
#[derive(Default)]
pub struct ThreadHost {
    scripts: Mutex<HashMap<String, WorkerEntry>>,
}

impl ThreadHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the entry function behind a script location. Re-registering
    /// a location replaces its entry.
    pub fn register<F>(&self, location: impl Into<String>, entry: F)
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        self.scripts.lock().insert(location.into(), Arc::new(entry));
    }
}

impl ExecutionHost for ThreadHost {
    type Context = NativeContext;

    fn create_context(
        &self,
        script_location: &str,
        options: Option<&Value>,
        receiver: WorkerReceiver,
    ) -> WorkerResult<NativeContext> {
        let entry = self
            .scripts
            .lock()
            .get(script_location)
            .cloned()
            .ok_or_else(|| {
                WorkerError::spawn(format!("script does not exist: '{script_location}'"))
            })?;

        let worker_id = receiver.id();
        let mailbox = Arc::new(Mailbox::default());
        let loop_mailbox = Arc::clone(&mailbox);
        let options = options.cloned();

        let thread = thread::Builder::new()
            .name(worker_id.to_string())
            .spawn(move || run_context(entry, options, receiver, loop_mailbox))
            .map_err(|err| WorkerError::Spawn(Box::new(err)))?;

        debug!(worker = %worker_id, script = script_location, "spawned execution context");
        Ok(NativeContext {
            mailbox,
            thread: Some(thread),
            worker_id,
        })
    }

    fn send_to_context(&self, context: &NativeContext, wire: &str) {
        context.mailbox.push(ContextTask::Message(wire.to_string()));
    }
}

/// The per-context event loop: run the entry function, then alternate
/// between firing due timers and dispatching mailbox tasks until shutdown
fn run_context(
    entry: WorkerEntry,
    options: Option<Value>,
    receiver: WorkerReceiver,
    mailbox: Arc<Mailbox>,
) {
    let worker_id = receiver.id();
    let scope = WorkerScope::install(Arc::new(NativeReply { receiver }));
    let timers = Arc::new(TimerQueue::default());
    let context = WorkerContext {
        scope: scope.clone(),
        options,
        timers: Arc::clone(&timers),
    };

    entry(&context);

    loop {
        fire_due_timers(&timers);

        let timeout = timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        match mailbox.wait_pop(timeout) {
            Some(ContextTask::Message(wire)) => {
                if let Err(err) = scope.deliver(&wire) {
                    error!(worker = %worker_id, %err, "dropping malformed message");
                }
            }
            Some(ContextTask::Shutdown) => break,
            // Woke for a timer deadline; the next iteration fires it
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use serde_json::json;
    use std::sync::mpsc;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    /// Host with an echo script: replies to each message with its `data`
    /// field wrapped in `{"echo": ...}`
    fn echo_host() -> Arc<ThreadHost> {
        let host = ThreadHost::new();
        host.register("echo.js", |ctx| {
            let reply = ctx.clone();
            ctx.set_onmessage(move |message| {
                let _ = reply.post_message(json!({ "echo": message["data"] }));
            });
        });
        Arc::new(host)
    }

    fn collect_events(worker: &Worker<ThreadHost>) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel();
        worker.set_onmessage(move |event| {
            let _ = tx.send(event.data);
        });
        rx
    }

    #[test]
    fn test_end_to_end_echo() {
        let host = echo_host();
        let worker = Worker::new(host, "echo.js", None).unwrap();
        let rx = collect_events(&worker);

        worker.post_message("ping").unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), json!({ "echo": "ping" }));
    }

    #[test]
    fn test_mailbox_order_is_preserved() {
        let host = echo_host();
        let worker = Worker::new(host, "echo.js", None).unwrap();
        let rx = collect_events(&worker);

        for i in 0..5 {
            worker.post_message(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), json!({ "echo": i }));
        }
    }

    #[test]
    fn test_unknown_script_fails_at_spawn() {
        let host = Arc::new(ThreadHost::new());
        let result = Worker::new(host, "missing.js", None);
        assert!(matches!(result, Err(WorkerError::Spawn(_))));
    }

    #[test]
    fn test_options_pass_through_opaquely() {
        let host = ThreadHost::new();
        host.register("options.js", |ctx| {
            let reply = ctx.clone();
            let options = ctx.options().cloned().unwrap_or(Value::Null);
            ctx.set_onmessage(move |_| {
                let _ = reply.post_message(options.clone());
            });
        });

        let options = json!({ "type": "module", "name": "counter" });
        let worker = Worker::new(Arc::new(host), "options.js", Some(options.clone())).unwrap();
        let rx = collect_events(&worker);

        worker.post_message("describe yourself").unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), options);
    }

    #[test]
    fn test_set_timeout_fires_once() {
        let host = ThreadHost::new();
        host.register("timer.js", |ctx| {
            let outer = ctx.clone();
            ctx.set_onmessage(move |_| {
                let reply = outer.clone();
                outer.set_timeout(Duration::from_millis(10), move || {
                    let _ = reply.post_message("tick");
                });
            });
        });

        let worker = Worker::new(Arc::new(host), "timer.js", None).unwrap();
        let rx = collect_events(&worker);

        worker.post_message("start").unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), json!("tick"));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_interval_stops_when_cleared() {
        let host = ThreadHost::new();
        host.register("interval.js", |ctx| {
            let outer = ctx.clone();
            ctx.set_onmessage(move |_| {
                let inner = outer.clone();
                let timer_slot = Arc::new(Mutex::new(None));
                let held = Arc::clone(&timer_slot);
                let mut ticks = 0u32;
                let id = outer.set_interval(Duration::from_millis(5), move || {
                    ticks += 1;
                    let _ = inner.post_message(ticks);
                    if ticks == 3 {
                        if let Some(id) = *held.lock() {
                            inner.clear_timer(id);
                        }
                    }
                });
                *timer_slot.lock() = Some(id);
            });
        });

        let worker = Worker::new(Arc::new(host), "interval.js", None).unwrap();
        let rx = collect_events(&worker);

        worker.post_message("start").unwrap();
        for expected in 1..=3u32 {
            assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), json!(expected));
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_cleared_timeout_never_fires() {
        let host = ThreadHost::new();
        host.register("cancel.js", |ctx| {
            let outer = ctx.clone();
            ctx.set_onmessage(move |_| {
                let stale = outer.clone();
                let id = outer.set_timeout(Duration::from_millis(20), move || {
                    let _ = stale.post_message("must not fire");
                });
                outer.clear_timer(id);

                let reply = outer.clone();
                outer.set_timeout(Duration::from_millis(40), move || {
                    let _ = reply.post_message("done");
                });
            });
        });

        let worker = Worker::new(Arc::new(host), "cancel.js", None).unwrap();
        let rx = collect_events(&worker);

        worker.post_message("start").unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), json!("done"));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_clearing_fired_timers_leaves_no_residue() {
        let timers = TimerQueue::default();

        let ids: Vec<TimerId> = (0..100)
            .map(|_| timers.schedule(Instant::now(), TimerTask::Once(Box::new(|| {}))))
            .collect();
        fire_due_timers(&timers);

        // Clearing after the fact, like a debounce pattern does every
        // message, must not accumulate bookkeeping
        for id in ids {
            timers.cancel(id);
        }

        let state = timers.state.lock();
        assert!(state.heap.is_empty());
        assert!(state.live.is_empty());
        assert!(state.cancelled.is_empty());
    }

    #[test]
    fn test_clearing_pending_timers_leaves_no_residue() {
        let timers = TimerQueue::default();

        let once = timers.schedule(Instant::now(), TimerTask::Once(Box::new(|| {})));
        let repeat = timers.schedule(
            Instant::now(),
            TimerTask::Repeat(Box::new(|| {}), Duration::from_millis(5)),
        );
        timers.cancel(once);
        timers.cancel(repeat);
        fire_due_timers(&timers);

        let state = timers.state.lock();
        assert!(state.heap.is_empty());
        assert!(state.live.is_empty());
        assert!(state.cancelled.is_empty());
    }

    #[test]
    fn test_malformed_inbound_wire_does_not_kill_the_loop() {
        let host = echo_host();
        let worker = Worker::new(Arc::clone(&host), "echo.js", None).unwrap();
        let rx = collect_events(&worker);

        // Bypass post_message and shove garbage straight into the mailbox
        host.send_to_context(worker_context(&worker), ". garbage .");
        worker.post_message("still alive").unwrap();
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            json!({ "echo": "still alive" })
        );
    }

    #[test]
    fn test_drop_joins_the_context_thread() {
        let host = echo_host();
        let worker = Worker::new(host, "echo.js", None).unwrap();
        worker.post_message("ping").unwrap();
        drop(worker);
    }

    /// Reach the opaque context reference for host-level tests
    fn worker_context<'a>(worker: &'a Worker<ThreadHost>) -> &'a NativeContext {
        worker.context()
    }
}
