//! Worker proxy - the creator-side handle for one execution context
//!
//! Emulates the standard Web Worker messaging contract on top of the host
//! primitives in [`crate::host`]:
//! - `Worker::new(host, location, options)` eagerly asks the host for an
//!   execution context bound to the script location
//! - `post_message` wraps the payload in a JSON envelope and hands it off
//! - `onmessage` / `onerror` / `onclose` are independently optional
//!   callback slots; only `onmessage` is ever fired by this shim
//! - `terminate` is a documented no-op; teardown is the host's business
//!
//! The shim establishes no ordering, no queueing, and no backpressure: a
//! message delivered while `onmessage` is unset is dropped, not buffered.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::envelope::Envelope;
use crate::error::{WorkerError, WorkerResult};
use crate::host::ExecutionHost;

/// Global counter for unique worker ids
static WORKER_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Identity of one worker proxy, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u32);

impl WorkerId {
    fn next() -> Self {
        WorkerId(WORKER_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// The event handed to a proxy's `onmessage` callback
///
/// Carries every field parsed out of the envelope, known or not, plus
/// `target`/`current_target`. Both are always the originating proxy's id;
/// there is no propagation or bubbling model here.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// User payload from the envelope's `data` field
    pub data: Value,
    /// Envelope `type` tag
    pub kind: String,
    /// Envelope `timeStamp`, milliseconds since the Unix epoch at send time
    pub time_stamp: u64,
    /// Envelope fields this shim does not know about
    pub extra: Map<String, Value>,
    pub target: WorkerId,
    pub current_target: WorkerId,
}

impl MessageEvent {
    fn from_envelope(envelope: Envelope, target: WorkerId) -> Self {
        Self {
            data: envelope.data,
            kind: envelope.kind,
            time_stamp: envelope.time_stamp,
            extra: envelope.extra,
            target,
            current_target: target,
        }
    }
}

/// Callback invoked with each delivered message event
pub type MessageHandler = Box<dyn FnMut(MessageEvent) + Send>;

/// Callback slot for error events; declared for interface compatibility,
/// never fired by this shim
pub type ErrorHandler = Box<dyn FnMut(Value) + Send>;

/// Callback slot for close events; declared for interface compatibility,
/// never fired by this shim
pub type CloseHandler = Box<dyn FnMut(Value) + Send>;

#[derive(Default)]
struct Slots {
    onmessage: Option<MessageHandler>,
    onerror: Option<ErrorHandler>,
    onclose: Option<CloseHandler>,
    /// Bumped on every `onmessage` assignment or clear, so an in-flight
    /// delivery can tell whether the handler it borrowed was replaced
    /// underneath it.
    message_epoch: u64,
}

impl Slots {
    fn set_onmessage(&mut self, handler: Option<MessageHandler>) {
        self.onmessage = handler;
        self.message_epoch += 1;
    }
}

/// The proxy's delivery surface, handed to the host at context creation
///
/// A cheap clone of the proxy's identity and callback slots, so the host
/// can invoke delivery at a time of its choosing without holding the
/// `Worker` itself.
#[derive(Clone)]
pub struct WorkerReceiver {
    id: WorkerId,
    slots: Arc<Mutex<Slots>>,
}

impl WorkerReceiver {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Parse a wire string and dispatch it to the `onmessage` slot.
    ///
    /// Malformed JSON is not caught here; it propagates to the frame that
    /// invoked delivery. An unset slot silently discards the message.
    pub fn deliver(&self, wire: &str) -> WorkerResult<()> {
        let envelope = Envelope::from_wire(wire)?;

        // Take the handler out of the slot for the duration of the call so
        // the callback can reassign slots or post on this worker without
        // deadlocking.
        let (handler, epoch) = {
            let mut slots = self.slots.lock();
            (slots.onmessage.take(), slots.message_epoch)
        };
        let Some(mut handler) = handler else {
            return Ok(());
        };

        handler(MessageEvent::from_envelope(envelope, self.id));

        // Put the handler back unless the callback installed or cleared one
        // itself while it was out.
        let mut slots = self.slots.lock();
        if slots.message_epoch == epoch {
            slots.onmessage = Some(handler);
        }
        Ok(())
    }
}

/// Creator-side handle representing one remote execution context
pub struct Worker<H: ExecutionHost> {
    id: WorkerId,
    host: Arc<H>,
    context: H::Context,
    slots: Arc<Mutex<Slots>>,
}

impl<H: ExecutionHost> Worker<H> {
    /// Ask the host to allocate and start an execution context bound to
    /// `script_location`, retaining the returned opaque reference.
    ///
    /// The location is not validated here; a host that cannot resolve it
    /// fails the call with whatever [`WorkerError::Spawn`] payload it
    /// chooses. `options` has no shape this shim cares about and is passed
    /// through opaquely.
    pub fn new(
        host: Arc<H>,
        script_location: impl AsRef<str>,
        options: Option<Value>,
    ) -> WorkerResult<Self> {
        let id = WorkerId::next();
        let slots = Arc::new(Mutex::new(Slots::default()));
        let receiver = WorkerReceiver {
            id,
            slots: Arc::clone(&slots),
        };
        let context = host.create_context(script_location.as_ref(), options.as_ref(), receiver)?;
        Ok(Self {
            id,
            host,
            context,
            slots,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Wrap `payload` in a `"message"` envelope stamped with the current
    /// time and hand it to the host send primitive. Fire-and-forget: returns
    /// as soon as the host accepts the wire string.
    ///
    /// Fails with [`WorkerError::Serialize`] if the payload is not
    /// representable as JSON; the error is the caller's to handle.
    pub fn post_message<T: Serialize>(&self, payload: T) -> WorkerResult<()> {
        let data = serde_json::to_value(payload).map_err(WorkerError::Serialize)?;
        let wire = Envelope::message(data).to_wire()?;
        self.host.send_to_context(&self.context, &wire);
        Ok(())
    }

    /// No-op. Does not release the host execution context and does not
    /// prevent further message delivery; hosts that need real teardown
    /// handle it out-of-band.
    pub fn terminate(&self) {}

    /// Install the message callback, replacing any previous one
    pub fn set_onmessage<F>(&self, handler: F)
    where
        F: FnMut(MessageEvent) + Send + 'static,
    {
        self.slots.lock().set_onmessage(Some(Box::new(handler)));
    }

    pub fn clear_onmessage(&self) {
        self.slots.lock().set_onmessage(None);
    }

    /// Install the error callback. The slot exists for interface
    /// compatibility; nothing in this shim fires it.
    pub fn set_onerror<F>(&self, handler: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.slots.lock().onerror = Some(Box::new(handler));
    }

    pub fn clear_onerror(&self) {
        self.slots.lock().onerror = None;
    }

    /// Install the close callback. The slot exists for interface
    /// compatibility; nothing in this shim fires it.
    pub fn set_onclose<F>(&self, handler: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.slots.lock().onclose = Some(Box::new(handler));
    }

    pub fn clear_onclose(&self) {
        self.slots.lock().onclose = None;
    }

    /// Borrow the opaque host context reference this handle owns
    pub fn context(&self) -> &H::Context {
        &self.context
    }

    /// The delivery surface the host was handed at construction
    pub fn receiver(&self) -> WorkerReceiver {
        WorkerReceiver {
            id: self.id,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Invoke the internal receive handler directly. Equivalent to the host
    /// calling [`WorkerReceiver::deliver`].
    pub fn deliver(&self, wire: &str) -> WorkerResult<()> {
        self.receiver().deliver(wire)
    }
}
