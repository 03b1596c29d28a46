//! Worker-side bridge - the spawned context's view of its creator
//!
//! Inside an execution context there is no `Worker` handle; worker code
//! talks back through a [`WorkerScope`], the shim's stand-in for the global
//! `postMessage`/`onmessage` pair the Web Worker contract puts on the worker
//! global object. Rather than true process-wide globals, each execution
//! context gets its own scope - a single-slot optional-callback register
//! with explicit install and clear operations - so multiple contexts in one
//! process never collide.
//!
//! Deliberate asymmetry with the creator side: inbound messages here are
//! handed to the callback as the raw parsed envelope object, not unwrapped
//! into an event shape.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::error::{WorkerError, WorkerResult};
use crate::host::ReplySender;

/// Callback invoked with each raw parsed message value
pub type ScopeHandler = Box<dyn FnMut(Value) + Send>;

struct ScopeSlot {
    onmessage: Option<ScopeHandler>,
    epoch: u64,
}

/// The ambient messaging surface of one execution context
///
/// Cloning is cheap and every clone shares the same callback slot, so the
/// host's dispatch loop and the worker's own code observe one register.
#[derive(Clone)]
pub struct WorkerScope {
    sender: Arc<dyn ReplySender>,
    slot: Arc<Mutex<ScopeSlot>>,
}

impl WorkerScope {
    /// Set up the bridge for one execution context. The `sender` is the
    /// host's reverse-direction primitive; everything sent through this
    /// scope goes back to the context's creator.
    pub fn install(sender: Arc<dyn ReplySender>) -> Self {
        Self {
            sender,
            slot: Arc::new(Mutex::new(ScopeSlot {
                onmessage: None,
                epoch: 0,
            })),
        }
    }

    /// Wrap `payload` in a `"message"` envelope stamped with the current
    /// time and hand it to the host's reverse-direction send primitive.
    ///
    /// Same envelope construction and failure semantics as the creator-side
    /// `post_message`.
    pub fn post_message<T: Serialize>(&self, payload: T) -> WorkerResult<()> {
        let data = serde_json::to_value(payload).map_err(WorkerError::Serialize)?;
        let wire = Envelope::message(data).to_wire()?;
        self.sender.send_from_context(&wire);
        Ok(())
    }

    /// Install the message callback, replacing any previous one
    pub fn set_onmessage<F>(&self, handler: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        let mut slot = self.slot.lock();
        slot.onmessage = Some(Box::new(handler));
        slot.epoch += 1;
    }

    pub fn clear_onmessage(&self) {
        let mut slot = self.slot.lock();
        slot.onmessage = None;
        slot.epoch += 1;
    }

    /// Parse a wire string and hand the raw parsed value to the `onmessage`
    /// slot - the whole envelope object, not just its `data` field.
    ///
    /// Malformed JSON propagates to the invoking frame; an unset slot
    /// silently discards the message.
    pub fn deliver(&self, wire: &str) -> WorkerResult<()> {
        let value: Value = serde_json::from_str(wire).map_err(WorkerError::Deserialize)?;

        let (handler, epoch) = {
            let mut slot = self.slot.lock();
            (slot.onmessage.take(), slot.epoch)
        };
        let Some(mut handler) = handler else {
            return Ok(());
        };

        handler(value);

        let mut slot = self.slot.lock();
        if slot.epoch == epoch {
            slot.onmessage = Some(handler);
        }
        Ok(())
    }
}
