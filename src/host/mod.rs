//! Host collaborator interface
//!
//! The shim never starts threads, processes, or script engines itself; it
//! consumes an embedding host that knows how to materialize an execution
//! context for a script location and move opaque wire strings across the
//! boundary in both directions. Delivery timing, ordering, and
//! at-most/at-least-once guarantees are entirely host-defined and must be
//! documented by each host implementation.

use serde_json::Value;

use crate::error::WorkerResult;
use crate::worker::WorkerReceiver;

pub mod native;

pub use native::{ThreadHost, TimerId, WorkerContext, WorkerEntry};

/// The creator-side host primitives consumed by [`crate::Worker`]
pub trait ExecutionHost {
    /// Opaque reference to one running execution context, owned by the
    /// `Worker` that requested it.
    type Context;

    /// Allocate and start an execution context bound to `script_location`.
    ///
    /// `options` is passed through opaquely; no validation of the location
    /// happens on the calling side. The `receiver` is the proxy's delivery
    /// surface: the host invokes it with wire strings coming back out of
    /// the context, at a time of the host's choosing.
    fn create_context(
        &self,
        script_location: &str,
        options: Option<&Value>,
        receiver: WorkerReceiver,
    ) -> WorkerResult<Self::Context>;

    /// Enqueue a wire string for delivery into the context. Fire-and-forget.
    fn send_to_context(&self, context: &Self::Context, wire: &str);
}

/// The reverse-direction primitive handed to the worker-side bridge
///
/// Called from inside an execution context to enqueue a wire string for
/// delivery back to the creator.
pub trait ReplySender: Send + Sync {
    fn send_from_context(&self, wire: &str);
}
