//! Krait - a Web Worker messaging shim for embedded script hosts
//!
//! Krait emulates the standard `Worker` messaging contract on top of a host
//! runtime's native primitives:
//! - `Worker`: creator-side proxy handle - `post_message` out,
//!   `onmessage`/`onerror`/`onclose` callback slots in
//! - `WorkerScope`: the bridge installed inside a spawned execution context,
//!   mirroring the proxy's interface from the other side
//! - `Envelope`: the `{data, type, timeStamp}` JSON wrapper every message
//!   crosses the boundary in
//! - `ExecutionHost`/`ReplySender`: the consumed host seam - how contexts
//!   are materialized and how wire strings move is the embedder's business
//! - `ThreadHost`: an in-process reference host backing each context with an
//!   OS thread, a mailbox event loop, and timers

pub mod bridge;
pub mod envelope;
pub mod error;
pub mod host;
pub mod worker;

// Re-export commonly used types
pub use bridge::WorkerScope;
pub use envelope::{Envelope, MESSAGE_TYPE};
pub use error::{WorkerError, WorkerResult};
pub use host::{ExecutionHost, ReplySender, ThreadHost, TimerId, WorkerContext};
pub use worker::{MessageEvent, Worker, WorkerId, WorkerReceiver};
