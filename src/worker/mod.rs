//! Worker SDK - the backend side of the wire protocol.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps command names to typed handlers
//! - [`RequestContext`] - lets handlers respond, stream, fail
//! - [`Worker`] / [`WorkerBuilder`] - accept gateway connections and run
//!   handlers
//!
//! # Example
//!
//! ```ignore
//! use gatewire::worker::Worker;
//!
//! let worker = Worker::builder("note")
//!     .handle("get_note_by_title", |lookup: NoteLookup, ctx| async move {
//!         ctx.respond(&store.load(&lookup.id)?).await
//!     })
//!     .build();
//! ```

mod context;
mod registry;
mod server;

pub use context::RequestContext;
pub use registry::{Handler, HandlerRegistry, HandlerResult, TypedHandler};
pub use server::{to_worker_error, Worker, WorkerBuilder, DEFAULT_MAX_CONCURRENT_HANDLERS};
