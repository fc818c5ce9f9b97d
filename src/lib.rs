//! # gatewire
//!
//! HTTP gateway that turns client requests into commands for backend
//! workers, and the SDK those workers are written with.
//!
//! ## Architecture
//!
//! - **Router**: resolves a service name to a worker connection, sends the
//!   command envelope and waits for the correlated reply
//! - **Bridge**: turns a worker stream into client events (SSE over HTTP)
//! - **Wire**: 25-byte frame header plus a MsgPack body, one codec per
//!   transport kind (unary or streaming)
//! - **Worker SDK**: typed handlers behind the same wire protocol
//!
//! ## Example
//!
//! ```ignore
//! use gatewire::codec::CodecKind;
//! use gatewire::envelope::{ChatPrompt, Command};
//! use gatewire::router::Router;
//! use gatewire::transport::Endpoint;
//! use futures::StreamExt;
//!
//! let router = Router::builder()
//!     .service("ai", CodecKind::Streaming, Endpoint::tcp("127.0.0.1:50051"))
//!     .start()
//!     .await?;
//!
//! let mut stream = router
//!     .open_stream("ai", Command::StreamChat(ChatPrompt { prompt: "hi".into() }))
//!     .await?;
//! while let Some(chunk) = stream.next().await {
//!     println!("{}", chunk?);
//! }
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod http;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod services;
pub mod transport;
pub mod worker;
pub mod writer;

pub use bridge::{bridge, BridgeEvent, StreamHandle};
pub use error::{GatewayError, Result, WorkerError};
pub use router::{Dispatched, Router, RouterBuilder};
pub use worker::{RequestContext, Worker, WorkerBuilder};
