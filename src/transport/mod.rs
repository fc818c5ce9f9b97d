//! Transport module - connections between the gateway and its workers.
//!
//! Provides:
//! - [`Endpoint`] - worker address (TCP or Unix domain socket)
//! - [`EndpointListener`] - worker-side listener
//! - [`ConnectionFactory`] - how the router (re)connects to a service

mod endpoint;

pub use endpoint::{
    BoxFuture, BoxReader, BoxWriter, ConnectionFactory, Endpoint, EndpointListener,
};
