//! Handler registry for dispatching requests by command name.
//!
//! # Example
//!
//! ```ignore
//! use gatewire::envelope::{DispatchMode, NoteLookup};
//! use gatewire::worker::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("get_note_by_title", DispatchMode::Single, |lookup: NoteLookup, ctx| async move {
//!     ctx.respond(&lookup.id).await
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use super::RequestContext;
use crate::codec::decode_request_payload;
use crate::envelope::DispatchMode;
use crate::error::Result;
use crate::transport::BoxFuture;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request given the raw envelope body.
    fn call(&self, body: &[u8], ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes the envelope payload before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, body: &[u8], ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match decode_request_payload(body) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(parsed, ctx))
    }
}

struct CommandEntry {
    handler: Box<dyn Handler>,
    mode: DispatchMode,
}

/// Registry mapping command names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: HashMap<String, CommandEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a second registration for the same name replaces
    /// the first.
    pub fn register<F, T, Fut>(&mut self, command: &str, mode: DispatchMode, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.commands.insert(
            command.to_string(),
            CommandEntry {
                handler: Box::new(TypedHandler::new(handler)),
                mode,
            },
        );
    }

    pub fn get_handler(&self, command: &str) -> Option<&dyn Handler> {
        self.commands.get(command).map(|e| e.handler.as_ref())
    }

    pub fn get_mode(&self, command: &str) -> Option<DispatchMode> {
        self.commands.get(command).map(|e| e.mode)
    }

    /// Mode used to answer requests for commands nobody registered.
    ///
    /// A worker whose handlers all stream answers in stream frames, so the
    /// gateway's streaming codec can read the error.
    pub fn fallback_mode(&self) -> DispatchMode {
        let all_stream = !self.commands.is_empty()
            && self.commands.values().all(|e| e.mode == DispatchMode::Stream);
        if all_stream {
            DispatchMode::Stream
        } else {
            DispatchMode::Single
        }
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
