//! The workers behind the gateway.
//!
//! - [`note`] - notes as JSON files
//! - [`resource`] - uploaded files
//! - [`ai`] - streaming chat

pub mod ai;
pub mod note;
pub mod resource;

pub use ai::{ai_worker, ChatBackend, EchoBackend, OllamaBackend};
pub use note::{note_worker, Note, NoteStore};
pub use resource::{resource_worker, ResourceStore};
