//! Docent core - shared protocol and domain types.
//!
//! Everything both sides of the wire agree on lives here: the datachannel
//! control messages, the timeline the language model emits, the image
//! catalogue and its resolver, and the conversation turn types.

pub mod catalog;
pub mod chat;
pub mod error;
pub mod messages;
pub mod timeline;

pub use catalog::{Catalog, ImageDescriptor, Resolution};
pub use chat::{ChatRole, ChatTurn};
pub use error::{CoreError, Result};
pub use messages::{ControlMessage, Transition};
pub use timeline::{parse_llm_reply, ImageRef, LlmReply, TimelineAction, TimelineEvent};
