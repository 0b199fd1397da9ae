//! HTTP API namespace.

pub mod converse;
pub mod internal;
pub mod request_context;
pub mod router;
pub mod sessions;

pub use router::create_router;
