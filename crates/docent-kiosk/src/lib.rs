//! Docent kiosk - the client side of the playout contract.
//!
//! The server stamps every visual with a `playout_ts` on its own timeline;
//! this crate learns a one-shot clock offset, preloads images ahead of their
//! show instant, and crossfades them in at the converted local time. The
//! offset is never re-learned mid-session: long-run drift is traded away for
//! complete absence of scheduling jitter from re-sync events.

pub mod clock;
pub mod crossfade;
pub mod scheduler;

pub use clock::ClockSync;
pub use crossfade::{CrossfadeSurface, ImageHandle};
pub use scheduler::{
    FetchError, HttpImageFetcher, ImageFetcher, PlayoutConfig, PlayoutScheduler, PlayoutStats,
};
