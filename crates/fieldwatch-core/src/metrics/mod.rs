//! Derived statistics over the reading store
//!
//! Nothing here is stored: summaries, lot metrics and quality levels are pure
//! functions of the current buffers, recomputed whenever a consumer asks.

mod lot;
mod quality;
mod summary;

pub use lot::*;
pub use quality::*;
pub use summary::*;
