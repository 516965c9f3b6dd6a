//! Transport-independent live telemetry core for fieldwatch
//!
//! This crate owns everything between the farm backend and the IoT dashboards:
//! the per-sensor reading store, retention and live/historical window
//! handling, the bootstrap fetch planner, the push channel adapter, and the
//! derived per-sensor summaries and per-lot metrics.
//!
//! It is `#![no_std]` with `extern crate alloc` so it carries no opinion about
//! the HTTP client, socket library or executor in use. The desktop simulator
//! and the unit tests drive it on the host.

#![no_std]

extern crate alloc;

pub mod config;
pub mod dashboard;
pub mod live;
pub mod metrics;
pub mod resolver;
pub mod sensors;
pub mod source;
pub mod storage;
pub mod time;
