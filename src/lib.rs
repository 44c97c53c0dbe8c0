//! Matrix channel adapter.
//!
//! Bridges Matrix rooms to an in-process message bus consumed by an agent.
//! The adapter admits inbound room messages according to a configurable
//! policy, keeps typing notices consistent around processing and replies,
//! and drives the long-poll sync loop with retry and graceful shutdown.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod channels;
pub mod config;
pub mod logging;
pub mod markdown;
