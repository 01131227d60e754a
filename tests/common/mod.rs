//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `test_utils`: tracing setup, deterministic frame stepping and a
//!   client/server pair connected over a [`LoopbackTransport`]
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! mod common;
//! use common::test_utils::{advance, LoopbackSession};
//! // Or use the re-exported items:
//! use common::{advance, LoopbackSession};
//! ```
//!
//! [`LoopbackTransport`]: command_frame_net::LoopbackTransport

pub mod test_utils;

// Re-export commonly used items for convenience.
// These are public utilities for integration tests - allow unused until tests adopt them.
#[allow(unused_imports)]
pub use test_utils::{
    advance, advance_by, init_tracing, move_atom, LoopbackSession, RecordingProcedure, MOVE_ACTION,
};
