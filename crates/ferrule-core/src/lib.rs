//! Shared building blocks for ferrule servers.
//!
//! This crate holds the pieces every interceptor and registry agrees on: the
//! immutable identity of a call ([`call::CallDescriptor`]), exclusion
//! matching, outcome classification, the server state machine and the error
//! type surfaced by build and lifecycle steps.

mod common;
pub use common::*;
