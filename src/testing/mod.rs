//! Testing utilities
//!
//! Message handlers that record, fail or panic, plus a one-call fixture for
//! a factory backed by the in-process broker. No external broker needed.

pub mod mocks;

pub use mocks::*;
