//! Utilities for testing hub and client functionality. They are used by this crate's own
//!  tests, and they are part of the regular (non-#[cfg(test)]) code so that integration tests
//!  and applications built on top of the overlay can use them as well.

pub mod callback;
pub mod connection;
pub mod hub;
pub mod node;
