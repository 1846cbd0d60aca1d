//! Domain types for the persisted task representation.
//!
//! [`Task`] is the record every store persists. [`TaskRequest`] and
//! [`StatusUpdate`] are the inbound shapes for submission and conditional
//! status writes.

pub mod record;

pub use record::*;
