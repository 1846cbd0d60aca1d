//! Task enumerations shared by every layer of the engine.
//!
//! The task record itself lives in [`domain`](crate::domain).

pub mod task;

pub use task::*;
