//! Hierarchical process lifecycle primitive.
//!
//! A [`Process`] is a node in a tree of concurrent units of work with
//! deterministic two-phase shutdown. Closing a process fires its *closing*
//! edge, cascades close to its children, waits for every child to close,
//! runs the teardown action exactly once, then fires its *closed* edge.
//! [`Process::background`] is the root of every tree and never closes.

pub mod error;
mod process;
mod process_test;

pub use error::{ProcessError, TeardownError};
pub use process::{Process, spawn};
