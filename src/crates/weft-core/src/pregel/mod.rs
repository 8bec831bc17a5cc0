//! Bulk-synchronous execution internals.
//!
//! Split by concern: [`algo`] decides what runs and folds what ran,
//! [`executor`] runs one task under retries, [`io`] maps values in and out,
//! and [`loop_impl`] strings the supersteps together against the
//! checkpointer.

pub mod algo;
pub mod executor;
pub mod io;
pub mod loop_impl;
pub mod types;

pub use executor::{RetryPolicy, TaskExecutor};
pub use loop_impl::RunOutcome;
pub use types::{path_key, task_id, PathSegment, PregelExecutableTask, TaskWrites, PULL, PUSH};
