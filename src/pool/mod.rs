//! Worker pool
//!
//! A fixed set of detached worker threads fed from a bounded queue, with
//! reactor and proactor dispatch.

pub mod task;
pub mod thread_pool;

pub use task::{Pending, Task};
pub use thread_pool::{ActorModel, PoolConfig, ThreadPool};
