//! Background Tasks Module
//!
//! Contains background tasks that run for the lifetime of a client.
//!
//! # Tasks
//! - Prune: removes expired cache rows at the configured interval

mod prune;

pub use prune::spawn_prune_task;
