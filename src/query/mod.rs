//! Query Module
//!
//! Turns read requests into rate limited upstream calls, with caching,
//! pagination and addon post-processing.

pub mod case;
mod orchestrator;
mod transport;

pub use orchestrator::{QueryOrchestrator, MAX_PAGES};
pub use transport::{HttpTransport, Transport};
