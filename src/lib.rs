//! GOP decode cache for streamed media.
//!
//! Files are indexed into GOPs once and decoded one GOP at a time around
//! each consumer's playhead. Consumers of the same URL share a single
//! decode worker, so a GOP is decoded once no matter how many of them are
//! watching it.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gop;
pub mod media;
pub mod range;
pub mod registry;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError};
pub use coordinator::{CoordinatorEvent, StreamingCoordinator};
pub use error::{Error, Result};
pub use registry::{FileHandle, Registry};
