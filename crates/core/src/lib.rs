//! `writforge-core` — foundation building blocks for the orchestration core.
//!
//! This crate contains **pure** primitives (identifiers, error model) with no
//! storage or runtime concerns.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{BatchId, JobId, WorkerId};
