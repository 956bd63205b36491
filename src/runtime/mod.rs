//! Asynchronous execution primitives.
//!
//! Connection provisioning and query execution complete on worker threads
//! rather than in the caller's frame. This module provides the two pieces they
//! are built from.
//!
//! # Key Components
//!
//! - [`Scheduler`]: Fixed-size worker pool that runs queued and delayed jobs.
//! - [`Deferred`]: Single-resolution success-or-failure outcome, delivered to
//!   one registered continuation per kind and chainable into another deferred.
//!
//! # See Also
//!
//! - [`pool`](crate::pool): Leases resources through deferreds.
//! - [`query`](crate::query): Retries queries by chaining deferreds.
pub mod deferred;
pub mod thread;

pub use deferred::{Deferred, DeferredError};
pub use thread::{Job, Scheduler};
