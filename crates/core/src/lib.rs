//! `fhirq-core`: shared primitives for the job engine.
//!
//! Identifiers, the queue-type vocabulary and the optimistic-concurrency token.
//! No I/O lives here.

pub mod concurrency;
pub mod error;
pub mod id;
pub mod queue;

pub use concurrency::ExpectedVersion;
pub use error::{DomainError, DomainResult};
pub use id::{GroupId, JobId, RunToken, TenantId};
pub use queue::QueueType;
