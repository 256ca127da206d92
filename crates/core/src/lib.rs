//! `flowrun-core` — shared building blocks for the process engine.
//!
//! This crate contains **pure** primitives (no storage or threading concerns):
//! identifiers, the domain error model and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ExecutionId, ProcessInstanceId, TenantId};
