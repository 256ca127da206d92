//! Infrastructure layer: job persistence and the asynchronous job executor.

pub mod jobs;
