//! Capture command execution.
//!
//! [`runner`] executes the external capture tool with retries and transient
//! failure classification; [`worker`] serializes capture jobs through a
//! single worker task so the camera never sees overlapping commands.

pub mod runner;
pub mod worker;

pub use runner::{run_with_retry, RetryPolicy};
pub use worker::{CaptureExecutor, CaptureJob, CaptureOutcome, CaptureQueue, GphotoExecutor};
