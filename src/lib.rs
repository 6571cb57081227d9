//! Core library for the trigcap capture controller.
//!
//! trigcap turns a hardware edge signal into serialized still-image captures
//! on an external camera. A second gate input decides whether a trigger is
//! armed. The library guarantees that no trigger event is lost, that at most
//! one capture command is in flight at any time, and that the run's trigger
//! and image numbering survives crashes and restarts without renumbering or
//! overwriting earlier files.
//!
//! # Data Flow
//!
//! ```text
//! DigitalInput --> EdgeDetector --> Orchestrator --> CaptureQueue --> camera tool
//!                                        |                  |
//!                                  ExperimentStore <--------+ (outcome)
//!                                  (counters, log.csv, state.json)
//! ```
//!
//! The orchestrator is the single writer of all persisted state; the capture
//! worker only ever executes commands and reports outcomes back.

pub mod capture;
pub mod config;
pub mod error;
pub mod hardware;
pub mod orchestrator;
pub mod startup;
pub mod store;
pub mod trigger;
