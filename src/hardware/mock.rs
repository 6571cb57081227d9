//! Mock digital inputs.
//!
//! Simulated input lines for driving the pipeline without hardware:
//!
//! - [`ScriptedInput`] - replays a fixed sequence of levels, then holds the
//!   last one
//! - [`SharedInput`] - level controlled externally through an atomic handle
//!
//! Both are regular (non-`cfg(test)`) types so integration tests and bench
//! rigs can use them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::AppResult;
use crate::hardware::DigitalInput;

/// Replays a scripted sequence of levels, one per sample.
///
/// Once the script is exhausted the last level is held indefinitely, which
/// matches how a real line behaves between transitions.
#[derive(Debug)]
pub struct ScriptedInput {
    script: VecDeque<bool>,
    held: bool,
}

impl ScriptedInput {
    /// Create an input replaying `levels`; an empty script holds low.
    pub fn new(levels: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: levels.into_iter().collect(),
            held: false,
        }
    }
}

impl DigitalInput for ScriptedInput {
    fn is_high(&mut self) -> AppResult<bool> {
        if let Some(level) = self.script.pop_front() {
            self.held = level;
        }
        Ok(self.held)
    }
}

/// Handle for steering a [`SharedInput`] from the test body.
#[derive(Clone, Debug, Default)]
pub struct LevelHandle(Arc<AtomicBool>);

impl LevelHandle {
    /// Set the line level seen by the paired input.
    pub fn set(&self, high: bool) {
        self.0.store(high, Ordering::SeqCst);
    }
}

/// An input whose level is set externally via a [`LevelHandle`].
#[derive(Debug)]
pub struct SharedInput(Arc<AtomicBool>);

impl SharedInput {
    /// Create an input (initially low) and its control handle.
    pub fn new() -> (Self, LevelHandle) {
        let level = Arc::new(AtomicBool::new(false));
        (Self(level.clone()), LevelHandle(level))
    }
}

impl DigitalInput for SharedInput {
    fn is_high(&mut self) -> AppResult<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}
