//! Per-tick wiring of detector, store, and capture queue.
//!
//! The orchestrator is driven externally at a fixed cadence (the binary uses
//! a tokio interval; tests call [`Orchestrator::tick`] directly) and performs
//! three phases per tick:
//!
//! 1. drain completed capture outcomes - commit the image index and append a
//!    `captured=1` row on success, append a `captured=0` row on failure;
//! 2. sample both inputs through the edge detector - a qualifying edge
//!    allocates a trigger index and enqueues the event;
//! 3. advance the pending event queue - gate-low events complete with a row
//!    as soon as they reach the front; a gate-high event is dispatched to
//!    the capture worker only when no capture is in flight.
//!
//! Deferring dispatch until the previous outcome has been committed keeps two
//! invariants at once: the image index is never read speculatively (two
//! pending captures would otherwise race for the same filename), and log
//! rows land in strictly increasing trigger-index order.
//!
//! The orchestrator owns the store outright; the capture worker only ever
//! sees jobs and never touches persisted state.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::capture::{CaptureJob, CaptureOutcome, CaptureQueue};
use crate::error::AppResult;
use crate::hardware::DigitalInput;
use crate::store::{ExperimentStore, LogRow};
use crate::trigger::EdgeDetector;

/// One accepted edge, waiting for its capture (or its log row).
#[derive(Clone, Debug)]
struct TriggerEvent {
    trigger_index: u64,
    gate_high: bool,
    at: DateTime<Local>,
}

/// Drives the capture pipeline one poll tick at a time.
pub struct Orchestrator<T: DigitalInput, G: DigitalInput> {
    trigger_input: T,
    gate_input: G,
    detector: EdgeDetector,
    store: ExperimentStore,
    queue: CaptureQueue,
    pending: VecDeque<TriggerEvent>,
    dispatched: bool,
}

impl<T: DigitalInput, G: DigitalInput> Orchestrator<T, G> {
    /// Wire the pipeline together, priming the detector with the trigger
    /// line's current level so a line already high at startup cannot fire.
    pub fn new(
        mut trigger_input: T,
        gate_input: G,
        store: ExperimentStore,
        queue: CaptureQueue,
    ) -> AppResult<Self> {
        let initial_level = trigger_input.is_high()?;
        Ok(Self {
            trigger_input,
            gate_input,
            detector: EdgeDetector::new(initial_level),
            store,
            queue,
            pending: VecDeque::new(),
            dispatched: false,
        })
    }

    /// The store backing this run (counters and paths).
    pub fn store(&self) -> &ExperimentStore {
        &self.store
    }

    /// Number of accepted events not yet resolved to a log row.
    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Run one poll tick.
    pub fn tick(&mut self) -> AppResult<()> {
        self.drain_outcomes()?;
        self.sample_inputs()?;
        self.advance_pending()
    }

    /// Handle every capture outcome the worker has finished.
    fn drain_outcomes(&mut self) -> AppResult<()> {
        while let Some(outcome) = self.queue.try_recv() {
            self.finish_front(outcome)?;
        }
        Ok(())
    }

    /// Resolve the dispatched front event with its outcome.
    fn finish_front(&mut self, outcome: CaptureOutcome) -> AppResult<()> {
        let Some(event) = self.pending.pop_front() else {
            // Cannot happen while dispatch is gated on the front event; an
            // orphan outcome would mean the queue delivered twice.
            error!(
                trigger_index = outcome.job.trigger_index,
                "outcome without a pending event, dropping"
            );
            return Ok(());
        };
        debug_assert_eq!(event.trigger_index, outcome.job.trigger_index);
        self.dispatched = false;

        match outcome.result {
            Ok(saved) => {
                // The executor verified the file; the index is now consumed.
                self.store.commit_capture_success()?;
                let filename = saved
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                info!(
                    trigger_index = event.trigger_index,
                    filename, "captured"
                );
                self.store
                    .append_log_row(&LogRow::captured(event.trigger_index, event.at, &filename))?;
            }
            Err(e) => {
                warn!(
                    trigger_index = event.trigger_index,
                    error = %e,
                    "capture failed"
                );
                self.store.append_log_row(&LogRow::failed(
                    event.trigger_index,
                    event.at,
                    e.to_string(),
                ))?;
            }
        }
        Ok(())
    }

    /// Sample both inputs; a qualifying edge consumes a trigger index.
    fn sample_inputs(&mut self) -> AppResult<()> {
        let trigger = self.trigger_input.is_high()?;
        let gate = self.gate_input.is_high()?;

        if let Some(edge) = self.detector.sample(trigger, gate) {
            let trigger_index = self.store.allocate_trigger(edge.gate_high)?;
            self.pending.push_back(TriggerEvent {
                trigger_index,
                gate_high: edge.gate_high,
                at: Local::now(),
            });
        }
        Ok(())
    }

    /// Complete gate-low events at the front; dispatch the next capture when
    /// the camera is idle.
    fn advance_pending(&mut self) -> AppResult<()> {
        while let Some(front) = self.pending.front().cloned() {
            if front.gate_high {
                if self.dispatched {
                    break;
                }
                let (target_path, image_index) = self.store.next_image_path();
                let stem = target_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.queue.submit(CaptureJob {
                    trigger_index: front.trigger_index,
                    image_index,
                    target_path,
                    stem,
                })?;
                self.dispatched = true;
                break;
            }

            // Gate low: no capture, no image index, one row.
            self.pending.pop_front();
            info!(
                trigger_index = front.trigger_index,
                "trigger ignored, gate low"
            );
            self.store
                .append_log_row(&LogRow::gated_off(front.trigger_index, front.at))?;
        }
        Ok(())
    }

    /// Stop the pipeline, giving the in-flight capture up to `grace` to
    /// finish.
    ///
    /// An outcome that completes within the grace period is committed and
    /// logged normally. Anything still unresolved afterwards gets a
    /// `captured=0` row; an abandoned capture was never committed, so the
    /// persisted counters stay consistent.
    pub async fn shutdown(self, grace: Duration) -> AppResult<()> {
        let Self {
            mut store,
            queue,
            mut pending,
            ..
        } = self;

        for outcome in queue.shutdown(grace).await {
            let Some(event) = pending.pop_front() else {
                break;
            };
            match outcome.result {
                Ok(saved) => {
                    store.commit_capture_success()?;
                    let filename = saved
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    store.append_log_row(&LogRow::captured(
                        event.trigger_index,
                        event.at,
                        &filename,
                    ))?;
                }
                Err(e) => {
                    store.append_log_row(&LogRow::failed(
                        event.trigger_index,
                        event.at,
                        e.to_string(),
                    ))?;
                }
            }
        }

        // Every accepted edge still gets its one row.
        for event in pending {
            let row = if event.gate_high {
                LogRow::failed(
                    event.trigger_index,
                    event.at,
                    "abandoned at shutdown".to_string(),
                )
            } else {
                LogRow::gated_off(event.trigger_index, event.at)
            };
            store.append_log_row(&row)?;
        }
        info!("orchestrator stopped");
        Ok(())
    }
}
