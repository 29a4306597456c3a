//! Real-time trace replay
//!
//! [`TraceCursor`] is the pure part: given an elapsed time it tells which
//! segment is in effect and whether it still has to be installed. The
//! [`TraceScheduler`] drives a cursor from a background task against
//! `tokio::time`, so tests can run it on a paused clock.

use crate::shaping::{Shaper, ShapingError};
use model::{Trace, TraceSegment};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    /// Last segment installed and held until the handle is stopped
    Completed,
    Cancelled,
    /// The shaping primitive failed; interface state is undefined
    Failed,
}

/// Position within a trace. Only ever moves forward.
#[derive(Debug, Clone)]
pub struct TraceCursor {
    trace: Trace,
    index: usize,
    applied: Option<usize>,
}

impl TraceCursor {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            index: 0,
            applied: None,
        }
    }

    /// Move to the segment in effect at `elapsed_ms`.
    ///
    /// Segments whose whole window already passed are skipped. With tied
    /// offsets the last one wins.
    pub fn advance(&mut self, elapsed_ms: u64) -> usize {
        let segments = self.trace.segments();
        while self.index + 1 < segments.len() && segments[self.index + 1].offset_ms <= elapsed_ms {
            self.index += 1;
        }
        self.index
    }

    /// The current segment, if it differs from the one last handed out
    pub fn take_pending(&mut self) -> Option<TraceSegment> {
        if self.applied == Some(self.index) {
            return None;
        }
        self.applied = Some(self.index);
        Some(self.trace.segments()[self.index])
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.trace.len()
    }

    pub fn next_offset(&self) -> Option<u64> {
        self.trace.segments().get(self.index + 1).map(|s| s.offset_ms)
    }
}

pub struct TraceScheduler {
    shaper: Arc<dyn Shaper>,
    interface: String,
}

impl TraceScheduler {
    pub fn new(shaper: Arc<dyn Shaper>, interface: impl Into<String>) -> Self {
        Self {
            shaper,
            interface: interface.into(),
        }
    }

    /// Install the first segment and spawn the replay loop.
    ///
    /// Must be called from within a tokio runtime. A failure to install the
    /// first segment is returned directly and nothing is spawned.
    pub fn start(self, trace: Trace) -> Result<TraceHandle, ShapingError> {
        self.start_at(trace, Instant::now())
    }

    /// Like [`start`](Self::start) with an explicit reference instant. A
    /// `t0` in the past resumes the trace part-way through.
    pub fn start_at(self, trace: Trace, t0: Instant) -> Result<TraceHandle, ShapingError> {
        let segments = trace.len();
        let mut cursor = TraceCursor::new(trace);

        cursor.advance(elapsed_ms(t0));
        if let Some(segment) = cursor.take_pending() {
            self.shaper.apply(&self.interface, &segment.params)?;
            info!(
                "Trace segment {}/{} @{}ms on {}: {}",
                cursor.index() + 1,
                segments,
                segment.offset_ms,
                self.interface,
                segment.params
            );
        }

        let initial = if cursor.is_last() {
            SchedulerState::Completed
        } else {
            SchedulerState::Running
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let token = CancellationToken::new();

        let task = tokio::spawn(replay(
            cursor,
            self.shaper,
            self.interface,
            t0,
            token.clone(),
            state_tx,
        ));

        Ok(TraceHandle {
            token,
            task: Some(task),
            state: state_rx,
        })
    }
}

/// Owner of a running replay. Dropping it cancels the replay, which then
/// resets the interface in the background.
pub struct TraceHandle {
    token: CancellationToken,
    task: Option<JoinHandle<Result<SchedulerState, ShapingError>>>,
    state: watch::Receiver<SchedulerState>,
}

impl TraceHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Wait until the replay leaves `Running`
    pub async fn settled(&mut self) -> SchedulerState {
        let settled = match self.state.wait_for(|s| *s != SchedulerState::Running).await {
            Ok(state) => Some(*state),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| *self.state.borrow())
    }

    /// Cancel the replay (or release a completed one) and wait for the
    /// passthrough reset.
    ///
    /// Returns the state the replay ended in: `Cancelled` if it was still
    /// running, `Completed` if the last segment had been reached.
    pub async fn stop(mut self) -> Result<SchedulerState, ShapingError> {
        self.token.cancel();

        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| ShapingError::ReplayAborted(e.to_string()))?,
            None => Ok(self.state()),
        }
    }
}

impl Drop for TraceHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn elapsed_ms(t0: Instant) -> u64 {
    Instant::now().saturating_duration_since(t0).as_millis() as u64
}

async fn replay(
    mut cursor: TraceCursor,
    shaper: Arc<dyn Shaper>,
    interface: String,
    t0: Instant,
    token: CancellationToken,
    state: watch::Sender<SchedulerState>,
) -> Result<SchedulerState, ShapingError> {
    loop {
        let Some(next_offset) = cursor.next_offset() else {
            state.send_replace(SchedulerState::Completed);
            info!("Trace complete on {}, holding final segment", interface);

            token.cancelled().await;
            return release(&*shaper, &interface, SchedulerState::Completed, &state);
        };

        let deadline = t0 + Duration::from_millis(next_offset);
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Trace replay on {} cancelled", interface);
                state.send_replace(SchedulerState::Cancelled);
                return release(&*shaper, &interface, SchedulerState::Cancelled, &state);
            }
            _ = sleep_until(deadline) => {}
        }

        // Re-read the clock right before applying: late wake-ups skip
        // segments that are no longer current.
        let elapsed = elapsed_ms(t0);
        let previous = cursor.index();
        let index = cursor.advance(elapsed);
        if index > previous + 1 {
            debug!(
                "Replay on {} fell behind at {}ms, skipped {} segment(s)",
                interface,
                elapsed,
                index - previous - 1
            );
        }

        if let Some(segment) = cursor.take_pending() {
            if let Err(e) = shaper.apply(&interface, &segment.params) {
                state.send_replace(SchedulerState::Failed);
                return Err(e);
            }
            info!(
                "Trace segment {} @{}ms (elapsed {}ms) on {}: {}",
                index + 1,
                segment.offset_ms,
                elapsed,
                interface,
                segment.params
            );
        }
    }
}

fn release(
    shaper: &dyn Shaper,
    interface: &str,
    outcome: SchedulerState,
    state: &watch::Sender<SchedulerState>,
) -> Result<SchedulerState, ShapingError> {
    match shaper.reset(interface) {
        Ok(()) => {
            info!("Reset {} to passthrough", interface);
            Ok(outcome)
        }
        Err(e) => {
            warn!("Failed to reset {} after trace replay: {}", interface, e);
            state.send_replace(SchedulerState::Failed);
            Err(e)
        }
    }
}
