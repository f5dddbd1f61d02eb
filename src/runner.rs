//! Executes a single stage while a progress clock ticks alongside it.

use std::future::{self, Future};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{self, Instant, Interval};
use tracing::{debug, instrument, warn};

use crate::context::RunContext;
use crate::error::{StageFailure, panic_message};
use crate::stage::{StageDefinition, StageFuture, StageOutcome};

pub const DEFAULT_PROGRESS_STEP: u8 = 2;

/// Runs one stage to completion and normalises its result into a
/// `StageOutcome`.
///
/// Progress is reported on the stage's nominal clock: `progress_step` units
/// every `nominal_duration / ceil(100 / progress_step)`. A successful stage
/// never completes before its nominal duration has elapsed, and always reports
/// exactly `100` last.
#[derive(Debug, Clone, Copy)]
pub struct StageRunner {
    progress_step: u8,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_STEP)
    }
}

impl StageRunner {
    pub fn new(progress_step: u8) -> Self {
        Self {
            progress_step: progress_step.clamp(1, 100),
        }
    }

    pub fn progress_step(&self) -> u8 {
        self.progress_step
    }

    pub fn ticks_per_stage(&self) -> u32 {
        100_u32.div_ceil(u32::from(self.progress_step))
    }

    /// Tick period for a stage, rounded up so the full schedule never ends
    /// before `nominal`. `None` when the stage has no nominal duration.
    pub fn tick_interval(&self, nominal: Duration) -> Option<Duration> {
        if nominal.is_zero() {
            return None;
        }
        let nanos = nominal.as_nanos().div_ceil(u128::from(self.ticks_per_stage()));
        Some(Duration::from_nanos(
            u64::try_from(nanos).unwrap_or(u64::MAX),
        ))
    }

    #[instrument(skip_all, fields(stage = %stage.name(), stage_id = %stage.id()))]
    pub async fn execute<F>(
        &self,
        stage: &StageDefinition,
        ctx: &RunContext,
        mut on_progress: F,
    ) -> StageOutcome
    where
        F: FnMut(u8),
    {
        let started = Instant::now();
        let work = match panic::catch_unwind(AssertUnwindSafe(|| stage.work().run(ctx))) {
            Ok(work) => work,
            Err(payload) => {
                let message = format!("stage panicked: {}", panic_message(payload));
                return fail(stage, message, started);
            }
        };
        let mut work = CatchUnwind { inner: work };

        let mut clock = self
            .tick_interval(stage.nominal_duration())
            .map(|period| time::interval_at(started + period, period));
        let mut clock_done = clock.is_none();
        let mut progress: u8 = 0;
        let mut payload: Option<Value> = None;

        while payload.is_none() || !clock_done {
            tokio::select! {
                result = &mut work, if payload.is_none() => match result {
                    Ok(Ok(value)) => {
                        debug!("Stage work finished");
                        payload = Some(value);
                    }
                    Ok(Err(err)) => return fail(stage, format!("{err:#}"), started),
                    Err(message) => {
                        return fail(stage, format!("stage panicked: {message}"), started);
                    }
                },
                _ = next_tick(&mut clock), if !clock_done => {
                    let next = progress.saturating_add(self.progress_step);
                    if next >= 100 {
                        clock_done = true;
                    } else {
                        progress = next;
                        on_progress(progress);
                    }
                }
            }
        }

        on_progress(100);
        let data = payload.unwrap_or(Value::Null);
        StageOutcome::succeeded(stage.id(), data, elapsed_ms(started))
    }
}

fn fail(stage: &StageDefinition, message: String, started: Instant) -> StageOutcome {
    warn!(error = %message, "Stage failed");
    StageOutcome::failed(StageFailure::new(stage.id(), message), elapsed_ms(started))
}

async fn next_tick(clock: &mut Option<Interval>) {
    match clock {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Converts a panic raised while polling the work future into an error value.
struct CatchUnwind {
    inner: StageFuture,
}

impl Future for CatchUnwind {
    type Output = Result<anyhow::Result<Value>, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.inner;
        match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx))) {
            Ok(Poll::Ready(result)) => Poll::Ready(Ok(result)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(panic_message(payload))),
        }
    }
}
