//! Polling loop shared by every stage.
//!
//! A stage prepares a bounded batch, processes and commits it, and polls
//! again. While input keeps arriving it polls back to back; once a poll
//! finds nothing it sleeps `poll_interval` plus jitter. Shutdown is raced
//! against every step, so a stage stops between batches or abandons an
//! uncommitted one.

use async_trait::async_trait;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationDuration, IterationResultType};

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// A batch was committed.
    ProcessedItems,
    /// Nothing new to process.
    NoItems,
    /// Shutdown was requested.
    Shutdown,
}

/// A stage driven by [`run_polling_loop`].
#[async_trait]
pub trait PollingProcessor {
    /// The batch prepared for each iteration.
    type State: Send;
    type Error: std::error::Error + Send;

    /// Prepare the next batch, or `None` when there is nothing to do.
    ///
    /// `cold_start` is true on the first iteration, where recovery happens.
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Process and commit a prepared batch.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Run `processor` until shutdown or an error.
pub async fn run_polling_loop<P: PollingProcessor + Send>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: CancellationToken,
    name: &str,
) -> Result<(), P::Error> {
    let mut first_iteration = true;

    loop {
        let iteration_start = Instant::now();
        let state = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = name, "Shutdown requested during prepare");
                return Ok(());
            }

            result = processor.prepare(first_iteration) => result?,
        };
        first_iteration = false;

        let result = match state {
            Some(state) => {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!(target = name, "Shutdown requested during processing, batch discarded");
                        IterationResult::Shutdown
                    }

                    result = processor.process(state) => result?,
                }
            }
            None => IterationResult::NoItems,
        };

        let result_type = match result {
            IterationResult::Shutdown => break,
            IterationResult::NoItems => IterationResultType::NoItems,
            IterationResult::ProcessedItems => IterationResultType::Processed,
        };
        emit!(IterationCompleted {
            result: result_type,
            target: name.to_string(),
        });
        emit!(IterationDuration {
            duration: iteration_start.elapsed(),
            target: name.to_string(),
        });

        if result == IterationResult::ProcessedItems {
            if shutdown.is_cancelled() {
                break;
            }
            continue;
        }

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        debug!(
            target = name,
            wait_ms = sleep_duration.as_millis() as u64,
            "No new input, waiting before next poll"
        );
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}

/// Random delay between zero and `max_secs` seconds.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}
