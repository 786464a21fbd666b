use std::future::Future;

use anyhow::{Context, Result};
use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::CycleOutcome;

/// Background task driving one aggregator on a fixed interval.
///
/// Pausing (system sleep, user toggle) is a watch flag, not a cancellation:
/// a paused tick is skipped and the task keeps sleeping. Stop cancels the
/// task and awaits its orderly exit; a cycle already inside an LLM call
/// finishes on its own time.
pub struct AggregatorRunner {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl AggregatorRunner {
    pub fn spawn<F, Fut>(
        name: &'static str,
        interval: Duration,
        pause_rx: watch::Receiver<bool>,
        cycle: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CycleOutcome>> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        let handle = tokio::spawn(run_loop(name, interval, pause_rx, cycle, token_clone));

        Self {
            name,
            handle: Some(handle),
            cancel_token: Some(cancel_token),
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .with_context(|| format!("{} runner task failed to join", self.name))?;
        }
        Ok(())
    }
}

async fn run_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    pause_rx: watch::Receiver<bool>,
    cycle: F,
    cancel_token: CancellationToken,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<CycleOutcome>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; consume it so the
    // first cycle runs one full interval after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *pause_rx.borrow() {
                    debug!("{name} aggregator paused, skipping tick");
                    continue;
                }

                match cycle().await {
                    Ok(outcome) => {
                        if outcome.created > 0 {
                            info!(
                                "{name} cycle created {} record(s) from {} source(s)",
                                outcome.created, outcome.sources_consumed
                            );
                        }
                    }
                    Err(err) => error!("{name} cycle failed: {err:?}"),
                }
            }
            _ = cancel_token.cancelled() => {
                info!("{name} aggregator shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn runs_cycles_on_interval_and_skips_while_paused() {
        let runs = Arc::new(AtomicU64::new(0));
        let (pause_tx, pause_rx) = watch::channel(false);

        let counter = runs.clone();
        let mut runner = AggregatorRunner::spawn(
            "test",
            Duration::from_secs(10),
            pause_rx,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(CycleOutcome::default())
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Paused ticks are skipped, not queued.
        pause_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Resuming picks the schedule back up.
        pause_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        runner.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_errors_do_not_kill_the_loop() {
        let runs = Arc::new(AtomicU64::new(0));
        let (_pause_tx, pause_rx) = watch::channel(false);

        let counter = runs.clone();
        let mut runner = AggregatorRunner::spawn(
            "flaky",
            Duration::from_secs(10),
            pause_rx,
            move || {
                let counter = counter.clone();
                async move {
                    let run = counter.fetch_add(1, Ordering::SeqCst);
                    if run == 0 {
                        anyhow::bail!("transient failure");
                    }
                    Ok(CycleOutcome::default())
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        runner.stop().await.unwrap();
    }
}
