//! Per-client repeating scheduler behind the round countdown.

use std::{future::Future, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

/// What the driver should do after a tick was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep counting.
    Continue,
    /// The countdown is over (or no longer applies); end the loop.
    Stop,
}

/// Repeating timer driven by the monotonic clock.
///
/// The driver keeps a "last committed" marker. Each time it wakes up at least one period after
/// the marker it runs exactly one tick and advances the marker by exactly one period, so a late
/// wake-up is caught up one tick per callback without accumulating drift. Dropping the driver
/// cancels it.
pub struct CountdownDriver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CountdownDriver {
    /// Start ticking every `period`, the first tick one period from now.
    ///
    /// `cancel` stops the loop; the tick callback may also check it to discard a tick that raced
    /// with cancellation.
    pub fn spawn<F, Fut>(period: Duration, cancel: CancellationToken, mut on_tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        let token = cancel.clone();
        let mut last_committed = Instant::now();
        let handle = tokio::spawn(async move {
            loop {
                let deadline = last_committed + period;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = sleep_until(deadline) => {}
                }

                if Instant::now().duration_since(last_committed) < period {
                    continue;
                }
                last_committed += period;

                if on_tick().await == TickOutcome::Stop {
                    break;
                }
            }
        });

        Self { cancel, handle }
    }

    /// Cancel the loop; a tick already running completes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the loop is still scheduled.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

impl Drop for CountdownDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn counting_driver(limit: u32) -> (CountdownDriver, Arc<AtomicU32>) {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let driver = CountdownDriver::spawn(
            Duration::from_secs(1),
            CancellationToken::new(),
            move || {
                let counter = counter.clone();
                async move {
                    let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if seen >= limit {
                        TickOutcome::Stop
                    } else {
                        TickOutcome::Continue
                    }
                }
            },
        );
        (driver, ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_once_per_period() {
        let (driver, ticks) = counting_driver(u32::MAX);
        settle().await;

        tokio::time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(driver.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn late_wake_up_catches_up_without_drift() {
        let (_driver, ticks) = counting_driver(u32::MAX);
        settle().await;

        tokio::time::advance(Duration::from_millis(3_500)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        // The fourth tick stays aligned on the 4 s mark, not 3.5 s + 1 s.
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_outcome_ends_the_loop() {
        let (driver, ticks) = counting_driver(2);
        settle().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(!driver.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_driver_never_ticks() {
        let (driver, ticks) = counting_driver(u32::MAX);
        settle().await;
        driver.stop();

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert!(!driver.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels() {
        let (driver, ticks) = counting_driver(u32::MAX);
        settle().await;
        drop(driver);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
