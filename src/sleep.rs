//! Interruptible Sleep
//!
//! A timer that can be cut short from anywhere. Each call to
//! [`InterruptibleSleep::sleep`] registers its own waiter, so an interrupt
//! only reaches sleeps that are pending at the moment it is issued and never
//! carries over to a later sleep.

use std::time::Duration;

use tokio::sync::Notify;

/// How a sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full duration elapsed
    Elapsed,
    /// [`InterruptibleSleep::interrupt`] was called while sleeping
    Interrupted,
}

/// Cancellable sleep shared between a loop and the parties that want to wake it
#[derive(Debug, Default)]
pub struct InterruptibleSleep {
    wake: Notify,
}

impl InterruptibleSleep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `duration`, returning early if interrupted.
    pub async fn sleep(&self, duration: Duration) -> SleepOutcome {
        self.sleep_unless(duration, || false).await
    }

    /// Like [`sleep`](Self::sleep), but return right away if `pending` holds
    /// once the sleep is registered.
    ///
    /// A waker that records its request where `pending` can see it before
    /// calling [`interrupt`](Self::interrupt) is never lost, even when the
    /// interrupt lands before this sleep starts.
    pub async fn sleep_unless<F>(&self, duration: Duration, pending: F) -> SleepOutcome
    where
        F: FnOnce() -> bool,
    {
        // Register before the timer starts so an interrupt racing with the
        // first poll is still observed.
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if pending() {
            return SleepOutcome::Interrupted;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
            _ = notified => SleepOutcome::Interrupted,
        }
    }

    /// Wake every pending sleep. No-op when nothing is sleeping.
    pub fn interrupt(&self) {
        self.wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::time::Instant;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[tokio::test(start_paused = true)]
    async fn test_sleep_elapses() {
        let sleep = InterruptibleSleep::new();
        let start = Instant::now();
        let outcome = sleep.sleep(Duration::from_millis(250)).await;
        assert_eq!(outcome, SleepOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_wakes_pending_sleep() {
        let sleep = Arc::new(InterruptibleSleep::new());
        let sleeper = sleep.clone();
        let start = Instant::now();

        let handle =
            tokio::spawn(async move { sleeper.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sleep.interrupt();

        assert_eq!(handle.await.unwrap(), SleepOutcome::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_without_sleeper_does_not_affect_next_sleep() {
        let sleep = InterruptibleSleep::new();
        sleep.interrupt();
        sleep.interrupt();

        let outcome = sleep.sleep(Duration::from_millis(100)).await;
        assert_eq!(outcome, SleepOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_registered_before_first_poll() {
        let sleep = InterruptibleSleep::new();
        let mut pending = task::spawn(sleep.sleep(Duration::from_secs(5)));
        assert_pending!(pending.poll());

        sleep.interrupt();
        assert!(pending.is_woken());
        assert_ready_eq!(pending.poll(), SleepOutcome::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_unless_returns_on_recorded_request() {
        let sleep = InterruptibleSleep::new();
        let start = Instant::now();

        // The interrupt went nowhere, but the request it stood for is kept.
        sleep.interrupt();
        let outcome = sleep.sleep_unless(Duration::from_secs(60), || true).await;
        assert_eq!(outcome, SleepOutcome::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(1));

        let outcome = sleep
            .sleep_unless(Duration::from_millis(100), || false)
            .await;
        assert_eq!(outcome, SleepOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_sleep_owns_its_token() {
        let sleep = Arc::new(InterruptibleSleep::new());

        let first = {
            let sleep = sleep.clone();
            tokio::spawn(async move { sleep.sleep(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        sleep.interrupt();
        assert_eq!(first.await.unwrap(), SleepOutcome::Interrupted);

        // The interrupt above must not leak into this one.
        let start = Instant::now();
        assert_eq!(
            sleep.sleep(Duration::from_millis(500)).await,
            SleepOutcome::Elapsed
        );
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
