//! Periodic capture scheduling.
//!
//! A running scheduler owns one background task: it runs the job once right
//! away, then again on every tick until stopped. Jobs run back to back on that
//! task, so a slow job delays the next tick instead of overlapping it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Work the scheduler runs on every tick.
///
/// Failures are the job's own business; the next tick runs regardless.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run_scheduled(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

struct RunningTimer {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Cancellable fixed-interval timer; at most one timer runs per scheduler.
pub struct Scheduler {
    interval: Duration,
    running: Mutex<Option<RunningTimer>>,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        match self.running.lock().as_ref() {
            Some(timer) if !timer.handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Start the timer. Returns `false` (and does nothing) if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, job: Arc<dyn ScheduledJob>) -> bool {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
        {
            return false;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            job.run_scheduled().await;

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // A stop that arrived mid-job wins over a tick that came due meanwhile.
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        debug!("Scheduled capture tick");
                        job.run_scheduled().await;
                    }
                }
            }
            debug!("Scheduler task exited");
        });

        *running = Some(RunningTimer { stop_tx, handle });
        info!("Capture scheduler started (every {}s)", period.as_secs());
        true
    }

    /// Stop the timer. Returns `false` if it was not running.
    ///
    /// A job already in progress finishes; no further ticks fire.
    pub fn stop(&self) -> bool {
        let Some(timer) = self.running.lock().take() else {
            return false;
        };
        let was_running = !timer.handle.is_finished();
        // The task may be mid-job; it sees the signal once the job returns.
        let _ = timer.stop_tx.send(());
        if was_running {
            info!("Capture scheduler stopped");
        }
        was_running
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.running.get_mut().take() {
            let _ = timer.stop_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: AtomicUsize,
        delay: Duration,
    }

    impl Counter {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                delay,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScheduledJob for Counter {
        async fn run_scheduled(&self) {
            tokio::time::sleep(self.delay).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_runs_immediately_then_on_interval() {
        let scheduler = Scheduler::new(Duration::from_millis(100));
        let counter = Counter::new(Duration::ZERO);

        assert!(scheduler.start(counter.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.runs(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(counter.runs() >= 3, "runs = {}", counter.runs());
        assert!(scheduler.stop());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let scheduler = Scheduler::new(Duration::from_secs(60));
        let counter = Counter::new(Duration::ZERO);

        assert!(!scheduler.stop());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        assert!(scheduler.start(counter.clone()));
        assert!(!scheduler.start(counter.clone()));
        assert_eq!(scheduler.state(), SchedulerState::Running);

        tokio::time::sleep(Duration::from_millis(30)).await;
        // The second start did not spawn another immediate run.
        assert_eq!(counter.runs(), 1);

        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_job_finish() {
        let scheduler = Scheduler::new(Duration::from_millis(50));
        let counter = Counter::new(Duration::from_millis(100));

        scheduler.start(counter.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.stop());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counter.runs(), 1);
    }

    #[tokio::test]
    async fn test_stop_during_tick_job_cancels_overdue_tick() {
        for _ in 0..20 {
            let scheduler = Scheduler::new(Duration::from_millis(20));
            let counter = Counter::new(Duration::from_millis(60));

            scheduler.start(counter.clone());
            // Immediate job ends at ~60ms, the first tick job runs ~80..140ms
            // and the next tick is already overdue when it returns.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let finished_before_stop = counter.runs();
            assert!(scheduler.stop());

            tokio::time::sleep(Duration::from_millis(300)).await;
            // Only the job in flight at stop may still complete.
            assert!(
                counter.runs() <= finished_before_stop + 1,
                "runs = {}, before stop = {}",
                counter.runs(),
                finished_before_stop
            );
        }
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let scheduler = Scheduler::new(Duration::from_secs(60));
        let counter = Counter::new(Duration::ZERO);

        scheduler.start(counter.clone());
        scheduler.stop();
        assert!(scheduler.start(counter.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.runs(), 2);
        scheduler.stop();
    }
}
