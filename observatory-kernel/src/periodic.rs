//! Periodic task runner.
//!
//! A component implementing `PeriodicTask` is driven by its own tokio task on
//! a fixed interval until it asks to stop. Missed ticks are delayed, not
//! bursted, so a slow tick never queues up a backlog.

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    Stop,
}

#[async_trait]
pub trait PeriodicTask: Send + 'static {
    fn name(&self) -> &str;
    async fn tick(&mut self) -> TickFlow;
}

pub fn spawn_periodic<T: PeriodicTask>(mut task: T, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("[{}] periodic task every {:?}", task.name(), period);
        loop {
            interval.tick().await;
            if task.tick().await == TickFlow::Stop {
                info!("[{}] periodic task stopped", task.name());
                break;
            }
        }
    })
}

pub fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Countdown {
        left: usize,
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeriodicTask for Countdown {
        fn name(&self) -> &str {
            "countdown"
        }

        async fn tick(&mut self) -> TickFlow {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.left -= 1;
            if self.left == 0 {
                TickFlow::Stop
            } else {
                TickFlow::Continue
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_the_task_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = spawn_periodic(Countdown { left: 3, ticks: ticks.clone() }, Duration::from_secs(10));
        handle.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn negative_seconds_clamp_to_zero() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }
}
