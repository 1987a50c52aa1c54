//! Periodic sweep scheduling
//!
//! All three registries reclaim state on a timer. They implement
//! [`Sweeper`] and are driven by [`spawn_sweeper`], which stops as soon as
//! the shared shutdown flag flips to `true` (or its sender goes away).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// A registry that can reclaim expired or stale entries.
#[async_trait]
pub trait Sweeper: Send + Sync + 'static {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Run one sweep pass, returning how many entries were removed or reset.
    async fn sweep(&self) -> usize;
}

/// Spawn a background loop that calls `target.sweep()` every `interval`.
///
/// The first pass runs one full interval after spawning. The loop exits
/// when `shutdown` reads `true` or its sender is dropped; because the flag
/// is level-triggered a stop request sent before the loop polls is still
/// observed.
pub fn spawn_sweeper<S>(
    target: Arc<S>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: Sweeper + ?Sized,
{
    tokio::spawn(async move {
        let name = target.name();
        info!(sweeper = name, interval_secs = interval.as_secs(), "sweeper started");

        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = target.sweep().await;
                    debug!(sweeper = name, swept = swept, "sweep pass finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(sweeper = name, "sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSweeper {
        passes: AtomicUsize,
    }

    #[async_trait]
    impl Sweeper for CountingSweeper {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn sweep(&self) -> usize {
            self.passes.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_each_interval() {
        let target = Arc::new(CountingSweeper::default());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_sweeper(target.clone(), Duration::from_secs(10), rx);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(target.passes.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_does_not_run_immediately() {
        let target = Arc::new(CountingSweeper::default());
        let (_tx, rx) = watch::channel(false);
        let handle = spawn_sweeper(target.clone(), Duration::from_secs(60), rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(target.passes.load(Ordering::SeqCst), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_stop_sent_before_first_poll_is_observed() {
        let target = Arc::new(CountingSweeper::default());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let handle = spawn_sweeper(target.clone(), Duration::from_secs(3600), rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
        assert_eq!(target.passes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_sweeper() {
        let target = Arc::new(CountingSweeper::default());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_sweeper(target, Duration::from_secs(3600), rx);

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop when the sender is dropped")
            .unwrap();
    }
}
