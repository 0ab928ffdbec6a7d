//! Periodic health check that derives a sample-rate downsampling factor.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Upper bound of the downsampling factor
pub const MAX_DOWNSAMPLE_FACTOR: u8 = 10;

/// Delay before the first health check
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Time between health checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Reports whether the delivery pipeline is keeping up.
pub trait HealthProbe: Send + Sync {
    fn is_healthy(&self) -> bool;
}

impl<F> HealthProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_healthy(&self) -> bool {
        self()
    }
}

/// Raises the downsampling factor by one per unhealthy check and resets it
/// on the first healthy one.
pub struct BackpressureMonitor {
    probe: Box<dyn HealthProbe>,
    factor: AtomicU8,
    did_ever_downsample: AtomicBool,
    initial_delay: Duration,
    interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl BackpressureMonitor {
    pub fn new(probe: impl HealthProbe + 'static) -> Self {
        Self::with_intervals(probe, DEFAULT_INITIAL_DELAY, DEFAULT_CHECK_INTERVAL)
    }

    pub fn with_intervals(
        probe: impl HealthProbe + 'static,
        initial_delay: Duration,
        interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            probe: Box::new(probe),
            factor: AtomicU8::new(0),
            did_ever_downsample: AtomicBool::new(false),
            initial_delay,
            interval,
            shutdown,
        }
    }

    /// Run one health check.
    pub fn tick(&self) {
        if self.probe.is_healthy() {
            let previous = self.factor.swap(0, Ordering::SeqCst);
            if previous > 0 {
                info!(previous_factor = previous, "Health check positive, reverting to normal sampling");
            }
        } else {
            let factor = self
                .factor
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                    Some((f + 1).min(MAX_DOWNSAMPLE_FACTOR))
                })
                .map_or(MAX_DOWNSAMPLE_FACTOR, |f| (f + 1).min(MAX_DOWNSAMPLE_FACTOR));
            self.did_ever_downsample.store(true, Ordering::SeqCst);
            debug!(downsample_factor = factor, "Health check negative, downsampling");
        }
    }

    pub fn downsample_factor(&self) -> u8 {
        self.factor.load(Ordering::SeqCst)
    }

    pub fn did_ever_downsample(&self) -> bool {
        self.did_ever_downsample.load(Ordering::SeqCst)
    }

    /// `rate` scaled by `1 / 2^factor`.
    pub fn downsampled_rate(&self, rate: f64) -> f64 {
        rate / 2f64.powi(i32::from(self.downsample_factor()))
    }

    /// Schedule health checks on `handle` until [`close`](Self::close).
    pub fn start(self: &Arc<Self>, handle: &Handle) {
        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        handle.spawn(async move {
            let period = monitor.interval.max(Duration::from_millis(1));
            let mut ticker = interval_at(Instant::now() + monitor.initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => monitor.tick(),
                }
            }
            debug!("Backpressure monitor stopped");
        });
    }

    /// Stop scheduling checks. A check already running finishes.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn scripted(results: &[bool]) -> impl HealthProbe {
        let script = Mutex::new(results.iter().copied().collect::<VecDeque<_>>());
        move || script.lock().unwrap().pop_front().unwrap_or(true)
    }

    #[test]
    fn test_factor_follows_health_checks() {
        let monitor = BackpressureMonitor::new(scripted(&[false, false, false, false, false, true]));

        let mut seen = vec![monitor.downsample_factor()];
        for _ in 0..6 {
            monitor.tick();
            seen.push(monitor.downsample_factor());
        }

        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 0]);
        assert!(monitor.did_ever_downsample());
    }

    #[test]
    fn test_factor_is_capped() {
        let monitor = BackpressureMonitor::new(|| false);
        for _ in 0..15 {
            monitor.tick();
        }
        assert_eq!(monitor.downsample_factor(), MAX_DOWNSAMPLE_FACTOR);
    }

    #[test]
    fn test_healthy_pipeline_never_downsamples() {
        let monitor = BackpressureMonitor::new(|| true);
        monitor.tick();
        monitor.tick();
        assert_eq!(monitor.downsample_factor(), 0);
        assert!(!monitor.did_ever_downsample());
        assert_eq!(monitor.downsampled_rate(0.5), 0.5);
    }

    #[test]
    fn test_downsampled_rate() {
        let monitor = BackpressureMonitor::new(scripted(&[false, false]));
        monitor.tick();
        monitor.tick();
        assert_eq!(monitor.downsampled_rate(1.0), 0.25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_close() {
        let monitor = Arc::new(BackpressureMonitor::with_intervals(
            || false,
            Duration::from_millis(10),
            Duration::from_millis(20),
        ));
        monitor.start(&Handle::current());

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(monitor.downsample_factor() > 0);

        monitor.close();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_close = monitor.downsample_factor();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(monitor.downsample_factor(), after_close);
    }

    #[tokio::test]
    async fn test_start_after_close_does_nothing() {
        let monitor = Arc::new(BackpressureMonitor::with_intervals(
            || false,
            Duration::from_millis(1),
            Duration::from_millis(1),
        ));
        monitor.close();
        monitor.start(&Handle::current());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(monitor.downsample_factor(), 0);
    }
}
