//! Main delivery client

use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::backpressure::BackpressureMonitor;
use crate::cache::EnvelopeCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{load_delivery_config, DeliveryConfig};
use crate::envelope::Envelope;
use crate::error::PostboxResult;
use crate::hint::Hint;
use crate::report::{DiscardReason, DiscardTracker};
use crate::transport::{build_runtime, Dispatcher, EnvelopeSender};

/// Transforms or drops an envelope before it is queued.
pub trait EventProcessor: Send + Sync {
    fn process(&self, envelope: Envelope, hint: &Hint) -> Option<Envelope>;
}

impl<F> EventProcessor for F
where
    F: Fn(Envelope, &Hint) -> Option<Envelope> + Send + Sync,
{
    fn process(&self, envelope: Envelope, hint: &Hint) -> Option<Envelope> {
        self(envelope, hint)
    }
}

struct Pipeline {
    runtime: Mutex<Option<Runtime>>,
    cache: Arc<EnvelopeCache>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<BackpressureMonitor>,
}

/// Main delivery client
///
/// Owns the runtime, the disk cache, the dispatcher and the backpressure
/// monitor. A disabled client accepts submissions and drops them.
pub struct DeliveryClient {
    config: DeliveryConfig,
    discards: Arc<DiscardTracker>,
    processors: Vec<Box<dyn EventProcessor>>,
    pipeline: Option<Pipeline>,
}

impl DeliveryClient {
    /// Create a client from the layered configuration files and environment.
    pub fn new(sender: Arc<dyn EnvelopeSender>) -> Result<Self> {
        let config = load_delivery_config()?;
        Ok(Self::with_config(config, sender)?)
    }

    pub fn with_config(config: DeliveryConfig, sender: Arc<dyn EnvelopeSender>) -> PostboxResult<Self> {
        Self::with_clock(config, sender, Arc::new(SystemClock))
    }

    /// Create a client with an explicit clock. Cached envelopes from a
    /// previous run are resubmitted right away.
    pub fn with_clock(
        config: DeliveryConfig,
        sender: Arc<dyn EnvelopeSender>,
        clock: Arc<dyn Clock>,
    ) -> PostboxResult<Self> {
        let discards = Arc::new(DiscardTracker::new());

        if !config.enabled {
            info!("Delivery disabled, envelopes will be dropped");
            return Ok(Self {
                config,
                discards,
                processors: Vec::new(),
                pipeline: None,
            });
        }

        let runtime = build_runtime(config.worker_pool_size)?;
        let cache = Arc::new(EnvelopeCache::open(
            config.cache_options(),
            clock.clone(),
            discards.clone(),
        )?);
        let rate_limiter = Arc::new(crate::rate_limit::RateLimiter::new(clock.clone()));
        let dispatcher = Arc::new(Dispatcher::start(
            config.dispatcher_options(),
            sender,
            cache.clone(),
            rate_limiter,
            discards.clone(),
            clock,
            runtime.handle(),
        ));

        let probe = dispatcher.clone();
        let monitor = Arc::new(BackpressureMonitor::with_intervals(
            move || probe.is_healthy(),
            crate::backpressure::DEFAULT_INITIAL_DELAY,
            config.health_check_interval(),
        ));
        if config.enable_backpressure_handling {
            monitor.start(runtime.handle());
        }

        dispatcher.replay_pending();

        Ok(Self {
            config,
            discards,
            processors: Vec::new(),
            pipeline: Some(Pipeline {
                runtime: Mutex::new(Some(runtime)),
                cache,
                dispatcher,
                monitor,
            }),
        })
    }

    /// A client that drops everything
    pub fn disabled() -> Self {
        Self {
            config: DeliveryConfig {
                enabled: false,
                ..DeliveryConfig::default()
            },
            discards: Arc::new(DiscardTracker::new()),
            processors: Vec::new(),
            pipeline: None,
        }
    }

    /// Add a processor; processors run in the order they were added.
    pub fn with_processor(mut self, processor: impl EventProcessor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Queue an envelope for delivery without blocking.
    ///
    /// Returns whether the envelope was accepted. Processors are skipped for
    /// envelopes coming back from the cache.
    pub fn submit(&self, envelope: Envelope, hint: Hint) -> bool {
        let Some(pipeline) = &self.pipeline else {
            debug!(event_id = %envelope.event_id(), "Delivery disabled, dropping envelope");
            hint.mark_done(false);
            return false;
        };

        let envelope = if hint.is_cached() {
            envelope
        } else {
            match self.run_processors(envelope, &hint) {
                Some(envelope) => envelope,
                None => {
                    hint.mark_done(false);
                    return false;
                }
            }
        };

        pipeline.dispatcher.submit(envelope, hint)
    }

    fn run_processors(&self, mut envelope: Envelope, hint: &Hint) -> Option<Envelope> {
        for processor in &self.processors {
            let original = envelope.clone();
            match processor.process(envelope, hint) {
                Some(processed) => envelope = processed,
                None => {
                    debug!(event_id = %original.event_id(), "Envelope dropped by processor");
                    self.discards
                        .record_envelope(DiscardReason::EventProcessor, &original);
                    return None;
                }
            }
        }
        Some(envelope)
    }

    /// Current downsampling factor, 0 when healthy or disabled
    pub fn downsample_factor(&self) -> u8 {
        self.pipeline
            .as_ref()
            .map_or(0, |p| p.monitor.downsample_factor())
    }

    /// `rate` scaled down by the current backpressure
    pub fn downsampled_rate(&self, rate: f64) -> f64 {
        self.pipeline
            .as_ref()
            .map_or(rate, |p| p.monitor.downsampled_rate(rate))
    }

    /// Whether the previous run crashed right after startup. Consumes the
    /// marker, so only the first call can return true.
    pub fn has_startup_crash_marker(&self) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.cache.has_startup_crash_marker())
    }

    /// Wait up to `timeout` for queued envelopes to be processed.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.pipeline
            .as_ref()
            .map_or(true, |p| p.dispatcher.flush(timeout))
    }

    /// Drain for up to `flush_timeout_ms`, persist what is left and stop
    /// the workers. Later submissions are dropped.
    pub fn close(&self) {
        self.shutdown(self.config.flush_timeout());
    }

    fn shutdown(&self, timeout: Duration) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };
        let Some(runtime) = pipeline
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        pipeline.monitor.close();
        pipeline.dispatcher.close(timeout);
        runtime.shutdown_background();
        info!("Delivery client closed");
    }

    /// Items dropped so far, by reason and category
    pub fn discards(&self) -> &DiscardTracker {
        &self.discards
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Check if delivery is enabled
    pub fn is_enabled(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Check if debug mode is enabled
    pub fn is_debug(&self) -> bool {
        self.config.debug
    }
}

impl Drop for DeliveryClient {
    fn drop(&mut self) {
        // Not closed explicitly: persist pending work without waiting
        self.shutdown(Duration::ZERO);
    }
}
