//! # postbox
//!
//! Durable, backpressure-aware delivery of event envelopes.
//!
//! ## Guarantees
//!
//! - **Never blocks the producer**: `submit` only enqueues; a full queue
//!   rejects and counts instead of waiting
//! - **Survives restarts**: failed retryable sends go to a bounded disk cache
//!   and are replayed by the next client
//! - **Crash-safe storage**: cache entries are written atomically and corrupt
//!   entries are removed on read
//! - **Honors server limits**: rate limits from responses suppress matching
//!   envelopes until they expire
//! - **Backs off under pressure**: a periodic health check derives a sample
//!   rate downsampling factor
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use postbox::{DeliveryClient, Envelope, Hint, SendOutcome};
//!
//! let sender = Arc::new(|_body: &[u8]| SendOutcome::Success);
//! let client = DeliveryClient::new(sender).unwrap();
//!
//! let envelope = Envelope::from_event(&serde_json::json!({"message": "hello"})).unwrap();
//! client.submit(envelope, Hint::new());
//! client.close();
//! ```
//!
//! ## Opt-Out
//!
//! ```bash
//! export POSTBOX_DISABLED=1
//!
//! # or in ~/.postbox/config.toml
//! [delivery]
//! enabled = false
//! ```

pub mod backpressure;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod hint;
pub mod rate_limit;
pub mod report;
pub mod transport;

pub use backpressure::{BackpressureMonitor, HealthProbe, MAX_DOWNSAMPLE_FACTOR};
pub use cache::{CacheOptions, CachedEnvelope, EnvelopeCache, PendingEnvelopes};
pub use client::{DeliveryClient, EventProcessor};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_delivery_config, DeliveryConfig};
pub use envelope::{Envelope, EnvelopeHeader, EnvelopeItem, EventId, ItemType, SdkInfo};
pub use error::{EnvelopeError, PostboxError, PostboxResult};
pub use hint::{FlushSignal, Hint, HintFlags};
pub use rate_limit::{DataCategory, RateLimitHeaders, RateLimiter};
pub use report::{ClientReport, DiscardReason, DiscardTracker, DiscardedEvents};
pub use transport::{Dispatcher, DispatcherOptions, EnvelopeSender, SendOutcome};
