//! Integration tests for the delivery pipeline

use postbox::{
    DataCategory, DeliveryClient, DeliveryConfig, DiscardReason, Envelope, EnvelopeCache,
    EnvelopeItem, EnvelopeSender, FlushSignal, Hint, ItemType, RateLimitHeaders, SendOutcome,
};
use serial_test::serial;
use std::collections::VecDeque;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Show pipeline logs with `RUST_LOG=postbox=debug cargo test`
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Replays a fixed script of outcomes, then succeeds
struct ScriptedSender {
    outcomes: Mutex<VecDeque<SendOutcome>>,
    bodies: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedSender {
    fn new(outcomes: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            bodies: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<Envelope> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .map(|body| Envelope::from_slice(body).unwrap())
            .collect()
    }
}

impl EnvelopeSender for ScriptedSender {
    fn send(&self, body: &[u8]) -> SendOutcome {
        self.bodies.lock().unwrap().push(body.to_vec());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Success)
    }
}

fn config_for(dir: &Path) -> DeliveryConfig {
    DeliveryConfig {
        cache_dir: dir.to_path_buf(),
        max_cache_items: 5,
        flush_timeout_ms: 2000,
        ..DeliveryConfig::default()
    }
}

fn error_event(message: &str) -> Envelope {
    Envelope::from_event(&serde_json::json!({ "message": message })).unwrap()
}

fn cached_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".envelope"))
        .count()
}

#[test]
fn test_offline_then_online_delivery() {
    init_logging();
    let dir = TempDir::new().unwrap();

    let offline = ScriptedSender::new(vec![SendOutcome::Failure { retryable: true }; 3]);
    let client = DeliveryClient::with_config(config_for(dir.path()), offline.clone()).unwrap();
    let ids: Vec<_> = (0..3)
        .map(|i| {
            let envelope = error_event(&format!("offline {}", i));
            let id = envelope.event_id();
            client.submit(envelope, Hint::new());
            id
        })
        .collect();
    client.close();
    drop(client);
    assert_eq!(cached_files(dir.path()), 3);

    let online = ScriptedSender::new(Vec::new());
    let client = DeliveryClient::with_config(config_for(dir.path()), online.clone()).unwrap();
    assert!(client.flush(Duration::from_secs(5)));
    client.close();

    let mut delivered: Vec<_> = online.sent().iter().map(|e| e.event_id()).collect();
    let mut expected = ids.clone();
    delivered.sort();
    expected.sort();
    assert_eq!(delivered, expected);
    assert_eq!(cached_files(dir.path()), 0);
}

#[test]
fn test_cache_capacity_holds_across_failures() {
    let dir = TempDir::new().unwrap();
    let sender = ScriptedSender::new(vec![SendOutcome::Failure { retryable: true }; 20]);
    let client = DeliveryClient::with_config(config_for(dir.path()), sender).unwrap();

    for i in 0..12 {
        client.submit(error_event(&i.to_string()), Hint::new());
    }
    assert!(client.flush(Duration::from_secs(5)));

    assert_eq!(cached_files(dir.path()), 5);
    assert_eq!(
        client
            .discards()
            .count(DiscardReason::CacheOverflow, DataCategory::Error),
        7
    );
    client.close();
}

#[test]
fn test_rate_limited_category_is_held_back() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let sender = ScriptedSender::new(vec![SendOutcome::RateLimited(
        RateLimitHeaders::with_rate_limits(429, "120:error;transaction:organization"),
    )]);
    let client = DeliveryClient::with_config(config_for(dir.path()), sender.clone()).unwrap();

    client.submit(error_event("first"), Hint::new());
    assert!(client.flush(Duration::from_secs(5)));

    // Same category is suppressed
    client.submit(error_event("second"), Hint::new());
    assert!(client.flush(Duration::from_secs(5)));
    assert_eq!(
        client
            .discards()
            .count(DiscardReason::RateLimitBackoff, DataCategory::Error),
        1
    );

    // A session still goes out and reports the suppressed error
    let session = Envelope::new().with_item(EnvelopeItem::new(ItemType::Session, b"{}".to_vec()));
    client.submit(session, Hint::new());
    assert!(client.flush(Duration::from_secs(5)));

    let sent = sender.sent();
    assert_eq!(sent.len(), 2);
    let items = sent[1].items();
    assert_eq!(items[0].item_type, ItemType::Session);
    assert_eq!(items[1].item_type, ItemType::ClientReport);
    let report: serde_json::Value = serde_json::from_slice(&items[1].payload).unwrap();
    assert_eq!(report["discarded_events"][0]["reason"], "ratelimit_backoff");
    assert_eq!(report["discarded_events"][0]["quantity"], 1);
    assert!(client.discards().snapshot().is_empty());
    assert_eq!(cached_files(dir.path()), 1);
    client.close();
}

#[test]
fn test_flush_signal_reports_outcome() {
    let dir = TempDir::new().unwrap();
    let sender = ScriptedSender::new(vec![SendOutcome::Failure { retryable: false }]);
    let client = DeliveryClient::with_config(config_for(dir.path()), sender).unwrap();

    let rejected = FlushSignal::new();
    client.submit(error_event("rejected"), Hint::new().with_flush_signal(rejected.clone()));
    assert_eq!(rejected.wait(Duration::from_secs(5)), Some(false));

    let accepted = FlushSignal::new();
    client.submit(error_event("accepted"), Hint::new().with_flush_signal(accepted.clone()));
    assert_eq!(accepted.wait(Duration::from_secs(5)), Some(true));
    client.close();
}

#[test]
fn test_crash_flush_is_persisted_and_flags_startup_crash() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = DeliveryConfig {
        startup_crash_duration_threshold_ms: 60_000,
        ..config_for(dir.path())
    };

    // The process "dies" while the send is in flight
    let gate = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
    let sender_gate = gate.clone();
    let stuck = Arc::new(move |_: &[u8]| {
        let (lock, cond) = &*sender_gate;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cond.wait(open).unwrap();
        }
        SendOutcome::Failure { retryable: true }
    });
    let client = DeliveryClient::with_config(config.clone(), stuck).unwrap();
    client.submit(error_event("fatal"), Hint::new().disk_flush_notification());
    assert!(!client.flush(Duration::from_millis(100)));
    assert_eq!(cached_files(dir.path()), 1);

    *gate.0.lock().unwrap() = true;
    gate.1.notify_all();
    client.close();
    drop(client);

    let sender = ScriptedSender::new(Vec::new());
    let next = DeliveryClient::with_config(config, sender.clone()).unwrap();
    assert!(next.has_startup_crash_marker());
    assert!(!next.has_startup_crash_marker());
    assert!(next.flush(Duration::from_secs(5)));
    assert_eq!(sender.sent().len(), 1);
    next.close();
}

#[test]
fn test_corrupt_cache_entry_does_not_block_replay() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("00000000000000000000-0000000000-broken.envelope"),
        b"\x00\x01garbage",
    )
    .unwrap();

    let sender = ScriptedSender::new(Vec::new());
    let client = DeliveryClient::with_config(config_for(dir.path()), sender.clone()).unwrap();
    assert!(client.flush(Duration::from_secs(5)));

    assert!(sender.sent().is_empty());
    assert_eq!(cached_files(dir.path()), 0);
    client.close();
}

#[test]
fn test_direct_cache_entries_are_replayed() {
    let dir = TempDir::new().unwrap();
    {
        let cache = EnvelopeCache::open(
            config_for(dir.path()).cache_options(),
            Arc::new(postbox::SystemClock),
            Arc::new(postbox::DiscardTracker::new()),
        )
        .unwrap();
        cache.store(&error_event("stored"), &Hint::new());
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let client = DeliveryClient::with_config(
        config_for(dir.path()),
        Arc::new(move |_: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            SendOutcome::Success
        }),
    )
    .unwrap();
    assert!(client.flush(Duration::from_secs(5)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    client.close();
}

#[tokio::test]
async fn test_client_can_be_dropped_inside_async_context() {
    let dir = TempDir::new().unwrap();
    let client =
        DeliveryClient::with_config(config_for(dir.path()), ScriptedSender::new(Vec::new())).unwrap();
    client.submit(error_event("async"), Hint::new());
    drop(client);
}

#[test]
#[serial]
fn test_env_disables_client() {
    let original = env::var("POSTBOX_DISABLED").ok();
    env::set_var("POSTBOX_DISABLED", "1");

    let client = DeliveryClient::new(ScriptedSender::new(Vec::new())).unwrap();
    assert!(!client.is_enabled());
    assert!(!client.submit(error_event("dropped"), Hint::new()));

    env::remove_var("POSTBOX_DISABLED");
    if let Some(val) = original {
        env::set_var("POSTBOX_DISABLED", val);
    }
}

#[test]
#[serial]
fn test_config_precedence_env_over_file() {
    let temp_dir = TempDir::new().unwrap();
    let original_dir = env::current_dir().unwrap();
    env::set_current_dir(&temp_dir).unwrap();

    let config_dir = temp_dir.path().join(".postbox");
    fs::create_dir_all(&config_dir).unwrap();
    let cache_dir = temp_dir.path().join("outbox-cache");
    fs::write(
        config_dir.join("config.toml"),
        format!(
            "[delivery]\ncache_dir = {:?}\nmax_cache_items = 3\ndebug = false\n",
            cache_dir.display().to_string()
        ),
    )
    .unwrap();

    let original = env::var("POSTBOX_DEBUG").ok();
    env::set_var("POSTBOX_DEBUG", "1");

    let client = DeliveryClient::new(ScriptedSender::new(Vec::new())).unwrap();
    assert!(client.is_debug());
    assert_eq!(client.config().max_cache_items, 3);
    assert_eq!(client.config().cache_dir, cache_dir);
    assert!(cache_dir.exists());
    client.close();
    drop(client);

    env::remove_var("POSTBOX_DEBUG");
    if let Some(val) = original {
        env::set_var("POSTBOX_DEBUG", val);
    }
    env::set_current_dir(original_dir).unwrap();
}
