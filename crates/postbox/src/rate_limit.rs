//! Server-issued rate limits per data category.
//!
//! Limits only ever come from a sender's response; nothing here guesses.
//! State lives in memory and is gone after a restart.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::envelope::{Envelope, ItemType};

/// Used when a limit does not say how long it lasts
pub const DEFAULT_RETRY_AFTER_MS: i64 = 60_000;

/// Longest limit accepted from a server, in seconds
pub const MAX_RETRY_AFTER_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// Rate limit bucket assigned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataCategory {
    /// Catch-all: suppresses every category
    All,
    Default,
    Error,
    Session,
    Attachment,
    Transaction,
    Profile,
    ProfileChunkUi,
    Monitor,
    Replay,
    Security,
    UserReport,
    Span,
    LogItem,
    Feedback,
    /// Never rate limited on its own, only through `All`
    Unknown,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::All => "all",
            DataCategory::Default => "default",
            DataCategory::Error => "error",
            DataCategory::Session => "session",
            DataCategory::Attachment => "attachment",
            DataCategory::Transaction => "transaction",
            DataCategory::Profile => "profile",
            DataCategory::ProfileChunkUi => "profile_chunk_ui",
            DataCategory::Monitor => "monitor",
            DataCategory::Replay => "replay",
            DataCategory::Security => "security",
            DataCategory::UserReport => "user_report",
            DataCategory::Span => "span",
            DataCategory::LogItem => "log_item",
            DataCategory::Feedback => "feedback",
            DataCategory::Unknown => "unknown",
        }
    }

    /// Category named in a rate limit header
    pub fn from_name(name: &str) -> Self {
        match name {
            "default" => DataCategory::Default,
            "error" => DataCategory::Error,
            "session" => DataCategory::Session,
            "attachment" => DataCategory::Attachment,
            "transaction" => DataCategory::Transaction,
            "profile" => DataCategory::Profile,
            "profile_chunk_ui" => DataCategory::ProfileChunkUi,
            "monitor" => DataCategory::Monitor,
            "replay" => DataCategory::Replay,
            "security" => DataCategory::Security,
            "user_report" => DataCategory::UserReport,
            "span" => DataCategory::Span,
            "log_item" => DataCategory::LogItem,
            "feedback" => DataCategory::Feedback,
            _ => DataCategory::Unknown,
        }
    }

    /// Category an envelope item is counted against
    pub fn from_item_type(item_type: &ItemType) -> Self {
        match item_type {
            ItemType::Event => DataCategory::Error,
            ItemType::Session => DataCategory::Session,
            ItemType::Attachment => DataCategory::Attachment,
            ItemType::Profile => DataCategory::Profile,
            ItemType::ProfileChunkUi => DataCategory::ProfileChunkUi,
            ItemType::Transaction => DataCategory::Transaction,
            ItemType::CheckIn => DataCategory::Monitor,
            ItemType::ReplayVideo => DataCategory::Replay,
            _ => DataCategory::Unknown,
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of the first item, which decides the fate of the whole envelope
pub fn primary_category(envelope: &Envelope) -> DataCategory {
    envelope
        .items()
        .first()
        .map(|item| DataCategory::from_item_type(&item.item_type))
        .unwrap_or(DataCategory::Unknown)
}

/// Rate limit information returned by a sender
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Response status code
    pub status: u16,
    /// `X-Sentry-Rate-Limits` value
    pub rate_limits: Option<String>,
    /// `Retry-After` value, in seconds
    pub retry_after: Option<String>,
}

impl RateLimitHeaders {
    /// Plain 429 with an optional `Retry-After`
    pub fn too_many_requests(retry_after: Option<&str>) -> Self {
        Self {
            status: 429,
            rate_limits: None,
            retry_after: retry_after.map(str::to_string),
        }
    }

    pub fn with_rate_limits(status: u16, rate_limits: &str) -> Self {
        Self {
            status,
            rate_limits: Some(rate_limits.to_string()),
            retry_after: None,
        }
    }
}

/// Result of filtering an envelope against active limits
#[derive(Debug)]
pub struct Filtered {
    /// What is left to send, `None` when everything was suppressed
    pub envelope: Option<Envelope>,
    /// Categories of the items that were removed
    pub dropped: Vec<DataCategory>,
}

/// Table of category expiry instants
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    limits: RwLock<HashMap<DataCategory, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            limits: RwLock::new(HashMap::new()),
        }
    }

    /// Apply the limits carried by a sender response.
    ///
    /// `X-Sentry-Rate-Limits` wins when present; it is a comma separated list
    /// of `retry_after:categories:scope:reason:namespaces` where categories
    /// are `;` separated and an empty list means every category. Otherwise a
    /// 429 applies `Retry-After` to every category.
    pub fn update(&self, headers: &RateLimitHeaders) {
        let now = self.clock.now();

        if let Some(header) = headers.rate_limits.as_deref() {
            for limit in header.split(',') {
                let limit: String = limit.chars().filter(|c| !c.is_whitespace()).collect();
                let mut parts = limit.split(':');

                let retry_after = parse_retry_after(parts.next());
                // scope, reason and namespaces are not needed client side
                let Some(categories) = parts.next() else {
                    continue;
                };
                let until = expiry(now, retry_after);

                if categories.is_empty() {
                    self.apply_if_longer(DataCategory::All, until);
                    continue;
                }

                for name in categories.split(';') {
                    match DataCategory::from_name(name) {
                        DataCategory::Unknown => {
                            debug!(category = %name, "Ignoring rate limit for unknown category");
                        }
                        category => self.apply_if_longer(category, until),
                    }
                }
            }
        } else if headers.status == 429 {
            let until = expiry(now, parse_retry_after(headers.retry_after.as_deref()));
            self.apply_if_longer(DataCategory::All, until);
        }
    }

    /// Whether `category` is currently suppressed, directly or by the catch-all.
    pub fn is_suppressed(&self, category: DataCategory) -> bool {
        let now = self.clock.now();
        let limits = self.limits.read().unwrap_or_else(PoisonError::into_inner);

        let active = |c: DataCategory| limits.get(&c).is_some_and(|until| *until > now);

        if active(DataCategory::All) {
            return true;
        }
        if category == DataCategory::Unknown {
            return false;
        }
        active(category)
    }

    /// Whether any limit at all is in force.
    pub fn is_any_active(&self) -> bool {
        let now = self.clock.now();
        self.limits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|until| *until > now)
    }

    /// Remove suppressed items.
    ///
    /// When the primary (first) item is suppressed the envelope is dropped
    /// as a whole; otherwise only the individual suppressed items go.
    pub fn filter(&self, envelope: Envelope) -> Filtered {
        let categories: Vec<DataCategory> = envelope
            .items()
            .iter()
            .map(|item| DataCategory::from_item_type(&item.item_type))
            .collect();

        if self.is_suppressed(primary_category(&envelope)) {
            warn!(
                event_id = %envelope.event_id(),
                items = categories.len(),
                "Envelope discarded, its category is rate limited"
            );
            return Filtered {
                envelope: None,
                dropped: categories,
            };
        }

        let suppressed: Vec<bool> = categories.iter().map(|c| self.is_suppressed(*c)).collect();
        if !suppressed.contains(&true) {
            return Filtered {
                envelope: Some(envelope),
                dropped: Vec::new(),
            };
        }

        let (header, items) = envelope.into_parts();
        let mut dropped = Vec::new();
        let mut kept = Vec::new();
        for ((item, category), suppressed) in items.into_iter().zip(categories).zip(suppressed) {
            if suppressed {
                dropped.push(category);
            } else {
                kept.push(item);
            }
        }

        warn!(
            event_id = %header.event_id,
            dropped = dropped.len(),
            "Envelope items dropped due to rate limiting"
        );

        let envelope = (!kept.is_empty()).then(|| Envelope::from_parts(header, kept));
        Filtered { envelope, dropped }
    }

    fn apply_if_longer(&self, category: DataCategory, until: DateTime<Utc>) {
        let mut limits = self.limits.write().unwrap_or_else(PoisonError::into_inner);
        match limits.get(&category) {
            Some(existing) if *existing >= until => {}
            _ => {
                info!(category = %category, until = %until, "Rate limit applied");
                limits.insert(category, until);
            }
        }
    }
}

fn parse_retry_after(raw: Option<&str>) -> Duration {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::milliseconds((secs.min(MAX_RETRY_AFTER_SECS) * 1000.0) as i64))
        .unwrap_or_else(|| Duration::milliseconds(DEFAULT_RETRY_AFTER_MS))
}

fn expiry(now: DateTime<Utc>, retry_after: Duration) -> DateTime<Utc> {
    now.checked_add_signed(retry_after)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
