use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use log::debug;
use rsntp::SntpClient;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::radio::SocketPool;
use crate::traits::{NtpConnector, NtpSource};

#[derive(Debug, Clone, PartialEq)]
pub struct NtpOptions {
    pub server: String,
    pub utc_offset: FixedOffset,
    /// Socket timeout for one request/response exchange.
    pub timeout: Duration,
    /// Reuse a response for this long. Zero disables caching.
    pub cache: Duration,
}

/// Last server answer plus the monotonic instant it was taken at.
#[derive(Debug, Clone, Default)]
pub struct CachedTime {
    entry: Option<(String, DateTime<Utc>, Instant)>,
}

impl CachedTime {
    /// Cached answer from `server` advanced to `now`, if younger than `window`.
    pub fn get(&self, server: &str, window: Duration, now: Instant) -> Option<DateTime<Utc>> {
        if window.is_zero() {
            return None;
        }
        let (cached_server, time, taken) = self.entry.as_ref()?;
        if cached_server != server {
            return None;
        }
        let age = now.checked_duration_since(*taken)?;
        if age >= window {
            return None;
        }
        let age = chrono::Duration::from_std(age).ok()?;
        time.checked_add_signed(age)
    }

    pub fn store(&mut self, server: &str, time: DateTime<Utc>, taken: Instant) {
        self.entry = Some((server.to_string(), time, taken));
    }
}

/// Cache shared by every client one connector hands out.
pub type SharedCache = Arc<Mutex<CachedTime>>;

pub struct NtpClient {
    options: NtpOptions,
    pool: SocketPool,
    cache: SharedCache,
}

impl NtpClient {
    pub fn new(pool: SocketPool, options: NtpOptions) -> Self {
        NtpClient::with_cache(pool, options, SharedCache::default())
    }

    pub fn with_cache(pool: SocketPool, options: NtpOptions, cache: SharedCache) -> Self {
        NtpClient {
            options,
            pool,
            cache,
        }
    }

    pub fn options(&self) -> &NtpOptions {
        &self.options
    }

    fn query_server(&self) -> Result<DateTime<Utc>> {
        let mut client = SntpClient::new();
        client.set_timeout(self.options.timeout);
        client.set_bind_address(self.pool.local_address());

        let result = client.synchronize(&self.options.server)?;
        debug!(
            "SNTP {}: offset {:.3}s, round trip {:.3}s",
            self.options.server,
            result.clock_offset().as_secs_f64(),
            result.round_trip_delay().as_secs_f64()
        );

        Ok(result.datetime().into_chrono_datetime()?)
    }
}

impl NtpSource for NtpClient {
    fn datetime(&mut self) -> Result<DateTime<FixedOffset>> {
        let server = self.options.server.as_str();
        let cached = lock(&self.cache).get(server, self.options.cache, Instant::now());
        let utc = match cached {
            Some(cached) => {
                debug!("Using cached NTP time from {}", server);
                cached
            }
            None => {
                let fresh = self.query_server()?;
                if !self.options.cache.is_zero() {
                    lock(&self.cache).store(server, fresh, Instant::now());
                }
                fresh
            }
        };
        Ok(utc.with_timezone(&self.options.utc_offset))
    }
}

fn lock(cache: &SharedCache) -> MutexGuard<'_, CachedTime> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builds an `NtpClient` per sync run. The clients share one cache, so
/// `NTP_CACHE_SECONDS` spans consecutive syncs against the same server.
#[derive(Debug, Default, Clone)]
pub struct SntpConnector {
    cache: SharedCache,
}

impl NtpConnector for SntpConnector {
    fn client(&self, pool: &SocketPool, options: &NtpOptions) -> Box<dyn NtpSource> {
        Box::new(NtpClient::with_cache(
            pool.clone(),
            options.clone(),
            self.cache.clone(),
        ))
    }
}
