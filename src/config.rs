use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::error::SyncError;
use crate::settings::Settings;

pub const KEY_WIFI_SSID: &str = "CIRCUITPY_WIFI_SSID";
pub const KEY_WIFI_PASSWORD: &str = "CIRCUITPY_WIFI_PASSWORD";
pub const KEY_SERVER: &str = "NTP_SERVER";
pub const KEY_TZ: &str = "NTP_TZ";
pub const KEY_DST: &str = "NTP_DST";
pub const KEY_TIMEOUT: &str = "NTP_TIMEOUT";
pub const KEY_RETRIES: &str = "NTP_RETRIES";
pub const KEY_RETRY_DELAY: &str = "NTP_DELAY_S";
pub const KEY_CACHE_SECONDS: &str = "NTP_CACHE_SECONDS";
pub const KEY_INTERVAL: &str = "NTP_INTERVAL";

pub const DEFAULT_SERVER: &str = "pool.ntp.org";
pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_CACHE_SECONDS: u64 = 0;
pub const DEFAULT_REQUIRE_YEAR: i32 = 2022;

/// Per-call overrides for the tuning knobs. `None` defers to settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    pub timeout: Option<f64>,
    pub retries: Option<u32>,
    pub retry_delay: Option<f64>,
    pub cache_seconds: Option<u64>,
    pub require_year: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncRequest {
    pub server: Option<String>,
    /// Base UTC offset in hours. `NTP_DST` is added on top regardless.
    pub tz_offset: Option<f64>,
    pub tuning: Tuning,
}

#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fully resolved configuration for one sync run. Built fresh each call.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub credentials: Credentials,
    pub server: String,
    pub tz_offset_hours: f64,
    pub utc_offset: FixedOffset,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub cache: Duration,
    pub require_year: i32,
    /// `None` means "do not schedule a resync".
    pub interval: Option<Duration>,
}

impl SyncConfig {
    /// Resolves every value as override, then setting, then default.
    /// Credentials are checked first so a misconfigured device fails before
    /// anything else is looked at.
    pub fn resolve(settings: &Settings, request: &SyncRequest) -> Result<Self, SyncError> {
        let credentials = match (
            settings.non_empty(KEY_WIFI_SSID),
            settings.non_empty(KEY_WIFI_PASSWORD),
        ) {
            (Some(ssid), Some(password)) => Credentials { ssid, password },
            _ => return Err(SyncError::MissingCredentials),
        };

        let server = request
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| settings.non_empty(KEY_SERVER))
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        let base_tz = request
            .tz_offset
            .unwrap_or_else(|| settings.float_or(KEY_TZ, 0.0));
        let tz_offset_hours = base_tz + settings.float_or(KEY_DST, 0.0);
        let utc_offset = utc_offset_from_hours(tz_offset_hours)?;

        let tuning = &request.tuning;
        let timeout_secs = tuning
            .timeout
            .unwrap_or_else(|| settings.float_or(KEY_TIMEOUT, DEFAULT_TIMEOUT_SECS));
        if !(timeout_secs > 0.0) {
            return Err(SyncError::invalid(
                "timeout",
                format!("must be positive, got {}", timeout_secs),
            ));
        }
        let timeout = seconds("timeout", timeout_secs)?;

        let retries = tuning
            .retries
            .unwrap_or_else(|| settings.parse_or(KEY_RETRIES, DEFAULT_RETRIES));
        let retry_delay = seconds(
            "retry_delay",
            tuning
                .retry_delay
                .unwrap_or_else(|| settings.float_or(KEY_RETRY_DELAY, DEFAULT_RETRY_DELAY_SECS)),
        )?;
        let cache = Duration::from_secs(
            tuning
                .cache_seconds
                .unwrap_or_else(|| settings.parse_or(KEY_CACHE_SECONDS, DEFAULT_CACHE_SECONDS)),
        );
        let require_year = tuning.require_year.unwrap_or(DEFAULT_REQUIRE_YEAR);

        let interval_secs: i64 = settings.parse_or(KEY_INTERVAL, 0);
        let interval = (interval_secs > 0).then(|| Duration::from_secs(interval_secs as u64));
        if let Some(interval) = interval {
            // next_sync is computed after the RTC write and must not overflow there
            if SystemTime::now().checked_add(interval).is_none() {
                return Err(SyncError::invalid(
                    "interval",
                    format!("{}s is too far in the future", interval_secs),
                ));
            }
        }

        Ok(SyncConfig {
            credentials,
            server,
            tz_offset_hours,
            utc_offset,
            timeout,
            retries,
            retry_delay,
            cache,
            require_year,
            interval,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Converts fractional hours (e.g. 5.5 or -3.75) to a chrono offset.
pub fn utc_offset_from_hours(hours: f64) -> Result<FixedOffset, SyncError> {
    if !hours.is_finite() {
        return Err(SyncError::invalid("tz_offset", format!("{} is not finite", hours)));
    }
    let secs = (hours * 3600.0).round();
    if secs.abs() >= 86_400.0 {
        return Err(SyncError::invalid("tz_offset", format!("{}h is out of range", hours)));
    }
    FixedOffset::east_opt(secs as i32)
        .ok_or_else(|| SyncError::invalid("tz_offset", format!("{}h is out of range", hours)))
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, SyncError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| SyncError::invalid(name, format!("{} is not a valid duration", value)))
}
