//! Sync orchestrator.
//!
//! `TimeSync` owns the radio session and the collaborators and runs one
//! sync per call:
//! 1. Resolve configuration (credentials first)
//! 2. Acquire radio handles (lazy, cached across calls)
//! 3. Join the access point with bounded retries, resetting the radio between tries
//! 4. Fetch the time, check the year, write the RTC
//! 5. Report when the next sync is due

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crate::config::{Credentials, SyncConfig, SyncRequest};
use crate::error::SyncError;
use crate::ntp::NtpOptions;
use crate::radio::{reset_best_effort, RadioSession, ReleaseReport, ResetStatus};
use crate::settings::Settings;
use crate::traits::{HardwareClock, NtpConnector, Radio, RadioBackend};

const SETUP_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Time written to the RTC, in the configured offset.
    pub now: DateTime<FixedOffset>,
    /// When the caller should sync again; `None` disables resyncing.
    pub next_sync: Option<SystemTime>,
}

/// How `setup_ntp_with` retries failed syncs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// `None` retries until success.
    pub max_attempts: Option<u32>,
    pub delay: Duration,
    /// Multiplier applied to the delay after each failure.
    pub backoff: f64,
    pub max_delay: Duration,
    /// Checked before every attempt and after every wait.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RetryPolicy {
    /// Fixed one-second delay, no attempt limit.
    pub fn forever() -> Self {
        RetryPolicy {
            max_attempts: None,
            delay: SETUP_RETRY_DELAY,
            backoff: 1.0,
            max_delay: SETUP_RETRY_DELAY,
            cancel: None,
        }
    }

    /// Gives up after `max_attempts` failures. Zero is rejected by
    /// `setup_ntp_with` rather than read as "no attempt".
    pub fn bounded(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts),
            ..RetryPolicy::forever()
        }
    }

    pub fn with_backoff(mut self, backoff: f64, max_delay: Duration) -> Self {
        self.backoff = backoff;
        self.max_delay = max_delay;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Delay before attempt `failures + 1`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(failures.saturating_sub(1) as i32);
        let scaled = self.delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_delay)
            .min(self.max_delay.max(self.delay))
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

pub struct TimeSync<B, N, R>
where
    B: RadioBackend,
    N: NtpConnector,
    R: HardwareClock,
{
    session: RadioSession<B>,
    connector: N,
    rtc: R,
    settings: Settings,
}

impl<B, N, R> TimeSync<B, N, R>
where
    B: RadioBackend,
    N: NtpConnector,
    R: HardwareClock,
{
    pub fn new(backend: B, connector: N, rtc: R, settings: Settings) -> Self {
        TimeSync {
            session: RadioSession::new(backend),
            connector,
            rtc,
            settings,
        }
    }

    pub fn session(&self) -> &RadioSession<B> {
        &self.session
    }

    pub fn rtc(&self) -> &R {
        &self.rtc
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// One sync: join Wi-Fi, fetch NTP time, validate it, set the RTC.
    ///
    /// Fails with `SyncError::MissingCredentials` before touching hardware,
    /// `SyncError::Connection` (radio error as source) once every attempt to
    /// join has failed, and `SyncError::UnexpectedYear` without writing the
    /// RTC. Other driver, socket and NTP errors are returned as they are.
    pub fn sync_time(&mut self, request: &SyncRequest) -> Result<SyncOutcome> {
        let config = SyncConfig::resolve(&self.settings, request)?;
        debug!(
            "Sync: server={} tz={:+}h timeout={:?} retries={} cache={:?}",
            config.server, config.tz_offset_hours, config.timeout, config.retries, config.cache
        );

        let (radio, pool) = self.session.acquire()?;
        connect_with_retries(radio, &config.credentials, config.retries, config.retry_delay)?;

        let options = NtpOptions {
            server: config.server.clone(),
            utc_offset: config.utc_offset,
            timeout: config.timeout,
            cache: config.cache,
        };
        let mut client = self.connector.client(pool, &options);
        let now = client.datetime()?;

        if now.year() < config.require_year {
            return Err(SyncError::UnexpectedYear {
                year: now.year(),
                required: config.require_year,
            }
            .into());
        }

        self.rtc.set_datetime(now)?;
        debug!("RTC set to {}", now);

        let next_sync = config
            .interval
            .and_then(|interval| SystemTime::now().checked_add(interval));
        Ok(SyncOutcome { now, next_sync })
    }

    /// Releases the control lines and drops every cached handle so the next
    /// sync reacquires them. Useful after hot-reloading code on a device.
    pub fn release_pins(&mut self) -> ReleaseReport {
        let report = self.session.release();
        for (line, err) in &report.failed {
            debug!("Could not release {} line: {}", line, err);
        }
        report
    }

    /// Retries `sync_time` with default arguments until it succeeds, one
    /// second apart, logging each failure.
    ///
    /// This never gives up: with wrong credentials or no network it blocks
    /// forever. Prefer `setup_ntp_with` and a bounded `RetryPolicy` for
    /// anything unattended.
    pub fn setup_ntp(&mut self) -> SyncOutcome {
        info!("Fetching time via NTP.");
        loop {
            match self.sync_time(&SyncRequest::default()) {
                Ok(outcome) => {
                    info!("NTP OK, localtime: {}", outcome.now);
                    return outcome;
                }
                Err(e) => {
                    warn!("Exception: {:#}", e);
                    thread::sleep(SETUP_RETRY_DELAY);
                }
            }
        }
    }

    /// Like `setup_ntp`, but with caller-chosen request, limits and backoff.
    pub fn setup_ntp_with(
        &mut self,
        request: &SyncRequest,
        policy: &RetryPolicy,
    ) -> Result<SyncOutcome> {
        if policy.max_attempts == Some(0) {
            return Err(SyncError::invalid("max_attempts", "must be at least 1").into());
        }
        info!("Fetching time via NTP.");
        let mut failures: u32 = 0;

        loop {
            if policy.cancelled() {
                return Err(SyncError::Cancelled.into());
            }

            let err = match self.sync_time(request) {
                Ok(outcome) => {
                    info!("NTP OK, localtime: {}", outcome.now);
                    return Ok(outcome);
                }
                Err(e) => e,
            };
            failures = failures.saturating_add(1);

            if policy.max_attempts.is_some_and(|max| failures >= max) {
                return Err(err).context(SyncError::RetriesExhausted { attempts: failures });
            }

            let delay = policy.delay_after(failures);
            warn!("Exception: {:#} (retrying in {:?})", err, delay);
            thread::sleep(delay);
        }
    }
}

/// Joins the access point, trying `retries + 1` times in total.
fn connect_with_retries(
    radio: &mut dyn Radio,
    credentials: &Credentials,
    retries: u32,
    retry_delay: Duration,
) -> Result<()> {
    let attempts = retries.saturating_add(1);

    for attempt in 1..=attempts {
        if radio.is_connected() {
            return Ok(());
        }
        let err = match radio.connect(&credentials.ssid, &credentials.password) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if attempt == attempts {
            return Err(err).context(SyncError::Connection { attempts });
        }

        debug!("Connect attempt {}/{} failed: {:#}", attempt, attempts, err);
        if let ResetStatus::Failed(reason) = reset_best_effort(radio) {
            debug!("Continuing after failed reset: {}", reason);
        }
        thread::sleep(retry_delay);
    }

    Ok(())
}
