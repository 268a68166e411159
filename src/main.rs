use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wifi_rtc_sync::nmcli::NetworkManagerBackend;
use wifi_rtc_sync::ntp::SntpConnector;
use wifi_rtc_sync::{RetryPolicy, Settings, SyncOutcome, SyncRequest, TimeSync, Tuning};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// NTP server (overrides NTP_SERVER)
    #[arg(long)]
    server: Option<String>,

    /// Base UTC offset in hours (overrides NTP_TZ; NTP_DST is still added)
    #[arg(long, allow_hyphen_values = true)]
    tz_offset: Option<f64>,

    /// Tuning overrides as JSON, e.g. '{"retries": 5, "require_year": 2025}'
    #[arg(long)]
    tuning: Option<String>,

    #[arg(long, default_value = "settings.toml")]
    settings: PathBuf,

    #[arg(long, default_value = "/dev/rtc0")]
    rtc_device: PathBuf,

    /// Keep retrying failed syncs instead of exiting on the first failure
    #[arg(long, default_value_t = false)]
    retry: bool,

    /// Give up after this many attempts (with --retry)
    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn report(outcome: &SyncOutcome) {
    info!("RTC set: {}", outcome.now);
    match outcome.next_sync {
        Some(at) => {
            let at: DateTime<Local> = at.into();
            info!("Next sync due at {}", at.format("%Y-%m-%d %H:%M:%S"));
        }
        None => info!("Periodic resync disabled (NTP_INTERVAL unset)"),
    }
}

#[cfg(target_os = "linux")]
fn main() -> Result<()> {
    use wifi_rtc_sync::rtc::LinuxRtc;

    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(None)
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let tuning: Tuning = match &args.tuning {
        Some(json) => serde_json::from_str(json).context("invalid --tuning JSON")?,
        None => Tuning::default(),
    };
    let request = SyncRequest {
        server: args.server.clone(),
        tz_offset: args.tz_offset,
        tuning,
    };

    let settings = Settings::load(&args.settings)?;
    let backend = NetworkManagerBackend::from_settings(&settings);
    let rtc = LinuxRtc::new(&args.rtc_device);
    let mut sync = TimeSync::new(backend, SntpConnector::default(), rtc, settings);

    let result = if args.retry {
        let cancel = Arc::new(AtomicBool::new(false));
        let c = cancel.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received. Stopping retries...");
            c.store(true, Ordering::SeqCst);
        })?;

        let mut policy = RetryPolicy::forever().with_cancel(cancel);
        policy.max_attempts = args.max_attempts;
        sync.setup_ntp_with(&request, &policy)
    } else {
        sync.sync_time(&request)
    };

    let report_pins = sync.release_pins();
    if !report_pins.is_clean() {
        warn!("Some control lines could not be released: {:?}", report_pins.failed);
    }

    match result {
        Ok(outcome) => {
            report(&outcome);
            Ok(())
        }
        Err(e) => {
            error!("Time sync failed: {:#}", e);
            Err(e)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    let _ = Args::parse();
    anyhow::bail!("rtcsync only supports Linux hardware clocks")
}
