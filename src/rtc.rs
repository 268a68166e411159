#![cfg(target_os = "linux")]

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use log::debug;
use nix::ioctl_write_ptr;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use crate::traits::HardwareClock;

pub const DEFAULT_RTC_DEVICE: &str = "/dev/rtc0";

// Linux RTC Time Struct
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub tm_sec: i32,
    pub tm_min: i32,
    pub tm_hour: i32,
    pub tm_mday: i32,
    pub tm_mon: i32,
    pub tm_year: i32,
    pub tm_wday: i32,
    pub tm_yday: i32,
    pub tm_isdst: i32,
}

impl RtcTime {
    /// Wall-clock fields of `now` as given; the RTC keeps local time.
    pub fn from_datetime(now: &DateTime<FixedOffset>) -> Self {
        RtcTime {
            tm_sec: now.second() as i32,
            tm_min: now.minute() as i32,
            tm_hour: now.hour() as i32,
            tm_mday: now.day() as i32,
            tm_mon: now.month0() as i32,    // 0-11
            tm_year: now.year() - 1900,     // years since 1900
            tm_wday: now.weekday().num_days_from_sunday() as i32,
            tm_yday: now.ordinal0() as i32,
            tm_isdst: 0,  // ignored by RTC_SET_TIME
        }
    }
}

// Magic 'p' (0x70), number 0x0a
const RTC_MAGIC: u8 = b'p';
const RTC_SET_TIME_CMD: u8 = 0x0a;

ioctl_write_ptr!(rtc_set_time, RTC_MAGIC, RTC_SET_TIME_CMD, RtcTime);

/// `/dev/rtcN` written through `RTC_SET_TIME`. Needs CAP_SYS_TIME.
#[derive(Debug, Clone)]
pub struct LinuxRtc {
    device: PathBuf,
}

impl Default for LinuxRtc {
    fn default() -> Self {
        LinuxRtc::new(DEFAULT_RTC_DEVICE)
    }
}

impl LinuxRtc {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        LinuxRtc {
            device: device.into(),
        }
    }
}

impl HardwareClock for LinuxRtc {
    fn set_datetime(&mut self, now: DateTime<FixedOffset>) -> Result<()> {
        let rtc_val = RtcTime::from_datetime(&now);

        let file = OpenOptions::new()
            .write(true)
            .open(&self.device)
            .with_context(|| format!("failed to open {}", self.device.display()))?;

        unsafe {
            rtc_set_time(file.as_raw_fd(), &rtc_val)
                .with_context(|| format!("RTC_SET_TIME on {}", self.device.display()))?;
        }

        debug!("{} set to {}", self.device.display(), now.naive_local());
        Ok(())
    }
}
