use anyhow::Result;
use chrono::{DateTime, FixedOffset};

use crate::ntp::NtpOptions;
use crate::radio::{Line, SocketPool};

/// Wi-Fi radio as seen by the orchestrator. The association state machine
/// lives in the driver; only the connected flag is observed here.
#[cfg_attr(test, mockall::automock)]
pub trait Radio {
    fn is_connected(&self) -> bool;

    fn connect(&mut self, ssid: &str, password: &str) -> Result<()>;

    /// Hard reset of the radio module.
    fn reset(&mut self) -> Result<()>;

    /// Address pool that protocol sockets are created from.
    fn socket_pool(&self) -> Result<SocketPool>;
}

/// A claimed hardware control line (chip select, busy, reset).
#[cfg_attr(test, mockall::automock)]
pub trait ControlLine {
    fn release(&mut self) -> Result<()>;
}

/// Opens the hardware handles a `RadioSession` caches.
#[cfg_attr(test, mockall::automock)]
pub trait RadioBackend {
    fn open_line(&mut self, line: Line) -> Result<Box<dyn ControlLine>>;

    fn open_radio(&mut self) -> Result<Box<dyn Radio>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait NtpSource {
    /// Current wall-clock time in the client's configured offset.
    fn datetime(&mut self) -> Result<DateTime<FixedOffset>>;
}

/// Builds a time-protocol client bound to a socket pool.
#[cfg_attr(test, mockall::automock)]
pub trait NtpConnector {
    fn client(&self, pool: &SocketPool, options: &NtpOptions) -> Box<dyn NtpSource>;
}

/// Battery-backed clock that survives power loss.
#[cfg_attr(test, mockall::automock)]
pub trait HardwareClock {
    fn set_datetime(&mut self, now: DateTime<FixedOffset>) -> Result<()>;
}
