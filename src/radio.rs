//! Radio session: the set of hardware handles a sync run needs.
//!
//! Handles are opened lazily by `acquire` and kept until `release`. The
//! session is an ordinary value owned by the caller, so there is no hidden
//! process-wide state; holding one session per device is the caller's job.

use anyhow::Result;
use log::debug;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use crate::traits::{ControlLine, Radio, RadioBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    ChipSelect,
    Busy,
    Reset,
}

impl Line {
    pub const ALL: [Line; 3] = [Line::ChipSelect, Line::Busy, Line::Reset];

    pub fn as_str(self) -> &'static str {
        match self {
            Line::ChipSelect => "cs",
            Line::Busy => "busy",
            Line::Reset => "reset",
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where protocol sockets are created: the local address they bind to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPool {
    pub bind_address: SocketAddr,
    /// When set, sockets bind to this interface's IPv4 address instead.
    pub interface: Option<String>,
}

impl SocketPool {
    pub fn new(bind_address: SocketAddr) -> Self {
        SocketPool {
            bind_address,
            interface: None,
        }
    }

    /// Any local address, ephemeral port.
    pub fn unspecified() -> Self {
        SocketPool::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    pub fn on_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Address to bind a socket to right now. The interface address is
    /// looked up late because it only exists once the radio has joined.
    pub fn local_address(&self) -> SocketAddr {
        let Some(name) = self.interface.as_deref() else {
            return self.bind_address;
        };
        let found = match if_addrs::get_if_addrs() {
            Ok(ifaces) => ifaces
                .into_iter()
                .find(|iface| iface.name == name && iface.ip().is_ipv4())
                .map(|iface| iface.ip()),
            Err(e) => {
                debug!("Could not list interfaces: {}", e);
                None
            }
        };
        match found {
            Some(ip) => SocketAddr::new(ip, self.bind_address.port()),
            None => {
                debug!("No IPv4 address on {}, binding to {}", name, self.bind_address);
                self.bind_address
            }
        }
    }
}

/// Outcome of a reset that is allowed to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetStatus {
    Reset,
    Failed(String),
}

/// Resets the radio, reporting rather than propagating a failure.
pub fn reset_best_effort(radio: &mut dyn Radio) -> ResetStatus {
    match radio.reset() {
        Ok(()) => ResetStatus::Reset,
        Err(e) => {
            debug!("Radio reset failed (ignored): {:#}", e);
            ResetStatus::Failed(e.to_string())
        }
    }
}

/// Lines whose release failed during `RadioSession::release`.
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub failed: Vec<(Line, String)>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RadioSession<B: RadioBackend> {
    backend: B,
    chip_select: Option<Box<dyn ControlLine>>,
    busy: Option<Box<dyn ControlLine>>,
    reset: Option<Box<dyn ControlLine>>,
    radio: Option<Box<dyn Radio>>,
    pool: Option<SocketPool>,
    radios_opened: u64,
}

impl<B: RadioBackend> RadioSession<B> {
    pub fn new(backend: B) -> Self {
        RadioSession {
            backend,
            chip_select: None,
            busy: None,
            reset: None,
            radio: None,
            pool: None,
            radios_opened: 0,
        }
    }

    /// Opens whatever is missing (lines, then radio, then pool) and hands out
    /// the radio and its pool. Already-open handles are reused; on failure the
    /// ones opened so far stay cached for the next attempt.
    pub fn acquire(&mut self) -> Result<(&mut dyn Radio, &SocketPool)> {
        for line in Line::ALL {
            let slot = match line {
                Line::ChipSelect => &mut self.chip_select,
                Line::Busy => &mut self.busy,
                Line::Reset => &mut self.reset,
            };
            if slot.is_none() {
                *slot = Some(self.backend.open_line(line)?);
                debug!("Claimed {} line", line);
            }
        }

        let radio = match self.radio.take() {
            Some(radio) => radio,
            None => {
                let radio = self.backend.open_radio()?;
                self.radios_opened += 1;
                debug!("Radio opened (#{})", self.radios_opened);
                radio
            }
        };
        let radio = self.radio.insert(radio);

        let pool = match self.pool.take() {
            Some(pool) => pool,
            None => radio.socket_pool()?,
        };
        let pool = self.pool.insert(pool);

        Ok((radio.as_mut(), pool))
    }

    /// Releases every held line independently and forgets all handles, so
    /// the next `acquire` starts from scratch.
    pub fn release(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for line in Line::ALL {
            let slot = match line {
                Line::ChipSelect => &mut self.chip_select,
                Line::Busy => &mut self.busy,
                Line::Reset => &mut self.reset,
            };
            if let Some(mut handle) = slot.take() {
                if let Err(e) = handle.release() {
                    debug!("Releasing {} line failed: {:#}", line, e);
                    report.failed.push((line, e.to_string()));
                }
            }
        }

        self.radio = None;
        self.pool = None;
        report
    }

    pub fn is_acquired(&self) -> bool {
        self.radio.is_some() && self.pool.is_some()
    }

    /// How many times a radio handle has been created.
    pub fn radios_opened(&self) -> u64 {
        self.radios_opened
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockControlLine, MockRadio, MockRadioBackend};
    use anyhow::anyhow;
    use mockall::predicate::eq;

    fn quiet_radio() -> MockRadio {
        let mut radio = MockRadio::new();
        radio
            .expect_socket_pool()
            .returning(|| Ok(SocketPool::unspecified()));
        radio
    }

    fn releasing_line(times: usize) -> MockControlLine {
        let mut line = MockControlLine::new();
        line.expect_release().times(times).returning(|| Ok(()));
        line
    }

    #[test]
    fn test_acquire_opens_once_and_reuses() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut backend = MockRadioBackend::new();
        backend
            .expect_open_line()
            .times(3)
            .returning(|_| Ok(Box::new(MockControlLine::new())));
        backend
            .expect_open_radio()
            .times(1)
            .return_once(|| Ok(Box::new(quiet_radio())));

        let mut session = RadioSession::new(backend);
        assert!(!session.is_acquired());

        {
            let (_, pool) = session.acquire().unwrap();
            assert_eq!(pool, &SocketPool::unspecified());
        }
        session.acquire().unwrap();

        assert!(session.is_acquired());
        assert_eq!(session.radios_opened(), 1);
    }

    #[test]
    fn test_lines_open_in_order_before_radio() {
        let mut seq = mockall::Sequence::new();
        let mut backend = MockRadioBackend::new();
        for line in Line::ALL {
            backend
                .expect_open_line()
                .with(eq(line))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(Box::new(MockControlLine::new())));
        }
        backend
            .expect_open_radio()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|| Ok(Box::new(quiet_radio())));

        let mut session = RadioSession::new(backend);
        session.acquire().unwrap();
    }

    #[test]
    fn test_partial_acquire_keeps_opened_lines() {
        let mut backend = MockRadioBackend::new();
        backend
            .expect_open_line()
            .times(3)
            .returning(|_| Ok(Box::new(MockControlLine::new())));
        let mut first = true;
        backend.expect_open_radio().times(2).returning(move || {
            if first {
                first = false;
                Err(anyhow!("spi bus busy"))
            } else {
                Ok(Box::new(quiet_radio()))
            }
        });

        let mut session = RadioSession::new(backend);
        let err = session.acquire().err().unwrap();
        assert_eq!(err.to_string(), "spi bus busy");
        assert!(!session.is_acquired());

        // lines are not reopened on the second try
        session.acquire().unwrap();
        assert_eq!(session.radios_opened(), 1);
    }

    #[test]
    fn test_release_continues_past_failures() {
        let mut backend = MockRadioBackend::new();
        backend.expect_open_line().returning(|line| {
            let mut handle = MockControlLine::new();
            if line == Line::ChipSelect {
                handle
                    .expect_release()
                    .times(1)
                    .returning(|| Err(anyhow!("pin already freed")));
            } else {
                handle.expect_release().times(1).returning(|| Ok(()));
            }
            Ok(Box::new(handle))
        });
        backend
            .expect_open_radio()
            .return_once(|| Ok(Box::new(quiet_radio())));

        let mut session = RadioSession::new(backend);
        session.acquire().unwrap();

        let report = session.release();
        assert!(!report.is_clean());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Line::ChipSelect);
        assert!(!session.is_acquired());
    }

    #[test]
    fn test_release_then_acquire_recreates_everything() {
        let mut backend = MockRadioBackend::new();
        backend
            .expect_open_line()
            .times(6)
            .returning(|_| Ok(Box::new(releasing_line(1))));
        backend
            .expect_open_radio()
            .times(2)
            .returning(|| Ok(Box::new(quiet_radio())));

        let mut session = RadioSession::new(backend);
        session.acquire().unwrap();
        assert!(session.release().is_clean());
        session.acquire().unwrap();

        assert_eq!(session.radios_opened(), 2);
        assert!(session.release().is_clean());
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let backend = MockRadioBackend::new();
        let mut session = RadioSession::new(backend);
        assert!(session.release().is_clean());
    }

    #[test]
    fn test_local_address_follows_interface() {
        let plain = SocketPool::unspecified();
        assert_eq!(plain.local_address(), plain.bind_address);

        if cfg!(target_os = "linux") {
            let loopback = SocketPool::unspecified().on_interface("lo");
            assert_eq!(loopback.local_address().ip(), Ipv4Addr::LOCALHOST);
        }

        let missing = SocketPool::unspecified().on_interface("nosuch0");
        assert!(missing.local_address().ip().is_unspecified());
    }

    #[test]
    fn test_reset_best_effort_reports_failure() {
        let mut radio = MockRadio::new();
        radio
            .expect_reset()
            .times(1)
            .returning(|| Err(anyhow!("no response from module")));
        assert_eq!(
            reset_best_effort(&mut radio),
            ResetStatus::Failed("no response from module".into())
        );

        let mut radio = MockRadio::new();
        radio.expect_reset().times(1).returning(|| Ok(()));
        assert_eq!(reset_best_effort(&mut radio), ResetStatus::Reset);
    }
}
