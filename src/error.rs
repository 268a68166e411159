//! Error taxonomy for a sync run.
//!
//! Operations return `anyhow::Result` so driver, socket and NTP errors pass
//! through untouched. The variants below are either returned directly or
//! attached as context, so callers classify a failure with
//! `err.downcast_ref::<SyncError>()`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Wi-Fi credentials are absent or empty. Never retried.
    #[error("Add CIRCUITPY_WIFI_SSID/PASSWORD to settings.toml")]
    MissingCredentials,

    /// A resolved value cannot be used (negative delay, zero timeout, ...).
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    /// The access point could not be joined. The radio error is the source.
    #[error("could not join access point after {attempts} attempt(s)")]
    Connection { attempts: u32 },

    /// The server answered with an implausible date; the RTC was left alone.
    #[error("NTP returned an unexpected year ({year} < {required}); not setting RTC")]
    UnexpectedYear { year: i32, required: i32 },

    /// A bounded retry policy gave up. The last sync error is the source.
    #[error("time sync failed after {attempts} attempt(s)")]
    RetriesExhausted { attempts: u32 },

    #[error("time sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        SyncError::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_context_layer_is_downcastable() {
        let root: anyhow::Result<()> = Err(anyhow::anyhow!("association rejected"));
        let err = root.context(SyncError::Connection { attempts: 3 }).unwrap_err();

        assert_eq!(
            err.downcast_ref::<SyncError>(),
            Some(&SyncError::Connection { attempts: 3 })
        );
        assert_eq!(err.root_cause().to_string(), "association rejected");
    }

    #[test]
    fn test_year_message_mentions_rtc() {
        let msg = SyncError::UnexpectedYear { year: 2000, required: 2022 }.to_string();
        assert!(msg.starts_with("NTP returned an unexpected year"));
        assert!(msg.contains("not setting RTC"));
    }
}
