pub mod config;
pub mod controller;
pub mod error;
pub mod nmcli;
pub mod ntp;
pub mod radio;
pub mod settings;
pub mod traits;

#[cfg(target_os = "linux")]
pub mod rtc;

pub use config::{SyncRequest, Tuning};
pub use controller::{RetryPolicy, SyncOutcome, TimeSync};
pub use error::SyncError;
pub use settings::Settings;
