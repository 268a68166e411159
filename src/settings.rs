use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

/// Key/value settings, looked up at call time.
///
/// Lookups consult the process environment first (unless disabled) and then
/// the values loaded from a `settings.toml` file, mirroring how a
/// CircuitPython board exposes `settings.toml` through `os.getenv`.
#[derive(Debug, Clone)]
pub struct Settings {
    values: HashMap<String, String>,
    use_process_env: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from_env()
    }
}

impl Settings {
    /// Process environment only.
    pub fn from_env() -> Self {
        Settings {
            values: HashMap::new(),
            use_process_env: true,
        }
    }

    /// Fixed values that ignore the process environment.
    pub fn isolated<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Settings {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            use_process_env: false,
        }
    }

    /// Loads `path` beneath the process environment. A missing file is not
    /// an error; the environment alone is used.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No settings file at {}, using environment only", path.display());
                return Ok(Settings::from_env());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let mut settings = Settings::from_toml_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        settings.use_process_env = true;
        debug!("Loaded {} setting(s) from {}", settings.values.len(), path.display());
        Ok(settings)
    }

    /// Parses top-level `KEY = value` pairs. Nested tables and arrays have no
    /// meaning here and are skipped.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text)?;
        let mut values = HashMap::with_capacity(table.len());

        for (key, value) in table {
            let flat = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Datetime(d) => d.to_string(),
                toml::Value::Array(_) | toml::Value::Table(_) => {
                    warn!("Ignoring non-scalar setting {}", key);
                    continue;
                }
            };
            values.insert(key, flat);
        }

        Ok(Settings {
            values,
            use_process_env: false,
        })
    }

    pub fn with_process_env(mut self, enabled: bool) -> Self {
        self.use_process_env = enabled;
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Raw value; an empty string counts as present here.
    pub fn get(&self, key: &str) -> Option<String> {
        if self.use_process_env {
            if let Ok(v) = std::env::var(key) {
                return Some(v);
            }
        }
        self.values.get(key).cloned()
    }

    /// Value with empty strings treated as absent.
    pub fn non_empty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Parsed value, falling back to `default` when the key is absent, empty
    /// or does not parse.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.non_empty(key) {
            Some(raw) => match raw.trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    debug!("Setting {}={:?} does not parse, using default", key, raw);
                    default
                }
            },
            None => default,
        }
    }

    pub fn float_or(&self, key: &str, default: f64) -> f64 {
        self.parse_or(key, default)
    }
}
