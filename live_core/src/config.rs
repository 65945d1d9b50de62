//! Runtime settings read from the environment (`LIVE_*`) and an optional `.env` file.
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;

use crate::{
    data::PortalOptions,
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Local time of the before-trading-start callback, `HH:MM`.
    #[serde(default = "default_bts_time")]
    pub bts_time: String,
    #[serde(default = "default_bts_tz")]
    pub bts_tz: String,
    #[serde(default = "default_nan_retry_attempts")]
    pub nan_retry_attempts: usize,
    /// Serve the latest known value when the current period has no data.
    #[serde(default = "default_true")]
    pub data_compat: bool,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default = "default_true")]
    pub flip_compatible: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_fetch_workers() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_bts_time() -> String {
    "08:45".into()
}

fn default_bts_tz() -> String {
    "America/New_York".into()
}

fn default_nan_retry_attempts() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> String {
    "./logs".into()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fetch_workers: default_fetch_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            bts_time: default_bts_time(),
            bts_tz: default_bts_tz(),
            nan_retry_attempts: default_nan_retry_attempts(),
            data_compat: true,
            continue_on_error: true,
            flip_compatible: true,
            log_dir: default_log_dir(),
        }
    }
}

impl Settings {
    pub const PREFIX: &'static str = "LIVE_";

    /// Reads `.env` if present, then the process environment.
    pub fn load() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv_override() {
            tracing::debug!("No .env loaded: {e}");
        }
        envy::prefixed(Self::PREFIX)
            .from_env()
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(Self::PREFIX)
            .from_iter(pairs)
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn before_trading_start(&self) -> Result<(NaiveTime, Tz)> {
        let time = NaiveTime::parse_from_str(&self.bts_time, "%H:%M")
            .map_err(|e| Error::Config(format!("bad before trading start time '{}': {e}", self.bts_time)))?;
        let tz: Tz = self
            .bts_tz
            .parse()
            .map_err(|e| Error::Config(format!("bad timezone '{}': {e}", self.bts_tz)))?;
        Ok((time, tz))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn portal_options(&self) -> PortalOptions {
        PortalOptions {
            fetch_workers: self.fetch_workers,
            nan_retry_attempts: self.nan_retry_attempts,
            compat: self.data_compat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_pairs(Vec::new()).unwrap();
        assert_eq!(settings, Settings::default());
        let (time, tz) = settings.before_trading_start().unwrap();
        assert_eq!(time, NaiveTime::from_hms_opt(8, 45, 0).unwrap());
        assert_eq!(tz, chrono_tz::America::New_York);
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_prefixed_overrides() {
        let settings = Settings::from_pairs(pairs(&[
            ("LIVE_FETCH_WORKERS", "25"),
            ("LIVE_BTS_TIME", "09:00"),
            ("LIVE_CONTINUE_ON_ERROR", "false"),
            ("LIVE_NAN_RETRY_ATTEMPTS", "1"),
            ("OTHER_FETCH_WORKERS", "3"),
        ]))
        .unwrap();
        assert_eq!(settings.fetch_workers, 25);
        assert!(!settings.continue_on_error);
        assert_eq!(settings.portal_options().nan_retry_attempts, 1);
        assert_eq!(
            settings.before_trading_start().unwrap().0,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        assert!(matches!(
            Settings::from_pairs(pairs(&[("LIVE_FETCH_WORKERS", "many")])),
            Err(Error::Config(_))
        ));
        let settings = Settings {
            bts_tz: "Mars/Olympus".into(),
            ..Settings::default()
        };
        assert!(matches!(settings.before_trading_start(), Err(Error::Config(_))));
    }
}
