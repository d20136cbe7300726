use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use chrono_tz::Tz;
use ulid::Ulid;

use crate::clock::WallTime;
use crate::engine::LayoutConfig;

pub const DEFAULT_TZ: &str = "America/Chicago";

/// Runtime settings, read from `SLOTWISE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub tz: Tz,
    pub layout: LayoutConfig,
    pub metrics_port: Option<u16>,
    /// JSON snapshot to seed the store from.
    pub snapshot: Option<PathBuf>,
    /// Only this location; every scheduled location when unset.
    pub location_id: Option<Ulid>,
    /// Defaults to today in `tz`.
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.var, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

fn parse<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|e: T::Err| ConfigError {
            var,
            reason: e.to_string(),
            value: v,
        }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tz_name = get("SLOTWISE_TZ").unwrap_or_else(|| DEFAULT_TZ.into());
        let tz = tz_name.parse::<Tz>().map_err(|e| ConfigError {
            var: "SLOTWISE_TZ",
            reason: e.to_string(),
            value: tz_name.clone(),
        })?;

        let defaults = LayoutConfig::default();
        let layout = LayoutConfig {
            day_start: parse::<WallTime>("SLOTWISE_DAY_START", get("SLOTWISE_DAY_START"))?
                .unwrap_or(defaults.day_start),
            day_end: parse::<WallTime>("SLOTWISE_DAY_END", get("SLOTWISE_DAY_END"))?
                .unwrap_or(defaults.day_end),
            px_per_minute: parse::<f64>("SLOTWISE_PX_PER_MINUTE", get("SLOTWISE_PX_PER_MINUTE"))?
                .unwrap_or(defaults.px_per_minute),
            min_height: parse::<f64>("SLOTWISE_MIN_HEIGHT", get("SLOTWISE_MIN_HEIGHT"))?
                .unwrap_or(defaults.min_height),
            include_cancelled: defaults.include_cancelled,
        };
        layout.validate().map_err(|e| ConfigError {
            var: "SLOTWISE_DAY_START",
            value: format!("{}-{} @ {}px", layout.day_start, layout.day_end, layout.px_per_minute),
            reason: e.to_string(),
        })?;

        Ok(Self {
            tz,
            layout,
            metrics_port: parse("SLOTWISE_METRICS_PORT", get("SLOTWISE_METRICS_PORT"))?,
            snapshot: get("SLOTWISE_SNAPSHOT").map(PathBuf::from),
            location_id: parse("SLOTWISE_LOCATION", get("SLOTWISE_LOCATION"))?,
            date: parse("SLOTWISE_DATE", get("SLOTWISE_DATE"))?,
        })
    }
}
