use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Candle timeframe a bot analyzes on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[default]
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        match self {
            Self::M1 => 60 * 1000,
            Self::M5 => 5 * 60 * 1000,
            Self::M15 => 15 * 60 * 1000,
            Self::M30 => 30 * 60 * 1000,
            Self::H1 => 60 * 60 * 1000,
            Self::H4 => 4 * 60 * 60 * 1000,
            Self::D1 => 24 * 60 * 60 * 1000,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Timestamp of the next candle close strictly after `now`.
    ///
    /// A timestamp sitting exactly on a boundary rolls to the following
    /// close, so a tick scheduled at a close never fires twice for the
    /// same candle.
    #[must_use]
    pub fn next_close(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tf = self.as_millis();
        let now_ms = now.timestamp_millis();
        let next_ms = (now_ms / tf + 1) * tf;
        Utc.timestamp_millis_opt(next_ms).single().unwrap_or(now)
    }

    /// Delay from `now` until the next candle close.
    #[must_use]
    pub fn next_close_delay(self, now: DateTime<Utc>) -> Duration {
        let millis = (self.next_close(now).timestamp_millis() - now.timestamp_millis()).max(0);
        Duration::from_millis(millis as u64)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "1m" => Self::M1,
            "5m" => Self::M5,
            "15m" => Self::M15,
            "30m" => Self::M30,
            "1h" => Self::H1,
            "4h" => Self::H4,
            "1d" => Self::D1,
            _ => anyhow::bail!(
                "Unsupported timeframe: '{s}'. Valid: 1m, 5m, 15m, 30m, 1h, 4h, 1d"
            ),
        })
    }
}
