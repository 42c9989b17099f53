//! Time units for interval settings and the clock abstraction.
//!
//! Every store operation that depends on "now" receives the instant explicitly
//! from a [`Clock`], so delayed visibility and staleness can be exercised in
//! tests without sleeping.

use core::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Unit in which interval settings (poll, retry delay, staleness) are expressed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    fn millis_per_unit(&self) -> u64 {
        match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
        }
    }

    /// `amount` of this unit as a std duration (for sleeps and timeouts).
    pub fn duration(&self, amount: u64) -> std::time::Duration {
        std::time::Duration::from_millis(amount.saturating_mul(self.millis_per_unit()))
    }

    /// `amount` of this unit as a signed chrono duration (for timestamp math).
    pub fn chrono(&self, amount: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(amount.saturating_mul(self.millis_per_unit() as i64))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Milliseconds => "MILLISECONDS",
            TimeUnit::Seconds => "SECONDS",
            TimeUnit::Minutes => "MINUTES",
            TimeUnit::Hours => "HOURS",
        }
    }
}

impl Default for TimeUnit {
    fn default() -> Self {
        Self::Seconds
    }
}

impl core::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MILLISECONDS" | "MS" => Ok(TimeUnit::Milliseconds),
            "SECONDS" | "S" => Ok(TimeUnit::Seconds),
            "MINUTES" | "M" => Ok(TimeUnit::Minutes),
            "HOURS" | "H" => Ok(TimeUnit::Hours),
            other => Err(DomainError::configuration(format!("unknown time unit '{other}'"))),
        }
    }
}

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C> Clock for Arc<C>
where
    C: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall clock.
#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_and_short_names() {
        assert_eq!("SECONDS".parse::<TimeUnit>().unwrap(), TimeUnit::Seconds);
        assert_eq!("milliseconds".parse::<TimeUnit>().unwrap(), TimeUnit::Milliseconds);
        assert_eq!(" ms ".parse::<TimeUnit>().unwrap(), TimeUnit::Milliseconds);
        assert_eq!("MINUTES".parse::<TimeUnit>().unwrap(), TimeUnit::Minutes);
        assert!(matches!(
            "fortnights".parse::<TimeUnit>(),
            Err(DomainError::Configuration(_))
        ));
    }

    #[test]
    fn converts_amounts() {
        assert_eq!(TimeUnit::Seconds.duration(3), std::time::Duration::from_secs(3));
        assert_eq!(TimeUnit::Milliseconds.duration(250), std::time::Duration::from_millis(250));
        assert_eq!(TimeUnit::Minutes.chrono(2), chrono::Duration::seconds(120));
        assert_eq!(TimeUnit::Seconds.chrono(-1), chrono::Duration::seconds(-1));
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::starting_now();
        let other = clock.clone();
        let start = clock.now();

        other.advance(chrono::Duration::hours(1));
        assert_eq!(clock.now(), start + chrono::Duration::hours(1));
    }
}
