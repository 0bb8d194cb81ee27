//! Link impairments applied to every simulated robot command.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProfileError {
    #[error("{name} must be between 0 and 100, got {value}")]
    ChanceOutOfRange { name: &'static str, value: u8 },
}

/// Latency and failure injection for one robot link.
///
/// Each command waits `latency_ms` plus up to `jitter_ms` of uniform jitter,
/// then is lost with `drop_chance_percent` (reported as unreachable) or
/// refused with `reject_chance_percent`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkProfile {
    pub latency_ms: u64,
    pub jitter_ms: u64,
    pub drop_chance_percent: u8,
    pub reject_chance_percent: u8,
}

/// What the link did to one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Delivered,
    Dropped,
    Rejected,
}

impl LinkProfile {
    /// A perfect link.
    pub fn ideal() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        for (name, value) in [
            ("drop_chance_percent", self.drop_chance_percent),
            ("reject_chance_percent", self.reject_chance_percent),
        ] {
            if value > 100 {
                return Err(ProfileError::ChanceOutOfRange { name, value });
            }
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::random::<u64>() % (self.jitter_ms + 1)
        } else {
            0
        };
        Duration::from_millis(self.latency_ms + jitter)
    }

    pub fn roll(&self) -> LinkOutcome {
        if roll_percent(self.drop_chance_percent) {
            LinkOutcome::Dropped
        } else if roll_percent(self.reject_chance_percent) {
            LinkOutcome::Rejected
        } else {
            LinkOutcome::Delivered
        }
    }

    /// Waits out the link delay, then rolls the outcome.
    pub async fn transmit(&self) -> LinkOutcome {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.roll()
    }
}

fn roll_percent(chance: u8) -> bool {
    chance > 0 && rand::random::<u8>() % 100 < chance
}
