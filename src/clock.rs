//! Wall-clock measurement for TTL, cooldown and timeout windows.
//!
//! Not used for ordering decisions; entity ordering comes from server-side
//! timestamps carried on the wire.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
///
/// Copy is fine here - it's just a measurement, not causality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClock(pub u64);

impl WallClock {
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(ms)
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Elapsed milliseconds since `earlier`, zero if `earlier` is in the future.
    pub fn millis_since(self, earlier: WallClock) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_since_saturates() {
        let early = WallClock(1_000);
        let late = WallClock(4_500);
        assert_eq!(late.millis_since(early), 3_500);
        assert_eq!(early.millis_since(late), 0);
    }

    #[test]
    fn add_saturates() {
        assert_eq!(WallClock(10).saturating_add_ms(5), WallClock(15));
        assert_eq!(
            WallClock(u64::MAX).saturating_add_ms(1),
            WallClock(u64::MAX)
        );
    }
}
