//! Windows FILETIME, as embedded in the XISO volume header.

use crate::types::number::U32Le;

/// Seconds between 1601-01-01 and the Unix epoch.
const EPOCH_DELTA_SECS: i64 = 11_644_473_600;

/// 100-nanosecond ticks per second.
const TICKS_PER_SEC: i64 = 10_000_000;

/// A Windows FILETIME split into its on-disc low/high halves, both
/// little-endian.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FileTime {
    pub low: U32Le,
    pub high: U32Le,
}

impl FileTime {
    /// The current system time.
    pub fn now() -> Self {
        let secs = chrono::Utc::now().timestamp();
        if secs < 0 {
            return Self::default();
        }
        Self::from_ticks(((secs + EPOCH_DELTA_SECS) * TICKS_PER_SEC) as u64)
    }

    pub fn from_ticks(ticks: u64) -> Self {
        Self {
            low: U32Le::new(ticks as u32),
            high: U32Le::new((ticks >> 32) as u32),
        }
    }

    pub fn ticks(&self) -> u64 {
        ((self.high.get() as u64) << 32) | self.low.get() as u64
    }
}

impl Default for FileTime {
    /// A fixed mid-2005 timestamp, used when the system clock is unusable.
    fn default() -> Self {
        Self {
            low: U32Le::new(0xd7d3_e000),
            high: U32Le::new(0x01c5_5c11),
        }
    }
}

impl core::fmt::Debug for FileTime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("FileTime").field(&self.ticks()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ticks() {
        let ft = FileTime::from_ticks(0x01C5_5C11_D7D3_E000);
        assert_eq!(ft.low.get(), 0xD7D3_E000);
        assert_eq!(ft.high.get(), 0x01C5_5C11);
        assert_eq!(ft.ticks(), 0x01C5_5C11_D7D3_E000);
    }

    #[test]
    fn default_matches_fallback() {
        assert_eq!(FileTime::default().ticks(), 0x01C5_5C11_D7D3_E000);
    }

    #[test]
    fn now_is_after_2020() {
        // 2020-01-01 in FILETIME ticks.
        let floor = (1_577_836_800i64 + EPOCH_DELTA_SECS) * TICKS_PER_SEC;
        assert!(FileTime::now().ticks() > floor as u64);
    }
}
