use std::{
    fmt,
    time::Duration,
};

use number_prefix::NumberPrefix;

/// A size in bytes, displayed with base 2 units.
#[derive(Debug)]
pub struct BinarySize(pub u64);

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(n) => write!(f, "{n:.0}B"),
            NumberPrefix::Prefixed(prefix, n) => write!(f, "{n:.2}{prefix}B"),
        }
    }
}

/// A duration displayed as `HH:MM:SS`. Sub-second precision is dropped and
/// hours are not wrapped into days.
#[derive(Debug)]
pub struct ClockDuration(pub Duration);

impl fmt::Display for ClockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();

        write!(f, "{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_size() {
        assert_eq!(BinarySize(0).to_string(), "0B");
        assert_eq!(BinarySize(1023).to_string(), "1023B");
        assert_eq!(BinarySize(1024).to_string(), "1.00KiB");
        assert_eq!(BinarySize(1536).to_string(), "1.50KiB");
        assert_eq!(BinarySize(32 * 1024 * 1024).to_string(), "32.00MiB");
        assert_eq!(BinarySize(2_418_139_136).to_string(), "2.25GiB");
    }

    #[test]
    fn test_clock_duration() {
        let cases = [
            (0, "00:00:00"),
            (59, "00:00:59"),
            (61, "00:01:01"),
            (3661, "01:01:01"),
            (360_000, "100:00:00"),
        ];

        for (secs, expected) in cases {
            assert_eq!(ClockDuration(Duration::from_secs(secs)).to_string(), expected);
        }
        assert_eq!(ClockDuration(Duration::new(1, 999_999_999)).to_string(), "00:00:01");
    }
}
