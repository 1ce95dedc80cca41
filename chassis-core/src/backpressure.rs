//! Backpressure: write-buffer water marks
//!
//! Byte-based flow control for outbound buffers.
//!
//! Design principle:
//! - Backpressure scales with **bytes**, not message count
//! - A channel turns unwritable when pending bytes rise above the high mark
//! - It turns writable again only once pending bytes drop below the low mark
//!
//! The hysteresis between the two marks keeps a busy channel from flapping
//! between states on every write.

use crate::error::{ChannelError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Low/high thresholds for channel writability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBufferWaterMark {
    low: usize,
    high: usize,
}

impl WriteBufferWaterMark {
    /// Default low water mark (32 KiB)
    pub const DEFAULT_LOW: usize = 32 * 1024;
    /// Default high water mark (64 KiB)
    pub const DEFAULT_HIGH: usize = 64 * 1024;

    /// Create a water mark. `high` must not be lower than `low`.
    pub fn new(low: usize, high: usize) -> Result<Self> {
        if high < low {
            return Err(ChannelError::invalid_argument(format!(
                "write buffer high water mark ({high}) must be >= low water mark ({low})"
            )));
        }
        Ok(Self { low, high })
    }

    pub const fn low(&self) -> usize {
        self.low
    }

    pub const fn high(&self) -> usize {
        self.high
    }
}

impl Default for WriteBufferWaterMark {
    fn default() -> Self {
        Self {
            low: Self::DEFAULT_LOW,
            high: Self::DEFAULT_HIGH,
        }
    }
}

impl fmt::Display for WriteBufferWaterMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteBufferWaterMark(low: {}, high: {})", self.low, self.high)
    }
}

/// Threshold crossing produced by a pending-bytes update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    /// Writability did not change
    None,
    /// Pending bytes rose above the high mark
    BecameUnwritable,
    /// Pending bytes fell below the low mark
    BecameWritable,
}

/// Pending-byte counter with water-mark hysteresis.
///
/// Increments may come from any thread (write tasks charge the counter before
/// the hop to the owning loop), so the counter and the writability bit are
/// both atomics. Exactly one caller observes each crossing.
#[derive(Debug, Default)]
pub struct PendingBytes {
    total: AtomicI64,
    unwritable: AtomicBool,
}

impl PendingBytes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently pending bytes.
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        !self.unwritable.load(Ordering::Acquire)
    }

    /// Add `size` bytes; reports a crossing above `mark.high()`.
    pub fn increment(&self, size: i64, mark: WriteBufferWaterMark) -> Crossing {
        if size == 0 {
            return Crossing::None;
        }
        let new_total = self.total.fetch_add(size, Ordering::AcqRel) + size;
        if new_total > mark.high() as i64 && !self.unwritable.swap(true, Ordering::AcqRel) {
            return Crossing::BecameUnwritable;
        }
        Crossing::None
    }

    /// Remove `size` bytes; reports a crossing below `mark.low()`.
    pub fn decrement(&self, size: i64, mark: WriteBufferWaterMark) -> Crossing {
        if size == 0 {
            return Crossing::None;
        }
        let new_total = self.total.fetch_sub(size, Ordering::AcqRel) - size;
        if new_total < mark.low() as i64 && self.unwritable.swap(false, Ordering::AcqRel) {
            return Crossing::BecameWritable;
        }
        Crossing::None
    }

    /// Remove `size` bytes without touching the writability bit.
    pub fn release_silently(&self, size: i64) {
        self.total.fetch_sub(size, Ordering::AcqRel);
    }

    /// Bytes that can still be added before the channel turns unwritable.
    pub fn bytes_before_unwritable(&self, mark: WriteBufferWaterMark) -> u64 {
        if !self.is_writable() {
            return 0;
        }
        let remaining = mark.high() as i64 - self.total();
        remaining.max(0) as u64
    }

    /// Bytes that must drain before the channel turns writable again.
    pub fn bytes_before_writable(&self, mark: WriteBufferWaterMark) -> u64 {
        if self.is_writable() {
            return 0;
        }
        let excess = self.total() - mark.low() as i64;
        excess.max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_mark_validation() {
        assert!(WriteBufferWaterMark::new(10, 5).is_err());
        let mark = WriteBufferWaterMark::new(5, 10).unwrap();
        assert_eq!((mark.low(), mark.high()), (5, 10));
        assert_eq!(WriteBufferWaterMark::default().high(), 64 * 1024);
    }

    #[test]
    fn test_hysteresis() {
        let mark = WriteBufferWaterMark::new(10, 20).unwrap();
        let pending = PendingBytes::new();

        assert_eq!(pending.increment(20, mark), Crossing::None);
        assert_eq!(pending.bytes_before_unwritable(mark), 0);
        assert_eq!(pending.increment(1, mark), Crossing::BecameUnwritable);
        assert!(!pending.is_writable());
        assert_eq!(pending.increment(5, mark), Crossing::None);
        assert_eq!(pending.bytes_before_writable(mark), 16);

        // Still above the low mark
        assert_eq!(pending.decrement(10, mark), Crossing::None);
        assert!(!pending.is_writable());
        assert_eq!(pending.decrement(8, mark), Crossing::BecameWritable);
        assert!(pending.is_writable());
        assert_eq!(pending.total(), 8);
        assert_eq!(pending.bytes_before_unwritable(mark), 12);
    }
}
