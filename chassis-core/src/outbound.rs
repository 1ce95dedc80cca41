//! Per-channel outbound message queue.
//!
//! Messages enter the *unflushed* region on write, move to the *flushed*
//! region on flush, and leave it when the transport has written them (or when
//! they are failed). Every entry's estimated size is charged to a pending-byte
//! counter that drives channel writability through the configured water
//! marks.
//!
//! The regions are only mutated by the channel's loop; the counter may also
//! be charged from other threads by write tasks in flight.

use crate::backpressure::{Crossing, PendingBytes};
use crate::error::ChannelError;
use crate::message::Message;
use crate::options::ChannelConfig;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Called with `invoke_later` when writability flips.
pub type WritabilityListener = Box<dyn Fn(bool) + Send + Sync>;

/// One queued write.
pub struct OutboundEntry {
    pub message: Message,
    pub size: usize,
    pub promise: Promise,
}

impl fmt::Debug for OutboundEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundEntry")
            .field("size", &self.size)
            .field("promise", &self.promise)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Regions {
    unflushed: VecDeque<OutboundEntry>,
    flushed: VecDeque<OutboundEntry>,
}

pub struct OutboundBuffer {
    regions: Mutex<Regions>,
    pending: PendingBytes,
    config: Arc<ChannelConfig>,
    on_writability_changed: WritabilityListener,
}

impl OutboundBuffer {
    pub fn new(config: Arc<ChannelConfig>, on_writability_changed: WritabilityListener) -> Self {
        Self {
            regions: Mutex::new(Regions::default()),
            pending: PendingBytes::new(),
            config,
            on_writability_changed,
        }
    }

    /// Queue `message` in the unflushed region.
    pub fn add_message(&self, message: Message, size: usize, promise: Promise) {
        self.regions.lock().unflushed.push_back(OutboundEntry {
            message,
            size,
            promise,
        });
        self.charge(size, false);
    }

    /// Commit everything written so far for delivery.
    ///
    /// Entries whose promise was cancelled in the meantime are dropped here
    /// and their bytes released; the rest become uncancellable.
    pub fn add_flush(&self) {
        let committed: Vec<OutboundEntry> = self.regions.lock().unflushed.drain(..).collect();
        if committed.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(committed.len());
        for entry in committed {
            if entry.promise.set_uncancellable() {
                kept.push(entry);
            } else {
                self.release(entry.size, false, true);
            }
        }
        self.regions.lock().flushed.extend(kept);
    }

    /// Take the oldest flushed entry. Its bytes are released; completing its
    /// promise is up to the caller.
    pub fn pop_flushed(&self) -> Option<OutboundEntry> {
        let entry = self.regions.lock().flushed.pop_front()?;
        self.release(entry.size, false, true);
        Some(entry)
    }

    /// Put a partially written entry back at the head of the flushed region.
    pub fn requeue_flushed(&self, entry: OutboundEntry) {
        let size = entry.size;
        self.regions.lock().flushed.push_front(entry);
        self.charge(size, false);
    }

    /// Pop the oldest flushed entry and mark it written. False if empty.
    pub fn remove(&self) -> bool {
        match self.pop_flushed() {
            Some(entry) => {
                safe_success(&entry.promise);
                true
            }
            None => false,
        }
    }

    /// Fail every flushed entry with `cause`.
    ///
    /// With `notify` unset the bytes are released without a writability
    /// notification.
    pub fn fail_flushed(&self, cause: &ChannelError, notify: bool) {
        let failed: Vec<OutboundEntry> = self.regions.lock().flushed.drain(..).collect();
        for entry in failed {
            self.release(entry.size, false, notify);
            safe_fail(&entry.promise, cause);
        }
    }

    /// Fail everything still queued. Never notifies writability.
    pub fn close(&self, cause: &ChannelError) {
        let failed: Vec<OutboundEntry> = {
            let mut regions = self.regions.lock();
            let mut all: Vec<_> = regions.flushed.drain(..).collect();
            all.extend(regions.unflushed.drain(..));
            all
        };
        for entry in failed {
            self.release(entry.size, false, false);
            safe_fail(&entry.promise, cause);
        }
    }

    /// True when nothing is waiting to be written.
    pub fn is_empty(&self) -> bool {
        self.regions.lock().flushed.is_empty()
    }

    /// Number of flushed entries.
    pub fn size(&self) -> usize {
        self.regions.lock().flushed.len()
    }

    pub fn total_pending_bytes(&self) -> i64 {
        self.pending.total()
    }

    pub fn is_writable(&self) -> bool {
        self.pending.is_writable()
    }

    pub fn bytes_before_unwritable(&self) -> u64 {
        self.pending
            .bytes_before_unwritable(self.config.write_buffer_water_mark())
    }

    pub fn bytes_before_writable(&self) -> u64 {
        self.pending
            .bytes_before_writable(self.config.write_buffer_water_mark())
    }

    /// Charge bytes for a write that has not reached the buffer yet.
    pub fn increment_pending_outbound_bytes(&self, size: usize) {
        self.charge(size, true);
    }

    /// Release bytes charged with `increment_pending_outbound_bytes`.
    pub fn decrement_pending_outbound_bytes(&self, size: usize) {
        self.release(size, true, true);
    }

    fn charge(&self, size: usize, invoke_later: bool) {
        let mark = self.config.write_buffer_water_mark();
        if self.pending.increment(to_i64(size), mark) == Crossing::BecameUnwritable {
            (self.on_writability_changed)(invoke_later);
        }
    }

    fn release(&self, size: usize, invoke_later: bool, notify: bool) {
        if !notify {
            self.pending.release_silently(to_i64(size));
            return;
        }
        let mark = self.config.write_buffer_water_mark();
        if self.pending.decrement(to_i64(size), mark) == Crossing::BecameWritable {
            (self.on_writability_changed)(invoke_later);
        }
    }
}

impl fmt::Debug for OutboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regions = self.regions.lock();
        f.debug_struct("OutboundBuffer")
            .field("unflushed", &regions.unflushed.len())
            .field("flushed", &regions.flushed.len())
            .field("pending_bytes", &self.pending.total())
            .field("writable", &self.pending.is_writable())
            .finish()
    }
}

fn to_i64(size: usize) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn safe_success(promise: &Promise) {
    if !promise.is_void() && !promise.try_success() {
        warn!(
            "[Outbound] Failed to mark a promise as success because it is done already: {:?}",
            promise
        );
    }
}

fn safe_fail(promise: &Promise, cause: &ChannelError) {
    if promise.is_void() {
        // Runs the void promise's failure hook, if any.
        promise.try_failure(cause.clone());
    } else if !promise.try_failure(cause.clone()) {
        warn!(
            "[Outbound] Failed to mark a promise as failure because it is done already: {:?}",
            promise
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::WriteBufferWaterMark;
    use crate::ids::ChannelId;
    use crate::message::message;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn buffer(low: usize, high: usize) -> (OutboundBuffer, Arc<AtomicUsize>) {
        let config = Arc::new(
            ChannelConfig::default()
                .with_write_buffer_water_mark(WriteBufferWaterMark::new(low, high).unwrap()),
        );
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        let buf = OutboundBuffer::new(
            config,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (buf, changes)
    }

    fn promise() -> Promise {
        Promise::new(ChannelId::next(), None)
    }

    fn payload(n: usize) -> Message {
        message(Bytes::from(vec![0u8; n]))
    }

    #[test]
    fn test_flush_moves_entries_in_order() {
        let (buf, _) = buffer(10, 100);
        let promises: Vec<_> = (0..3).map(|_| promise()).collect();
        for (i, p) in promises.iter().enumerate() {
            buf.add_message(payload(i + 1), i + 1, p.clone());
        }
        assert!(buf.is_empty());
        buf.add_flush();
        assert_eq!(buf.size(), 3);
        assert_eq!(buf.total_pending_bytes(), 6);

        let first = buf.pop_flushed().unwrap();
        assert_eq!(first.size, 1);
        assert!(buf.remove());
        assert!(promises[1].is_success());
        assert_eq!(buf.total_pending_bytes(), 3);
    }

    #[test]
    fn test_cancelled_entries_are_dropped_at_flush() {
        let (buf, _) = buffer(10, 100);
        let keep = promise();
        let drop_me = promise();
        buf.add_message(payload(4), 4, drop_me.clone());
        buf.add_message(payload(5), 5, keep.clone());
        assert!(drop_me.cancel());

        buf.add_flush();
        assert_eq!(buf.size(), 1);
        assert_eq!(buf.total_pending_bytes(), 5);
        assert!(!keep.is_cancellable());
    }

    #[test]
    fn test_writability_crossings() {
        let (buf, changes) = buffer(4, 8);
        buf.add_message(payload(6), 6, promise());
        assert!(buf.is_writable());
        assert_eq!(buf.bytes_before_unwritable(), 2);

        buf.add_message(payload(6), 6, promise());
        assert!(!buf.is_writable());
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(buf.bytes_before_writable(), 8);

        buf.add_flush();
        assert!(buf.remove());
        assert!(!buf.is_writable());
        assert!(buf.remove());
        assert!(buf.is_writable());
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fail_flushed_notify_flag() {
        let (buf, changes) = buffer(4, 8);
        let p = promise();
        buf.add_message(payload(10), 10, p.clone());
        buf.add_flush();
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        buf.fail_flushed(&ChannelError::NotYetConnected, true);
        assert!(matches!(p.cause(), Some(ChannelError::NotYetConnected)));
        assert!(buf.is_writable());
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_fails_unflushed_without_notification() {
        let (buf, changes) = buffer(1, 2);
        let promises: Vec<_> = (0..3).map(|_| promise()).collect();
        for p in &promises {
            buf.add_message(payload(1), 1, p.clone());
        }
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        buf.close(&ChannelError::Closed);
        for p in &promises {
            assert!(matches!(p.cause(), Some(ChannelError::Closed)));
        }
        assert_eq!(buf.total_pending_bytes(), 0);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_void_entries_report_failures_to_hook() {
        let (buf, _) = buffer(10, 100);
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let void = Promise::void(
            ChannelId::next(),
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        buf.add_message(payload(3), 3, void.clone());
        buf.add_message(payload(3), 3, void);
        buf.add_flush();

        buf.fail_flushed(&ChannelError::Closed, false);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_external_charges() {
        let (buf, changes) = buffer(2, 4);
        buf.increment_pending_outbound_bytes(5);
        assert!(!buf.is_writable());
        buf.decrement_pending_outbound_bytes(5);
        assert!(buf.is_writable());
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }
}
