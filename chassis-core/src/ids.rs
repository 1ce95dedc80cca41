//! Channel identity.
//!
//! A `ChannelId` is unique within the process: a monotonically increasing
//! sequence number makes ids totally ordered, and a random per-process nonce
//! keeps long-form ids distinguishable across processes in shared logs.

use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

static PROCESS_NONCE: Lazy<u32> = Lazy::new(rand::random);

/// Globally unique channel id.
#[derive(Clone, Copy)]
pub struct ChannelId {
    sequence: u64,
    nonce: u32,
    random: u32,
}

impl ChannelId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self {
            sequence: NEXT_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
            nonce: *PROCESS_NONCE,
            random: rand::random(),
        }
    }

    /// Sequence number, strictly increasing in allocation order.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Short, not necessarily unique, form used in log lines.
    pub fn as_short_text(&self) -> String {
        format!("{:08x}", self.random)
    }

    /// Full unique form.
    pub fn as_long_text(&self) -> String {
        format!("{:08x}-{:016x}-{:08x}", self.nonce, self.sequence, self.random)
    }
}

impl PartialEq for ChannelId {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence && self.nonce == other.nonce
    }
}

impl Eq for ChannelId {}

impl Hash for ChannelId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sequence.hash(state);
        self.nonce.hash(state);
    }
}

impl PartialOrd for ChannelId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.nonce.cmp(&other.nonce))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.as_long_text())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_short_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert!(a < b);

        let set: HashSet<_> = [a, b, a].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_text_forms() {
        let id = ChannelId::next();
        assert_eq!(id.as_short_text().len(), 8);
        assert!(id.as_long_text().contains(&id.as_short_text()));
    }
}
