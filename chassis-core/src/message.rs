//! Pipeline messages and size estimation.
//!
//! The engine moves messages through handlers without knowing their type, so
//! a message is a boxed `Any`. Handlers downcast to the representation they
//! understand and forward everything else untouched.
//!
//! Size estimation only feeds backpressure accounting. It never affects
//! correctness, so an estimate may be rough.

use bytes::{Bytes, BytesMut};
use std::any::Any;
use std::fmt;

/// A message travelling through a pipeline.
pub type Message = Box<dyn Any + Send>;

/// Box a value into a pipeline message.
///
/// # Examples
///
/// ```
/// use chassis_core::message::{message, Message};
/// use bytes::Bytes;
///
/// let msg: Message = message(Bytes::from_static(b"ping"));
/// assert!(msg.downcast_ref::<Bytes>().is_some());
/// ```
pub fn message<T: Any + Send>(value: T) -> Message {
    Box::new(value)
}

/// Estimates how many bytes a message will occupy in the outbound buffer.
pub trait MessageSizeEstimator: Send + Sync {
    /// Size estimate. Negative values are clamped to zero by the caller.
    fn size(&self, msg: &(dyn Any + Send)) -> isize;
}

/// Default estimator: exact for the byte containers the engine knows about,
/// a fixed guess for everything else.
#[derive(Clone, Copy)]
pub struct DefaultMessageSizeEstimator {
    unknown_size: isize,
}

impl DefaultMessageSizeEstimator {
    /// Estimate used for types the estimator cannot measure.
    pub const DEFAULT_UNKNOWN_SIZE: isize = 8;

    /// Create an estimator with a custom size for unknown types.
    pub const fn new(unknown_size: isize) -> Self {
        Self { unknown_size }
    }
}

impl Default for DefaultMessageSizeEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_UNKNOWN_SIZE)
    }
}

impl fmt::Debug for DefaultMessageSizeEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultMessageSizeEstimator")
            .field("unknown_size", &self.unknown_size)
            .finish()
    }
}

impl MessageSizeEstimator for DefaultMessageSizeEstimator {
    fn size(&self, msg: &(dyn Any + Send)) -> isize {
        let len = if let Some(b) = msg.downcast_ref::<Bytes>() {
            b.len()
        } else if let Some(b) = msg.downcast_ref::<BytesMut>() {
            b.len()
        } else if let Some(v) = msg.downcast_ref::<Vec<u8>>() {
            v.len()
        } else if let Some(s) = msg.downcast_ref::<String>() {
            s.len()
        } else if let Some(s) = msg.downcast_ref::<&'static str>() {
            s.len()
        } else if let Some(frames) = msg.downcast_ref::<Vec<Bytes>>() {
            frames.iter().map(Bytes::len).sum()
        } else {
            return self.unknown_size;
        };
        isize::try_from(len).unwrap_or(isize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_containers_are_measured() {
        let est = DefaultMessageSizeEstimator::default();
        assert_eq!(est.size(message(Bytes::from_static(b"hello")).as_ref()), 5);
        assert_eq!(est.size(message(BytesMut::from(&b"abc"[..])).as_ref()), 3);
        assert_eq!(est.size(message(vec![0u8; 16]).as_ref()), 16);
        assert_eq!(est.size(message(String::from("four")).as_ref()), 4);
        assert_eq!(
            est.size(message(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")]).as_ref()),
            5
        );
    }

    #[test]
    fn test_unknown_types_use_fixed_guess() {
        struct Opaque;
        let est = DefaultMessageSizeEstimator::default();
        assert_eq!(est.size(message(Opaque).as_ref()), 8);
        assert_eq!(DefaultMessageSizeEstimator::new(0).size(message(42u32).as_ref()), 0);
    }
}
