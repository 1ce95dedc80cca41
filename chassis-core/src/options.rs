//! Channel configuration options
//!
//! Every channel owns a `ChannelConfig`. It is shared between the owning loop
//! and whatever thread holds the channel, so each field is individually
//! readable and writable without exclusive access.

use crate::backpressure::WriteBufferWaterMark;
use crate::error::{ChannelError, Result};
use crate::message::{DefaultMessageSizeEstimator, MessageSizeEstimator};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime configuration of one channel.
///
/// # Examples
///
/// ```
/// use chassis_core::options::ChannelConfig;
/// use std::time::Duration;
///
/// let config = ChannelConfig::default()
///     .with_auto_read(false)
///     .with_connect_timeout(Duration::from_secs(5));
/// assert!(!config.auto_read());
/// ```
pub struct ChannelConfig {
    /// Request more data automatically after every read completes.
    auto_read: AtomicBool,

    /// Close the channel when a flush hits an I/O failure.
    auto_close: AtomicBool,

    /// Writability thresholds for the outbound buffer.
    water_mark: RwLock<WriteBufferWaterMark>,

    /// Timeout a transport applies to an outstanding connect.
    connect_timeout: RwLock<Duration>,

    /// Estimator used for outbound byte accounting.
    estimator: RwLock<Arc<dyn MessageSizeEstimator>>,

    /// Transports that broadcast (datagram) flag it here.
    broadcast: AtomicBool,
}

impl ChannelConfig {
    pub fn auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }

    /// Change auto-read, returning the previous value.
    ///
    /// The caller is responsible for issuing a `read()` if reading should
    /// resume immediately.
    pub fn set_auto_read(&self, auto_read: bool) -> bool {
        self.auto_read.swap(auto_read, Ordering::AcqRel)
    }

    pub fn auto_close(&self) -> bool {
        self.auto_close.load(Ordering::Acquire)
    }

    pub fn set_auto_close(&self, auto_close: bool) {
        self.auto_close.store(auto_close, Ordering::Release);
    }

    pub fn write_buffer_water_mark(&self) -> WriteBufferWaterMark {
        *self.water_mark.read()
    }

    pub fn set_write_buffer_water_mark(&self, mark: WriteBufferWaterMark) {
        *self.water_mark.write() = mark;
    }

    pub fn connect_timeout(&self) -> Duration {
        *self.connect_timeout.read()
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        *self.connect_timeout.write() = timeout;
    }

    pub fn message_size_estimator(&self) -> Arc<dyn MessageSizeEstimator> {
        self.estimator.read().clone()
    }

    pub fn set_message_size_estimator(&self, estimator: Arc<dyn MessageSizeEstimator>) {
        *self.estimator.write() = estimator;
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn with_auto_read(self, auto_read: bool) -> Self {
        self.set_auto_read(auto_read);
        self
    }

    #[must_use]
    pub fn with_auto_close(self, auto_close: bool) -> Self {
        self.set_auto_close(auto_close);
        self
    }

    #[must_use]
    pub fn with_write_buffer_water_mark(self, mark: WriteBufferWaterMark) -> Self {
        self.set_write_buffer_water_mark(mark);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        self.set_connect_timeout(timeout);
        self
    }

    #[must_use]
    pub fn with_message_size_estimator(self, estimator: Arc<dyn MessageSizeEstimator>) -> Self {
        self.set_message_size_estimator(estimator);
        self
    }

    /// Apply a typed option.
    ///
    /// Returns `Ok(false)` when this config does not know the option, and an
    /// error when the value has the wrong type.
    pub fn set_option(&self, option: ChannelOption, value: OptionValue) -> Result<bool> {
        match (option, value) {
            (ChannelOption::AutoRead, OptionValue::Bool(v)) => {
                self.set_auto_read(v);
            }
            (ChannelOption::AutoClose, OptionValue::Bool(v)) => self.set_auto_close(v),
            (ChannelOption::Broadcast, OptionValue::Bool(v)) => {
                self.broadcast.store(v, Ordering::Release);
            }
            (ChannelOption::ConnectTimeout, OptionValue::Duration(d)) => {
                self.set_connect_timeout(d);
            }
            (ChannelOption::WriteBufferWaterMark, OptionValue::WaterMark(m)) => {
                self.set_write_buffer_water_mark(m);
            }
            (ChannelOption::WriteBufferHighWaterMark, OptionValue::Usize(high)) => {
                let low = self.write_buffer_water_mark().low();
                self.set_write_buffer_water_mark(WriteBufferWaterMark::new(low, high)?);
            }
            (ChannelOption::WriteBufferLowWaterMark, OptionValue::Usize(low)) => {
                let high = self.write_buffer_water_mark().high();
                self.set_write_buffer_water_mark(WriteBufferWaterMark::new(low, high)?);
            }
            (ChannelOption::Custom(_), _) => return Ok(false),
            (option, value) => {
                return Err(ChannelError::invalid_argument(format!(
                    "value {value:?} does not fit option {option}"
                )));
            }
        }
        Ok(true)
    }

    /// Read a typed option, `None` if this config does not know it.
    pub fn option(&self, option: ChannelOption) -> Option<OptionValue> {
        let value = match option {
            ChannelOption::AutoRead => OptionValue::Bool(self.auto_read()),
            ChannelOption::AutoClose => OptionValue::Bool(self.auto_close()),
            ChannelOption::Broadcast => OptionValue::Bool(self.broadcast()),
            ChannelOption::ConnectTimeout => OptionValue::Duration(self.connect_timeout()),
            ChannelOption::WriteBufferWaterMark => {
                OptionValue::WaterMark(self.write_buffer_water_mark())
            }
            ChannelOption::WriteBufferHighWaterMark => {
                OptionValue::Usize(self.write_buffer_water_mark().high())
            }
            ChannelOption::WriteBufferLowWaterMark => {
                OptionValue::Usize(self.write_buffer_water_mark().low())
            }
            ChannelOption::Custom(_) => return None,
        };
        Some(value)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            auto_read: AtomicBool::new(true),
            auto_close: AtomicBool::new(true),
            water_mark: RwLock::new(WriteBufferWaterMark::default()),
            connect_timeout: RwLock::new(DEFAULT_CONNECT_TIMEOUT),
            estimator: RwLock::new(Arc::new(DefaultMessageSizeEstimator::default())),
            broadcast: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("auto_read", &self.auto_read())
            .field("auto_close", &self.auto_close())
            .field("water_mark", &self.write_buffer_water_mark())
            .field("connect_timeout", &self.connect_timeout())
            .finish_non_exhaustive()
    }
}

/// Typed option keys accepted by bootstraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOption {
    AutoRead,
    AutoClose,
    Broadcast,
    ConnectTimeout,
    WriteBufferWaterMark,
    WriteBufferHighWaterMark,
    WriteBufferLowWaterMark,
    /// Transport-specific option, identified by name.
    Custom(&'static str),
}

impl fmt::Display for ChannelOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoRead => f.write_str("AUTO_READ"),
            Self::AutoClose => f.write_str("AUTO_CLOSE"),
            Self::Broadcast => f.write_str("SO_BROADCAST"),
            Self::ConnectTimeout => f.write_str("CONNECT_TIMEOUT"),
            Self::WriteBufferWaterMark => f.write_str("WRITE_BUFFER_WATER_MARK"),
            Self::WriteBufferHighWaterMark => f.write_str("WRITE_BUFFER_HIGH_WATER_MARK"),
            Self::WriteBufferLowWaterMark => f.write_str("WRITE_BUFFER_LOW_WATER_MARK"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// Value stored against a `ChannelOption`.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Usize(usize),
    Duration(Duration),
    WaterMark(WriteBufferWaterMark),
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert!(config.auto_read());
        assert!(config.auto_close());
        assert_eq!(config.write_buffer_water_mark(), WriteBufferWaterMark::default());
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_set_option() {
        let config = ChannelConfig::default();
        assert!(config
            .set_option(ChannelOption::AutoRead, OptionValue::Bool(false))
            .unwrap());
        assert!(!config.auto_read());

        assert!(config
            .set_option(ChannelOption::WriteBufferHighWaterMark, OptionValue::Usize(100_000))
            .unwrap());
        assert_eq!(config.write_buffer_water_mark().high(), 100_000);

        // High below low is rejected and leaves the mark untouched
        assert!(config
            .set_option(ChannelOption::WriteBufferHighWaterMark, OptionValue::Usize(1))
            .is_err());
        assert_eq!(config.write_buffer_water_mark().high(), 100_000);

        assert!(!config
            .set_option(ChannelOption::Custom("SO_LINGER"), OptionValue::Usize(1))
            .unwrap());
        assert!(config
            .set_option(ChannelOption::AutoRead, OptionValue::Usize(1))
            .is_err());
    }

    #[test]
    fn test_option_roundtrip() {
        let config = ChannelConfig::default().with_auto_close(false);
        assert_eq!(
            config.option(ChannelOption::AutoClose),
            Some(OptionValue::Bool(false))
        );
        assert_eq!(config.option(ChannelOption::Custom("x")), None);
    }
}
