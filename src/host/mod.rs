//! Platform audio host abstraction.
//!
//! The engine never talks to an audio API directly. Everything it needs from
//! the platform (device enumeration, microphone capture, output streams and
//! capability probing) goes through [`AudioHost`]:
//!
//! - [`CpalHost`] drives real hardware (feature `cpal_sink`)
//! - [`VirtualHost`] is an in-memory host with scriptable devices, used for
//!   tests and offline rendering
//!
//! Streams are exchanged as ring buffers: a capture hands the engine a
//! [`Consumer`] of interleaved input samples, an output hands it a
//! [`Producer`] the device callback drains. The platform stream itself stays
//! behind a [`StreamHandle`] and stops when the handle is dropped.

#[cfg(feature = "cpal_sink")]
mod cpal_host;
mod virtual_host;

#[cfg(feature = "cpal_sink")]
pub use cpal_host::CpalHost;
pub use virtual_host::{OutputKind, PermissionOutcome, VirtualHost};

use core::time::Duration;

use rtrb::{Consumer, Producer};

use crate::device::{AudioDevice, DeviceId};
use crate::error::Result;

/// What a microphone capture is requested with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// How long the request may stay unanswered before it counts as denied.
    pub permission_timeout: Duration,
}

impl CaptureConstraints {
    /// Unprocessed signal: every voice-processing stage off.
    pub const fn raw() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            permission_timeout: Duration::from_secs(10),
        }
    }

    pub const fn with_permission_timeout(mut self, timeout: Duration) -> Self {
        self.permission_timeout = timeout;
        self
    }
}

/// Whether a sink-selection mechanism can reach a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkCapability {
    Supported,
    Unsupported,
}

impl SinkCapability {
    #[inline]
    pub fn is_supported(self) -> bool {
        self == SinkCapability::Supported
    }
}

/// Keeps a platform stream alive; dropping it stops the stream.
pub struct StreamHandle {
    _inner: Box<dyn Send>,
}

impl StreamHandle {
    /// Wrap whatever object owns the platform stream.
    pub fn new<T: Send + 'static>(stream: T) -> Self {
        Self {
            _inner: Box::new(stream),
        }
    }
}

impl core::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

/// A live microphone capture.
pub struct CaptureStream {
    /// Interleaved input samples.
    pub consumer: Consumer<f32>,
    pub channels: usize,
    pub sample_rate: u32,
    pub handle: StreamHandle,
}

/// A live output stream.
pub struct OutputStream {
    /// Interleaved samples the device callback drains.
    pub producer: Producer<f32>,
    pub channels: usize,
    pub sample_rate: u32,
    pub handle: StreamHandle,
}

/// Everything the engine needs from an audio platform.
///
/// `device: None` always means the platform's default device.
pub trait AudioHost {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Every input and output endpoint. Labels may be empty until a capture
    /// has been granted once.
    fn enumerate_devices(&self) -> Result<Vec<AudioDevice>>;

    /// Pick the rate for a new processing context, or fail if no context can run.
    fn create_context(&self, preferred_rate: Option<u32>) -> Result<u32>;

    /// Open the microphone with the given processing flags.
    ///
    /// Fails with [`PermissionDenied`](crate::Error::PermissionDenied) if the
    /// request is declined, no device exists or the request goes unanswered.
    fn request_capture(&self, device: Option<&DeviceId>, constraints: &CaptureConstraints) -> Result<CaptureStream>;

    /// Can a context at `sample_rate` be rendered straight to `device`?
    fn direct_capability(&self, device: Option<&DeviceId>, sample_rate: u32) -> SinkCapability;

    /// Open a low-latency output at exactly `sample_rate`.
    fn open_direct(&self, device: Option<&DeviceId>, sample_rate: u32) -> Result<OutputStream>;

    /// Can a buffered stream element play to `device`?
    fn stream_capability(&self, device: Option<&DeviceId>) -> SinkCapability;

    /// Open a buffered output at the device's native rate.
    fn open_stream(&self, device: Option<&DeviceId>) -> Result<OutputStream>;
}
