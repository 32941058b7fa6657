//! In-memory audio host with scriptable devices

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::debug;

use super::{AudioHost, CaptureConstraints, CaptureStream, OutputStream, SinkCapability, StreamHandle};
use crate::device::{AudioDevice, DeviceId, DeviceRole};
use crate::error::{Error, Result};

const CAPTURE_CAPACITY: usize = 1 << 16;
const OUTPUT_CAPACITY: usize = 1 << 17;

/// How the simulated user answers a capture request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionOutcome {
    Grant,
    Deny,
    /// The prompt is dismissed without an answer.
    Unanswered,
}

/// Which mechanism opened an output stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    Direct,
    Stream,
}

/// Marks a stream dead when its handle is dropped.
struct Liveness(Arc<AtomicBool>);

impl Drop for Liveness {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Capture {
    producer: Producer<f32>,
    alive: Arc<AtomicBool>,
}

struct OpenOutput {
    device: DeviceId,
    kind: OutputKind,
    consumer: Consumer<f32>,
    channels: usize,
    sample_rate: u32,
    alive: Arc<AtomicBool>,
}

struct State {
    devices: Vec<AudioDevice>,
    permission: PermissionOutcome,
    granted: bool,
    direct_supported: bool,
    stream_supported: bool,
    fail_context: bool,
    context_rate: u32,
    capture_channels: usize,
    capture_rate: u32,
    stream_rate: u32,
    captures: Vec<Capture>,
    outputs: Vec<OpenOutput>,
    capture_requests: usize,
    max_live_captures: usize,
    last_constraints: Option<CaptureConstraints>,
}

impl State {
    fn resolve(&self, role: DeviceRole, device: Option<&DeviceId>) -> Result<DeviceId> {
        let mut candidates = self.devices.iter().filter(|d| d.role == role);
        let found = match device {
            Some(id) => candidates.find(|d| &d.id == id),
            None => candidates.next(),
        };
        match (found, device) {
            (Some(d), _) => Ok(d.id.clone()),
            (None, Some(id)) => Err(Error::DeviceUnavailable(id.clone())),
            (None, None) => Err(Error::Stream(format!("no {role:?} device"))),
        }
    }

    fn live_captures(&self) -> usize {
        self.captures.iter().filter(|c| c.alive.load(Ordering::Acquire)).count()
    }
}

/// A host whose devices, capabilities and user answers are set by the caller.
///
/// Clones share state, so a test can keep one clone to feed the microphone and
/// inspect outputs while the engine owns another.
///
/// ```
/// use micdeck::host::{AudioHost, VirtualHost};
/// use micdeck::{AudioDevice, DeviceRole};
///
/// let host = VirtualHost::new()
///     .with_device(AudioDevice::new("mic", "USB Mic", DeviceRole::Input))
///     .with_device(AudioDevice::new("cable", "Virtual Cable", DeviceRole::Output));
/// // Labels stay hidden until a capture has been granted
/// assert!(host.enumerate_devices().unwrap().iter().all(|d| d.label.is_empty()));
/// ```
#[derive(Clone)]
pub struct VirtualHost {
    state: Arc<Mutex<State>>,
}

impl Default for VirtualHost {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualHost {
    /// A host with no devices, granting permission, supporting both mechanisms.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                devices: Vec::new(),
                permission: PermissionOutcome::Grant,
                granted: false,
                direct_supported: true,
                stream_supported: true,
                fail_context: false,
                context_rate: 48_000,
                capture_channels: 1,
                capture_rate: 48_000,
                stream_rate: 44_100,
                captures: Vec::new(),
                outputs: Vec::new(),
                capture_requests: 0,
                max_live_captures: 0,
                last_constraints: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a device (builder pattern).
    pub fn with_device(self, device: AudioDevice) -> Self {
        self.add_device(device);
        self
    }

    pub fn add_device(&self, device: AudioDevice) {
        self.lock().devices.push(device);
    }

    /// Unplug a device. Streams already open on it keep running.
    pub fn remove_device(&self, id: &DeviceId) {
        self.lock().devices.retain(|d| &d.id != id);
    }

    pub fn set_permission(&self, outcome: PermissionOutcome) {
        self.lock().permission = outcome;
    }

    pub fn set_direct_supported(&self, supported: bool) {
        self.lock().direct_supported = supported;
    }

    pub fn set_stream_supported(&self, supported: bool) {
        self.lock().stream_supported = supported;
    }

    /// Make context creation fail.
    pub fn set_fail_context(&self, fail: bool) {
        self.lock().fail_context = fail;
    }

    /// Rate handed out for new contexts when none is preferred.
    pub fn set_context_rate(&self, rate: u32) {
        self.lock().context_rate = rate;
    }

    /// Channel count and rate of future captures.
    pub fn set_capture_format(&self, channels: usize, sample_rate: u32) {
        let mut s = self.lock();
        s.capture_channels = channels.max(1);
        s.capture_rate = sample_rate;
    }

    /// Native rate of stream-mechanism outputs.
    pub fn set_stream_rate(&self, rate: u32) {
        self.lock().stream_rate = rate;
    }

    /// Push interleaved samples into every live capture. Returns samples accepted.
    pub fn feed_input(&self, samples: &[f32]) -> usize {
        let mut s = self.lock();
        s.captures.retain(|c| c.alive.load(Ordering::Acquire));
        let mut accepted = 0;
        for capture in s.captures.iter_mut() {
            accepted = samples.iter().take_while(|&&x| capture.producer.push(x).is_ok()).count();
        }
        accepted
    }

    /// Take everything written to `device` through `kind` streams so far.
    ///
    /// Samples are interleaved with the stream's channel count.
    pub fn drain_output(&self, device: &DeviceId, kind: OutputKind) -> Vec<f32> {
        let mut s = self.lock();
        let mut out = Vec::new();
        for o in s.outputs.iter_mut().filter(|o| &o.device == device && o.kind == kind) {
            out.extend(core::iter::from_fn(|| o.consumer.pop().ok()));
        }
        s.outputs.retain(|o| o.alive.load(Ordering::Acquire) || !o.consumer.is_empty());
        out
    }

    /// Whether a live `kind` stream is open on `device`.
    pub fn output_open(&self, device: &DeviceId, kind: OutputKind) -> bool {
        self.lock()
            .outputs
            .iter()
            .any(|o| &o.device == device && o.kind == kind && o.alive.load(Ordering::Acquire))
    }

    /// Channels and rate of the live `kind` stream on `device`.
    pub fn output_format(&self, device: &DeviceId, kind: OutputKind) -> Option<(usize, u32)> {
        self.lock()
            .outputs
            .iter()
            .find(|o| &o.device == device && o.kind == kind && o.alive.load(Ordering::Acquire))
            .map(|o| (o.channels, o.sample_rate))
    }

    /// Captures currently open.
    pub fn live_captures(&self) -> usize {
        self.lock().live_captures()
    }

    /// Highest number of captures that were ever open at once.
    pub fn max_live_captures(&self) -> usize {
        self.lock().max_live_captures
    }

    /// Number of capture requests, granted or not.
    pub fn capture_requests(&self) -> usize {
        self.lock().capture_requests
    }

    /// Flags passed with the most recent capture request.
    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.lock().last_constraints
    }

    fn open_output(&self, kind: OutputKind, device: Option<&DeviceId>, rate: Option<u32>) -> Result<OutputStream> {
        let mut s = self.lock();
        let device = s.resolve(DeviceRole::Output, device)?;
        let sample_rate = rate.unwrap_or(s.stream_rate);
        let (producer, consumer) = RingBuffer::new(OUTPUT_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        debug!(%device, ?kind, sample_rate, "virtual output opened");
        s.outputs.push(OpenOutput {
            device,
            kind,
            consumer,
            channels: 2,
            sample_rate,
            alive: Arc::clone(&alive),
        });
        Ok(OutputStream {
            producer,
            channels: 2,
            sample_rate,
            handle: StreamHandle::new(Liveness(alive)),
        })
    }
}

impl AudioHost for VirtualHost {
    fn name(&self) -> &str {
        "virtual"
    }

    fn enumerate_devices(&self) -> Result<Vec<AudioDevice>> {
        let s = self.lock();
        Ok(s.devices
            .iter()
            .cloned()
            .map(|mut d| {
                if !s.granted {
                    d.label.clear();
                }
                d
            })
            .collect())
    }

    fn create_context(&self, preferred_rate: Option<u32>) -> Result<u32> {
        let s = self.lock();
        if s.fail_context {
            return Err(Error::GraphConstructionFailed("virtual context unavailable".into()));
        }
        Ok(preferred_rate.unwrap_or(s.context_rate))
    }

    fn request_capture(&self, device: Option<&DeviceId>, constraints: &CaptureConstraints) -> Result<CaptureStream> {
        let mut s = self.lock();
        s.capture_requests += 1;
        s.last_constraints = Some(*constraints);

        match s.permission {
            PermissionOutcome::Grant => {}
            PermissionOutcome::Deny => return Err(Error::PermissionDenied("declined".into())),
            PermissionOutcome::Unanswered => {
                return Err(Error::PermissionDenied(format!(
                    "unanswered after {:?}",
                    constraints.permission_timeout
                )))
            }
        }
        let id = s
            .resolve(DeviceRole::Input, device)
            .map_err(|_| Error::PermissionDenied("no capture device".into()))?;
        s.granted = true;

        let (producer, consumer) = RingBuffer::new(CAPTURE_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        s.captures.retain(|c| c.alive.load(Ordering::Acquire));
        s.captures.push(Capture {
            producer,
            alive: Arc::clone(&alive),
        });
        let live = s.live_captures();
        s.max_live_captures = s.max_live_captures.max(live);
        debug!(device = %id, live, "virtual capture opened");

        Ok(CaptureStream {
            consumer,
            channels: s.capture_channels,
            sample_rate: s.capture_rate,
            handle: StreamHandle::new(Liveness(alive)),
        })
    }

    fn direct_capability(&self, device: Option<&DeviceId>, _sample_rate: u32) -> SinkCapability {
        let s = self.lock();
        if s.direct_supported && s.resolve(DeviceRole::Output, device).is_ok() {
            SinkCapability::Supported
        } else {
            SinkCapability::Unsupported
        }
    }

    fn open_direct(&self, device: Option<&DeviceId>, sample_rate: u32) -> Result<OutputStream> {
        if !self.lock().direct_supported {
            return Err(Error::Stream("direct output not supported".into()));
        }
        self.open_output(OutputKind::Direct, device, Some(sample_rate))
    }

    fn stream_capability(&self, device: Option<&DeviceId>) -> SinkCapability {
        let s = self.lock();
        if s.stream_supported && s.resolve(DeviceRole::Output, device).is_ok() {
            SinkCapability::Supported
        } else {
            SinkCapability::Unsupported
        }
    }

    fn open_stream(&self, device: Option<&DeviceId>) -> Result<OutputStream> {
        if !self.lock().stream_supported {
            return Err(Error::Stream("stream output not supported".into()));
        }
        self.open_output(OutputKind::Stream, device, None)
    }
}
