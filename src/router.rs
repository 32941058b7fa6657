//! Output routing for the main and monitor roles.
//!
//! Each role reaches hardware through one of two mechanisms:
//!
//! - [`Mechanism::Direct`]: a [`DeviceSink`](crate::nodes::DeviceSink) feeds
//!   an output stream opened at the context's own rate. Lowest latency.
//! - [`Mechanism::Stream`]: a [`StreamElement`] reads the main graph's stream
//!   tap through a jitter buffer, resamples to the device's native rate and
//!   writes to a buffered output stream. Works wherever the device can be
//!   opened at all, at the cost of a few blocks of latency.
//!
//! The router always tries `Direct` first. Which mechanism is active per role
//! is tracked, and the monitor's audibility is re-derived from it after every
//! switch: the monitor context's gain stage gates a direct monitor, the
//! element's mute flag gates a streamed one.

use alloc::vec::Vec;

use rtrb::Producer;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::device::{DeviceId, OutputRole};
use crate::error::{Error, Result};
use crate::graph::{AudioGraph, Handle};
use crate::host::{AudioHost, OutputStream, SinkCapability, StreamHandle};
use crate::node::BLOCK_SIZE;
use crate::nodes::{DeviceSink, DeviceSinkMessage, Gain, GainMessage, StreamSource};
use crate::resample::ResamplingReader;
use crate::signal::SignalGraph;

/// Seconds of main-graph audio a tap subscription can hold.
const SUBSCRIPTION_SECS: f32 = 0.5;

/// How a role's audio reaches its device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mechanism {
    Direct,
    Stream,
}

/// Probed support of both mechanisms for one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteCapability {
    pub direct: SinkCapability,
    pub stream: SinkCapability,
}

fn subscription_capacity(rate: u32) -> usize {
    ((rate as f32 * SUBSCRIPTION_SECS) as usize * 2).next_power_of_two()
}

struct Playback {
    slot: usize,
    reader: ResamplingReader,
    output: OutputStream,
    // device frames owed per main block, and the fractional remainder
    frames_per_block: f64,
    owed: f64,
    scratch: Vec<f32>,
}

/// Buffered player bound to an output device.
///
/// Reads the final mix from the main graph's stream tap. While muted it keeps
/// consuming and writes silence, so unmuting never replays stale audio.
pub struct StreamElement {
    playback: Option<Playback>,
    sink_id: Option<DeviceId>,
    muted: bool,
    jitter_frames: usize,
}

impl StreamElement {
    fn new(jitter_frames: usize) -> Self {
        Self {
            playback: None,
            sink_id: None,
            muted: true,
            jitter_frames,
        }
    }

    /// Whether the element is silenced.
    #[inline]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Device the element plays to; `None` while closed or on the default device.
    #[inline]
    pub fn sink_id(&self) -> Option<&DeviceId> {
        self.sink_id.as_ref()
    }

    /// Whether an output stream is attached.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.playback.is_some()
    }

    /// Start playing to `output`, replacing any previous stream.
    fn open(&mut self, signal: &mut SignalGraph, output: OutputStream, device: Option<&DeviceId>) -> Result<()> {
        let main_rate = signal.sample_rate();
        let (slot, consumer) = signal.subscribe(subscription_capacity(main_rate))?;
        self.close(signal);

        let reader = ResamplingReader::new(consumer, 2, main_rate, output.sample_rate)
            .with_prebuffer(self.jitter_frames)
            .with_max_backlog(self.jitter_frames * 4);
        let frames_per_block = BLOCK_SIZE as f64 * output.sample_rate as f64 / main_rate as f64;
        let scratch = vec![0.0; (frames_per_block.ceil() as usize + 1) * output.channels.max(1)];

        debug!(slot, rate = output.sample_rate, jitter = self.jitter_frames, "stream element opened");
        self.playback = Some(Playback {
            slot,
            reader,
            output,
            frames_per_block,
            owed: 0.0,
            scratch,
        });
        self.sink_id = device.cloned();
        Ok(())
    }

    fn close(&mut self, signal: &mut SignalGraph) {
        if let Some(playback) = self.playback.take() {
            signal.unsubscribe(playback.slot);
            debug!(slot = playback.slot, "stream element closed");
        }
        self.sink_id = None;
    }

    /// Move one main block's worth of audio to the device.
    fn pump(&mut self) {
        let muted = self.muted;
        let Some(p) = self.playback.as_mut() else {
            return;
        };
        p.owed += p.frames_per_block;
        let frames = p.owed.floor() as usize;
        p.owed -= frames as f64;

        let channels = p.output.channels.max(1);
        let scratch_len = p.scratch.len();
        let block = &mut p.scratch[..(frames * channels).min(scratch_len)];
        p.reader.fill_interleaved(block, channels);
        if muted {
            block.iter_mut().for_each(|s| *s = 0.0);
        }
        write_block(&mut p.output.producer, block);
    }
}

fn write_block(producer: &mut Producer<f32>, block: &[f32]) {
    if producer.slots() < block.len() {
        return;
    }
    for &s in block {
        let _ = producer.push(s);
    }
}

/// Independent processing context for the local monitor.
///
/// Its only input is a stream tap subscription of the main graph; nothing it
/// does can change the main graph's nodes or timing.
pub struct MonitorContext {
    graph: AudioGraph,
    gain: Handle<GainMessage>,
    sink: Handle<DeviceSinkMessage>,
    slot: usize,
    main_rate: u32,
    blocks: u64,
    gain_target: Option<f32>,
}

impl MonitorContext {
    fn new(signal: &mut SignalGraph, sample_rate: u32, config: &EngineConfig) -> Result<Self> {
        let main_rate = signal.sample_rate();
        let (slot, consumer) = signal.subscribe(subscription_capacity(main_rate))?;
        let jitter = config.element_jitter_blocks * BLOCK_SIZE;
        let reader = ResamplingReader::new(consumer, 2, main_rate, sample_rate)
            .with_prebuffer(jitter)
            .with_max_backlog(jitter * 4);

        let mut graph = AudioGraph::new(sample_rate);
        let source = graph.add(StreamSource::new(reader));
        let gain = graph.add(Gain::silent(config.smoothing, sample_rate));
        let sink = graph.add(DeviceSink::new());
        let wired = graph.connect(source.id(), gain.id()) && graph.connect(gain.id(), sink.id());
        if !wired || !graph.add_terminal(sink.id()) {
            signal.unsubscribe(slot);
            return Err(Error::GraphConstructionFailed("monitor context wiring".into()));
        }

        info!(sample_rate, main_rate, "monitor context created");
        Ok(Self {
            graph,
            gain,
            sink,
            slot,
            main_rate,
            blocks: 0,
            gain_target: None,
        })
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.graph.sample_rate()
    }

    /// Gain most recently sent to the monitor stage (0 until the first send).
    #[inline]
    pub fn gain_target(&self) -> f32 {
        self.gain_target.unwrap_or(0.0)
    }

    /// Blocks rendered so far.
    #[inline]
    pub fn blocks_processed(&self) -> u64 {
        self.blocks
    }

    fn set_gain(&mut self, target: f32) {
        if self.gain_target == Some(target) {
            return;
        }
        match self.gain.send(GainMessage::SetTarget(target)) {
            Ok(()) => self.gain_target = Some(target),
            Err(_) => warn!("monitor gain queue full, update deferred"),
        }
    }

    fn attach_device(&mut self, producer: Producer<f32>, channels: usize) -> Result<()> {
        self.sink
            .send(DeviceSinkMessage::Attach { producer, channels })
            .map_err(|_| Error::Stream("monitor sink queue full".into()))
    }

    fn detach_device(&mut self) {
        if self.sink.send(DeviceSinkMessage::Detach).is_err() {
            warn!("monitor sink queue full, detach dropped");
        }
    }

    /// Render until this context has covered as much time as `main_blocks` main blocks.
    fn process_to(&mut self, main_blocks: u64) {
        let needed = (main_blocks as u128 * self.sample_rate() as u128 / self.main_rate.max(1) as u128) as u64;
        while self.blocks < needed {
            self.graph.process();
            self.blocks += 1;
        }
    }
}

struct Route {
    role: OutputRole,
    mechanism: Option<Mechanism>,
    device: Option<DeviceId>,
    capability: Option<(Option<DeviceId>, RouteCapability)>,
    direct: Option<StreamHandle>,
    element: StreamElement,
}

impl Route {
    fn new(role: OutputRole, jitter_frames: usize) -> Self {
        Self {
            role,
            mechanism: None,
            device: None,
            capability: None,
            direct: None,
            element: StreamElement::new(jitter_frames),
        }
    }
}

/// Routes the final mix to the main and monitor devices.
pub struct OutputRouter {
    main: Route,
    monitor: Route,
    context: MonitorContext,
    monitoring_enabled: bool,
}

impl OutputRouter {
    /// Create the monitor context and both (unrouted) roles.
    pub fn new<H: AudioHost>(host: &H, signal: &mut SignalGraph, config: &EngineConfig) -> Result<Self> {
        let monitor_rate = host.create_context(config.sample_rate)?;
        let context = MonitorContext::new(signal, monitor_rate, config)?;
        let jitter = config.element_jitter_blocks * BLOCK_SIZE;
        Ok(Self {
            main: Route::new(OutputRole::Main, jitter),
            monitor: Route::new(OutputRole::Monitor, jitter),
            context,
            monitoring_enabled: false,
        })
    }

    fn route(&self, role: OutputRole) -> &Route {
        match role {
            OutputRole::Main => &self.main,
            OutputRole::Monitor => &self.monitor,
        }
    }

    fn route_mut(&mut self, role: OutputRole) -> &mut Route {
        match role {
            OutputRole::Main => &mut self.main,
            OutputRole::Monitor => &mut self.monitor,
        }
    }

    /// Active mechanism for `role`, or `None` while unrouted.
    pub fn mechanism(&self, role: OutputRole) -> Option<Mechanism> {
        self.route(role).mechanism
    }

    /// Device `role` is routed to; `None` is the default device or unrouted.
    pub fn device(&self, role: OutputRole) -> Option<&DeviceId> {
        self.route(role).device.as_ref()
    }

    /// Cached probe result for `role`'s current device.
    pub fn capability(&self, role: OutputRole) -> Option<RouteCapability> {
        self.route(role).capability.as_ref().map(|(_, c)| *c)
    }

    /// The stream element serving `role`.
    pub fn element(&self, role: OutputRole) -> &StreamElement {
        &self.route(role).element
    }

    pub fn monitor_context(&self) -> &MonitorContext {
        &self.context
    }

    /// The monitoring flag audibility was last derived from.
    #[inline]
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring_enabled
    }

    fn context_rate(&self, role: OutputRole, signal: &SignalGraph) -> u32 {
        match role {
            OutputRole::Main => signal.sample_rate(),
            OutputRole::Monitor => self.context.sample_rate(),
        }
    }

    fn probe<H: AudioHost>(&mut self, host: &H, role: OutputRole, device: Option<&DeviceId>, rate: u32) -> RouteCapability {
        let route = self.route_mut(role);
        if let Some((probed, caps)) = &route.capability {
            if probed.as_ref() == device {
                return *caps;
            }
        }
        let caps = RouteCapability {
            direct: host.direct_capability(device, rate),
            stream: host.stream_capability(device),
        };
        debug!(%role, ?device, ?caps, "sink capability probed");
        route.capability = Some((device.cloned(), caps));
        caps
    }

    /// Send `role` to `device` (`None` = default device).
    ///
    /// Tries the direct mechanism, then the stream mechanism. If neither can
    /// reach the device, the current routing is kept and
    /// [`RoutingUnsupported`](Error::RoutingUnsupported) is returned.
    pub fn set_output<H: AudioHost>(
        &mut self,
        host: &H,
        signal: &mut SignalGraph,
        role: OutputRole,
        device: Option<&DeviceId>,
    ) -> Result<Mechanism> {
        let rate = self.context_rate(role, signal);
        let caps = self.probe(host, role, device, rate);

        let mut routed = None;
        if caps.direct.is_supported() {
            match host.open_direct(device, rate) {
                Ok(output) => {
                    self.use_direct(signal, role, device, output)?;
                    routed = Some(Mechanism::Direct);
                }
                Err(err @ Error::DeviceUnavailable(_)) => return Err(err),
                Err(err) => warn!(%role, %err, "direct output failed"),
            }
        }
        if routed.is_none() && caps.stream.is_supported() {
            if caps.direct.is_supported() {
                warn!(%role, "falling back to the stream mechanism");
            }
            match host.open_stream(device) {
                Ok(output) => {
                    self.use_stream(signal, role, device, output)?;
                    routed = Some(Mechanism::Stream);
                }
                Err(err @ Error::DeviceUnavailable(_)) => return Err(err),
                Err(err) => warn!(%role, %err, "stream output failed"),
            }
        }

        let Some(mechanism) = routed else {
            return Err(Error::RoutingUnsupported {
                role,
                device: device.cloned().unwrap_or_else(|| DeviceId::new("default")),
            });
        };
        info!(%role, ?device, ?mechanism, "output routed");
        self.apply_monitoring(self.monitoring_enabled);
        Ok(mechanism)
    }

    fn use_direct(
        &mut self,
        signal: &mut SignalGraph,
        role: OutputRole,
        device: Option<&DeviceId>,
        output: OutputStream,
    ) -> Result<()> {
        let OutputStream {
            producer,
            channels,
            handle,
            ..
        } = output;
        match role {
            OutputRole::Main => {
                signal.attach_device(producer, channels)?;
                signal.connect_direct();
            }
            OutputRole::Monitor => self.context.attach_device(producer, channels)?,
        }

        let route = self.route_mut(role);
        route.element.close(signal);
        route.direct = Some(handle);
        route.mechanism = Some(Mechanism::Direct);
        route.device = device.cloned();
        Ok(())
    }

    fn use_stream(
        &mut self,
        signal: &mut SignalGraph,
        role: OutputRole,
        device: Option<&DeviceId>,
        output: OutputStream,
    ) -> Result<()> {
        self.route_mut(role).element.open(signal, output, device)?;
        match role {
            OutputRole::Main => {
                signal.disconnect_direct();
                signal.detach_device();
            }
            OutputRole::Monitor => self.context.detach_device(),
        }

        let route = self.route_mut(role);
        route.direct = None;
        route.mechanism = Some(Mechanism::Stream);
        route.device = device.cloned();
        Ok(())
    }

    /// Gate the monitor according to `enabled` and the active mechanisms.
    ///
    /// Also silences whichever element isn't the active path for its role.
    pub fn apply_monitoring(&mut self, enabled: bool) {
        self.monitoring_enabled = enabled;
        self.main.element.muted = self.main.mechanism != Some(Mechanism::Stream);

        let (gain, element_muted) = match self.monitor.mechanism {
            Some(Mechanism::Direct) => (if enabled { 1.0 } else { 0.0 }, true),
            Some(Mechanism::Stream) => (0.0, !enabled),
            None => (0.0, true),
        };
        self.context.set_gain(gain);
        self.monitor.element.muted = element_muted;
        debug!(enabled, monitor = ?self.monitor.mechanism, gain, element_muted, "monitoring applied");
    }

    /// Advance everything downstream of one main block.
    pub(crate) fn after_block(&mut self, main_blocks: u64) {
        self.main.element.pump();
        self.monitor.element.pump();
        self.context.process_to(main_blocks);
    }

    /// Release every stream and subscription.
    pub(crate) fn shutdown(mut self, signal: &mut SignalGraph) {
        for route in [&mut self.main, &mut self.monitor] {
            route.element.close(signal);
            route.direct = None;
            route.mechanism = None;
            debug!(role = %route.role, "route released");
        }
        signal.unsubscribe(self.context.slot);
        signal.disconnect_direct();
        signal.detach_device();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AudioDevice, DeviceRole};
    use crate::host::{OutputKind, VirtualHost};
    use crate::params::EffectParameters;

    fn host() -> VirtualHost {
        VirtualHost::new()
            .with_device(AudioDevice::new("mic", "Mic", DeviceRole::Input))
            .with_device(AudioDevice::new("cable", "Cable", DeviceRole::Output))
            .with_device(AudioDevice::new("phones", "Headphones", DeviceRole::Output))
    }

    fn setup(host: &VirtualHost) -> (SignalGraph, OutputRouter) {
        let mut config = EngineConfig::default();
        config.reverb.seed = Some(1);
        let mut signal = SignalGraph::build(48_000, &config, &EffectParameters::default()).unwrap();
        let router = OutputRouter::new(host, &mut signal, &config).unwrap();
        (signal, router)
    }

    #[test]
    fn direct_is_preferred() {
        let host = host();
        let (mut signal, mut router) = setup(&host);
        let cable = DeviceId::new("cable");

        let m = router.set_output(&host, &mut signal, OutputRole::Main, Some(&cable)).unwrap();
        assert_eq!(m, Mechanism::Direct);
        assert!(signal.is_direct_connected());
        assert!(router.element(OutputRole::Main).is_muted());
        assert!(host.output_open(&cable, OutputKind::Direct));
    }

    #[test]
    fn stream_fallback_cuts_direct_edge() {
        let host = host();
        host.set_direct_supported(false);
        let (mut signal, mut router) = setup(&host);
        let cable = DeviceId::new("cable");

        let m = router.set_output(&host, &mut signal, OutputRole::Main, Some(&cable)).unwrap();
        assert_eq!(m, Mechanism::Stream);
        assert!(!signal.is_direct_connected());
        let element = router.element(OutputRole::Main);
        assert!(!element.is_muted());
        assert_eq!(element.sink_id(), Some(&cable));
        assert!(host.output_open(&cable, OutputKind::Stream));
    }

    #[test]
    fn unsupported_keeps_current_route() {
        let host = host();
        let (mut signal, mut router) = setup(&host);
        let cable = DeviceId::new("cable");
        router.set_output(&host, &mut signal, OutputRole::Main, Some(&cable)).unwrap();

        host.set_direct_supported(false);
        host.set_stream_supported(false);
        let phones = DeviceId::new("phones");
        let err = router.set_output(&host, &mut signal, OutputRole::Main, Some(&phones)).unwrap_err();
        assert!(matches!(err, Error::RoutingUnsupported { role: OutputRole::Main, .. }));
        assert_eq!(router.device(OutputRole::Main), Some(&cable));
        assert_eq!(router.mechanism(OutputRole::Main), Some(Mechanism::Direct));
        assert!(host.output_open(&cable, OutputKind::Direct));
    }

    #[test]
    fn capability_is_cached_per_device() {
        let host = host();
        let (mut signal, mut router) = setup(&host);
        let cable = DeviceId::new("cable");
        router.set_output(&host, &mut signal, OutputRole::Main, Some(&cable)).unwrap();
        let probed = router.capability(OutputRole::Main).unwrap();

        // Same device: the cached answer stands even though the host changed.
        host.set_direct_supported(false);
        let _ = router.set_output(&host, &mut signal, OutputRole::Main, Some(&cable));
        assert_eq!(router.capability(OutputRole::Main), Some(probed));

        let phones = DeviceId::new("phones");
        router.set_output(&host, &mut signal, OutputRole::Main, Some(&phones)).unwrap();
        assert_eq!(router.capability(OutputRole::Main).unwrap().direct, SinkCapability::Unsupported);
        assert_eq!(router.mechanism(OutputRole::Main), Some(Mechanism::Stream));
    }

    #[test]
    fn monitoring_follows_mechanism() {
        let host = host();
        let (mut signal, mut router) = setup(&host);
        let phones = DeviceId::new("phones");

        router.set_output(&host, &mut signal, OutputRole::Monitor, Some(&phones)).unwrap();
        router.apply_monitoring(true);
        assert_eq!(router.monitor_context().gain_target(), 1.0);
        assert!(router.element(OutputRole::Monitor).is_muted());

        host.set_direct_supported(false);
        let cable = DeviceId::new("cable");
        router.set_output(&host, &mut signal, OutputRole::Monitor, Some(&cable)).unwrap();
        assert_eq!(router.monitor_context().gain_target(), 0.0);
        assert!(!router.element(OutputRole::Monitor).is_muted());

        router.apply_monitoring(false);
        assert!(router.element(OutputRole::Monitor).is_muted());
    }

    #[test]
    fn monitor_context_keeps_pace() {
        let host = host();
        host.set_context_rate(44_100);
        let (mut signal, mut router) = setup(&host);
        for block in 1..=100 {
            signal.process();
            router.after_block(block);
        }
        // 100 blocks at 48 kHz cover 91.875 blocks at 44.1 kHz
        assert_eq!(router.monitor_context().blocks_processed(), 91);
        assert_eq!(router.monitor_context().sample_rate(), 44_100);
    }
}
