//! The console's fixed effect chain.
//!
//! ```text
//!                      ┌──────────────────────────────► input analyser
//! capture ─► input ────┼──────────────────────────────┐
//!            gain      ├─► convolver ─► reverb wet ───┤
//!                      └─► delay ─────► delay wet ────┼─► master ─► output ──┬─► device sink
//!                 test tones ─────────────────────────┘   (mute)   analyser  └─► stream tap
//! ```
//!
//! Every gain-bearing stage is built closed and the whole topology is wired
//! before any audio flows. Nothing is audible until the first
//! [`apply_parameters`](SignalGraph::apply_parameters).

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ReverbConfig};
use crate::error::{Error, Result};
use crate::graph::{AudioGraph, Handle};
use crate::impulse::ImpulseResponse;
use crate::meter::Meter;
use crate::node::NodeId;
use crate::nodes::effect::RetiredImpulses;
use crate::nodes::{
    Analyser, CaptureMessage, CaptureSource, Convolver, ConvolverMessage, DelayMessage, DeviceSink, DeviceSinkMessage,
    FeedbackDelay, Gain, GainMessage, PartitionedImpulse, StreamTap, StreamTapMessage, TestTone, ToneSettings,
    MAX_SUBSCRIBERS,
};
use crate::params::EffectParameters;
use crate::resample::ResamplingReader;

/// Control values most recently handed to the graph.
///
/// Stages that never received a value report the 0 they were built with.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ControlTargets {
    pub input_gain: f32,
    pub master_gain: f32,
    pub reverb_wet: f32,
    pub delay_wet: f32,
    pub delay_time: f32,
    pub delay_feedback: f32,
    /// Length in seconds of the impulse response loaded in the convolver.
    pub reverb_decay: f32,
}

#[derive(Default)]
struct SentTargets {
    input_gain: Option<f32>,
    master_gain: Option<f32>,
    reverb_wet: Option<f32>,
    delay_wet: Option<f32>,
    delay_time: Option<f32>,
    delay_feedback: Option<f32>,
}

struct ToneVoice {
    id: NodeId,
    finished: Arc<AtomicBool>,
}

/// The main processing graph and handles to each of its stages.
pub struct SignalGraph {
    graph: AudioGraph,

    capture: Handle<CaptureMessage>,
    input_gain: Handle<GainMessage>,
    reverb: Handle<ConvolverMessage>,
    reverb_wet: Handle<GainMessage>,
    delay: Handle<DelayMessage>,
    delay_wet: Handle<GainMessage>,
    master: Handle<GainMessage>,
    output_analyser: NodeId,
    device_sink: Handle<DeviceSinkMessage>,
    stream_tap: Handle<StreamTapMessage>,

    meter: Meter,
    retired: RetiredImpulses,
    reverb_config: ReverbConfig,
    rng: StdRng,
    loaded_decay: f32,

    sent: SentTargets,
    tones: Vec<ToneVoice>,
    subscribers: [bool; MAX_SUBSCRIBERS],
}

impl SignalGraph {
    /// Build the complete chain at `sample_rate` with every stage closed.
    ///
    /// The reverb's impulse response is generated here from
    /// `params.reverb_decay`. On failure nothing is kept.
    pub fn build(sample_rate: u32, config: &EngineConfig, params: &EffectParameters) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::GraphConstructionFailed("context has no sample rate".into()));
        }
        let policy = config.smoothing;
        let mut graph = AudioGraph::new(sample_rate);

        let capture = graph.add(CaptureSource::new());
        let input_gain = graph.add(Gain::silent(policy, sample_rate));
        let (input_analyser, input_tap) = Analyser::new(&config.analyser);
        let input_analyser = graph.add(input_analyser).id();

        let mut rng = match config.reverb.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let decay = params.reverb_decay;
        let impulse = build_impulse(sample_rate, decay, &config.reverb, &mut rng);
        let (convolver, retired) = Convolver::new(impulse);
        let reverb = graph.add(convolver);
        let reverb_wet = graph.add(Gain::silent(policy, sample_rate));

        let delay = graph.add(FeedbackDelay::new(config.max_delay_secs, policy, sample_rate));
        let delay_wet = graph.add(Gain::silent(policy, sample_rate));

        let master = graph.add(Gain::silent(policy, sample_rate));
        let (output_analyser, output_tap) = Analyser::new(&config.analyser);
        let output_analyser = graph.add(output_analyser).id();
        let device_sink = graph.add(DeviceSink::new());
        let stream_tap = graph.add(StreamTap::new());

        let edges = [
            (capture.id(), input_gain.id()),
            (input_gain.id(), input_analyser),
            (input_gain.id(), master.id()),
            (input_gain.id(), reverb.id()),
            (reverb.id(), reverb_wet.id()),
            (reverb_wet.id(), master.id()),
            (input_gain.id(), delay.id()),
            (delay.id(), delay_wet.id()),
            (delay_wet.id(), master.id()),
            (master.id(), output_analyser),
            (output_analyser, device_sink.id()),
            (output_analyser, stream_tap.id()),
        ];
        for (from, to) in edges {
            if !graph.connect(from, to) {
                return Err(Error::GraphConstructionFailed(format!("could not wire {from:?} -> {to:?}")));
            }
        }
        for leaf in [input_analyser, device_sink.id(), stream_tap.id()] {
            if !graph.add_terminal(leaf) {
                return Err(Error::GraphConstructionFailed(format!("could not register {leaf:?}")));
            }
        }

        info!(sample_rate, nodes = graph.node_count(), edges = graph.edge_count(), "signal graph built");

        Ok(Self {
            graph,
            capture,
            input_gain,
            reverb,
            reverb_wet,
            delay,
            delay_wet,
            master,
            output_analyser,
            device_sink,
            stream_tap,
            meter: Meter::new(input_tap, output_tap),
            retired,
            reverb_config: config.reverb,
            rng,
            loaded_decay: decay,
            sent: SentTargets::default(),
            tones: Vec::new(),
            subscribers: [false; MAX_SUBSCRIBERS],
        })
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.graph.sample_rate()
    }

    /// The underlying graph.
    pub fn graph(&self) -> &AudioGraph {
        &self.graph
    }

    /// Render one block and move fresh samples into the meter.
    pub fn process(&mut self) {
        self.graph.process();
        self.meter.pull();
    }

    /// Glide every stage toward the values in `params`.
    ///
    /// Unchanged values are not resent, so applying the same snapshot twice
    /// changes nothing. A value whose queue is full is retried on the next call.
    /// A new `reverb_decay` rebuilds the impulse response here and hands it to
    /// the convolver.
    pub fn apply_parameters(&mut self, params: &EffectParameters) {
        let sent = &mut self.sent;
        glide(&mut self.input_gain, &mut sent.input_gain, params.input_gain, "input");
        glide(&mut self.master, &mut sent.master_gain, params.effective_master_gain(), "master");
        glide(&mut self.reverb_wet, &mut sent.reverb_wet, params.reverb_mix, "reverb wet");
        glide(&mut self.delay_wet, &mut sent.delay_wet, params.delay_mix, "delay wet");

        if sent.delay_time != Some(params.delay_time) {
            match self.delay.send(DelayMessage::SetDelayTime(params.delay_time)) {
                Ok(()) => sent.delay_time = Some(params.delay_time),
                Err(_) => warn!("delay queue full, time update deferred"),
            }
        }
        if sent.delay_feedback != Some(params.delay_feedback) {
            match self.delay.send(DelayMessage::SetFeedback(params.delay_feedback)) {
                Ok(()) => sent.delay_feedback = Some(params.delay_feedback),
                Err(_) => warn!("delay queue full, feedback update deferred"),
            }
        }

        if params.reverb_decay != self.loaded_decay {
            self.rebuild_reverb(params.reverb_decay);
        }

        let released = self.retired.release();
        if released > 0 {
            debug!(released, "released retired impulse responses");
        }
    }

    fn rebuild_reverb(&mut self, decay: f32) {
        let impulse = build_impulse(self.sample_rate(), decay, &self.reverb_config, &mut self.rng);
        match self.reverb.send(ConvolverMessage::SetImpulse(Box::new(impulse))) {
            Ok(()) => {
                debug!(from = self.loaded_decay, to = decay, "reverb impulse rebuilt");
                self.loaded_decay = decay;
            }
            Err(_) => warn!("convolver queue full, reverb rebuild deferred"),
        }
    }

    /// What the stages were last told.
    pub fn targets(&self) -> ControlTargets {
        let s = &self.sent;
        ControlTargets {
            input_gain: s.input_gain.unwrap_or(0.0),
            master_gain: s.master_gain.unwrap_or(0.0),
            reverb_wet: s.reverb_wet.unwrap_or(0.0),
            delay_wet: s.delay_wet.unwrap_or(0.0),
            delay_time: s.delay_time.unwrap_or(0.0),
            delay_feedback: s.delay_feedback.unwrap_or(0.0),
            reverb_decay: self.loaded_decay,
        }
    }

    /// Start a tone burst straight into the master stage.
    pub fn play_tone(&mut self, settings: ToneSettings) -> NodeId {
        let tone = TestTone::new(settings, self.sample_rate());
        let finished = tone.finished_flag();
        let id = self.graph.add(tone).id();
        self.graph.connect(id, self.master.id());
        self.tones.push(ToneVoice { id, finished });
        debug!(?id, frequency = settings.frequency, "test tone started");
        id
    }

    /// Remove tones that have played out. Returns how many were removed.
    pub fn reap_tones(&mut self) -> usize {
        let graph = &mut self.graph;
        let before = self.tones.len();
        self.tones.retain(|voice| {
            if voice.finished.load(Ordering::Acquire) {
                graph.remove(voice.id);
                false
            } else {
                true
            }
        });
        before - self.tones.len()
    }

    /// Tones still attached.
    #[inline]
    pub fn active_tones(&self) -> usize {
        self.tones.len()
    }

    /// Feed the chain from a capture stream.
    pub fn attach_capture(&mut self, reader: ResamplingReader) -> Result<()> {
        self.capture
            .send(CaptureMessage::Attach(reader))
            .map_err(|_| Error::Stream("capture queue full".into()))
    }

    /// Stop reading the current capture; the chain input goes silent.
    pub fn release_capture(&mut self) {
        if self.capture.send(CaptureMessage::Release).is_err() {
            warn!("capture queue full, release deferred to next attach");
        }
    }

    /// Point the device sink at an output stream.
    pub fn attach_device(&mut self, producer: Producer<f32>, channels: usize) -> Result<()> {
        self.device_sink
            .send(DeviceSinkMessage::Attach { producer, channels })
            .map_err(|_| Error::Stream("device sink queue full".into()))
    }

    /// Stop feeding the device sink's stream.
    pub fn detach_device(&mut self) {
        if self.device_sink.send(DeviceSinkMessage::Detach).is_err() {
            warn!("device sink queue full, detach dropped");
        }
    }

    /// (Re)connect the edge feeding the device sink.
    pub fn connect_direct(&mut self) {
        if !self.is_direct_connected() {
            self.graph.connect(self.output_analyser, self.device_sink.id());
            debug!("direct output edge connected");
        }
    }

    /// Cut the edge feeding the device sink.
    pub fn disconnect_direct(&mut self) {
        if self.graph.disconnect(self.output_analyser, self.device_sink.id()) {
            debug!("direct output edge disconnected");
        }
    }

    #[inline]
    pub fn is_direct_connected(&self) -> bool {
        self.graph.is_connected(self.output_analyser, self.device_sink.id())
    }

    /// Take a read-only copy of the final mix: interleaved stereo at the graph rate.
    pub fn subscribe(&mut self, capacity: usize) -> Result<(usize, Consumer<f32>)> {
        let slot = self
            .subscribers
            .iter()
            .position(|used| !used)
            .ok_or_else(|| Error::Stream("every stream tap slot is taken".into()))?;
        let (producer, consumer) = RingBuffer::new(capacity.max(2));
        self.stream_tap
            .send(StreamTapMessage::Subscribe(slot, producer))
            .map_err(|_| Error::Stream("stream tap queue full".into()))?;
        self.subscribers[slot] = true;
        Ok((slot, consumer))
    }

    /// Release a subscription slot.
    pub fn unsubscribe(&mut self, slot: usize) {
        if self.subscribers.get(slot).copied() != Some(true) {
            return;
        }
        match self.stream_tap.send(StreamTapMessage::Unsubscribe(slot)) {
            Ok(()) => self.subscribers[slot] = false,
            Err(_) => warn!(slot, "stream tap queue full, slot stays reserved"),
        }
    }

    pub fn meter_mut(&mut self) -> &mut Meter {
        &mut self.meter
    }
}

fn build_impulse(sample_rate: u32, decay_secs: f32, config: &ReverbConfig, rng: &mut StdRng) -> PartitionedImpulse {
    let ir = ImpulseResponse::decaying_noise(sample_rate, decay_secs, config.decay_exponent, rng);
    PartitionedImpulse::new(&ir, config.normalize)
}

fn glide(handle: &mut Handle<GainMessage>, last: &mut Option<f32>, target: f32, stage: &'static str) {
    if *last == Some(target) {
        return;
    }
    match handle.send(GainMessage::SetTarget(target)) {
        Ok(()) => *last = Some(target),
        Err(_) => warn!(stage, "gain queue full, update deferred"),
    }
}
