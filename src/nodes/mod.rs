//! Built-in audio nodes.
//!
//! Nodes are organized into three categories:
//!
//! ## Sources ([`source`])
//!
//! Generate audio with no audio inputs:
//! - [`CaptureSource`] - Microphone samples from a capture stream
//! - [`StreamSource`] - Reads a stream tap subscription (feeds the monitor context)
//! - [`TestTone`] - Self-terminating calibration burst
//!
//! ## Effects ([`effect`])
//!
//! Process audio (inputs → outputs):
//! - [`Gain`] - Summing gain stage with smoothing
//! - [`Convolver`] - Partitioned FFT convolution with a fixed impulse response
//! - [`FeedbackDelay`] - Delay line with an internal feedback loop
//! - [`Analyser`] - Pass-through analysis tap
//!
//! ## Sinks ([`sink`])
//!
//! Consume audio with no audio outputs:
//! - [`DeviceSink`] - Feeds an output device stream directly
//! - [`StreamTap`] - Fans the signal out to ring-buffer subscribers
//!
//! # Message Types
//!
//! Nodes with runtime controls have associated message types:
//! - [`GainMessage`], [`ConvolverMessage`], [`DelayMessage`]
//! - [`CaptureMessage`], [`DeviceSinkMessage`], [`StreamTapMessage`]
//!
//! Nodes without parameters use `()` as their message type.

pub mod effect;
pub mod sink;
pub mod source;

// Re-export common types at the top level for convenience
pub use effect::{
    Analyser, AnalyserTap, Convolver, ConvolverMessage, DelayMessage, FeedbackDelay, Gain, GainMessage,
    PartitionedImpulse,
};
pub use sink::{DeviceSink, DeviceSinkMessage, StreamTap, StreamTapMessage, MAX_SUBSCRIBERS};
pub use source::{CaptureMessage, CaptureSource, StreamSource, TestTone, ToneSettings};

use dasp_graph::{Buffer, Input};

/// Sum every input into `outputs`, channel by channel.
///
/// If an input has fewer channels, its last channel is reused (mono spreads
/// to both sides). If it has more, the extra channels are ignored.
pub(crate) fn mix_inputs(inputs: &[Input], outputs: &mut [Buffer]) {
    silence(outputs);

    for input in inputs {
        let in_buffers = input.buffers();
        if in_buffers.is_empty() {
            continue;
        }

        for (out_ch, out_buf) in outputs.iter_mut().enumerate() {
            let in_buf = &in_buffers[out_ch.min(in_buffers.len() - 1)];
            for (o, i) in out_buf.iter_mut().zip(in_buf.iter()) {
                *o += *i;
            }
        }
    }
}

#[inline]
pub(crate) fn silence(outputs: &mut [Buffer]) {
    for buf in outputs.iter_mut() {
        buf.iter_mut().for_each(|s| *s = 0.0);
    }
}

#[cfg(test)]
pub(crate) use testing::{Collect, CollectReader, ConstantSource, ImpulseSource, PlaybackSource};
