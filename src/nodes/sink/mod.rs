//! Sink nodes - consume audio with no audio outputs

mod device_sink;
mod stream_tap;

pub use device_sink::{DeviceSink, DeviceSinkMessage};
pub use stream_tap::{StreamTap, StreamTapMessage, MAX_SUBSCRIBERS};

use dasp_graph::Input;
use rtrb::Producer;

/// Interleave the first input into `producer`, mapping `channels` output
/// channels onto the input's (mono is duplicated).
///
/// The whole block is skipped if it doesn't fit, so the reader never sees a
/// partial block. Returns whether the block was written.
pub(crate) fn push_interleaved(inputs: &[Input], producer: &mut Producer<f32>, channels: usize) -> bool {
    let Some(input) = inputs.first() else {
        return false;
    };
    let buffers = input.buffers();
    if buffers.is_empty() {
        return false;
    }

    let buffer_len = buffers[0].len();
    if producer.slots() < buffer_len * channels {
        return false;
    }

    for i in 0..buffer_len {
        for ch in 0..channels {
            let src_ch = ch.min(buffers.len() - 1);
            // Space checked above
            let _ = producer.push(buffers[src_ch][i]);
        }
    }
    true
}
