//! Gain stage with smoothed level changes

use dasp_graph::{Buffer, Input};

use crate::node::{AudioNode, ProcessContext};
use crate::nodes::mix_inputs;
use crate::smoothing::{Smoother, SmoothingPolicy};

/// Messages to control gain
#[derive(Clone, Copy, Debug)]
pub enum GainMessage {
    /// Glide toward a new gain multiplier (1.0 = unity, 0.0 = silence)
    SetTarget(f32),
    /// Jump to a gain multiplier with no glide
    SetImmediate(f32),
}

/// A gain stage that sums all of its inputs and scales the result.
///
/// Every input is summed per channel (mono inputs are spread to all outputs),
/// then multiplied by a smoothed gain. Level changes always glide according to
/// the stage's [`SmoothingPolicy`], so moving a control never clicks.
pub struct Gain {
    gain: Smoother,
    channels: usize,
}

impl Gain {
    /// Create a stereo gain stage resting at `gain`.
    pub fn new(gain: f32, policy: SmoothingPolicy, sample_rate: u32) -> Self {
        Self {
            gain: Smoother::new(gain, policy, sample_rate),
            channels: 2,
        }
    }

    /// Create a stage that starts fully closed.
    ///
    /// Stages built this way only open once a target is sent.
    pub fn silent(policy: SmoothingPolicy, sample_rate: u32) -> Self {
        Self::new(0.0, policy, sample_rate)
    }

    /// Target gain.
    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain.target()
    }
}

impl AudioNode for Gain {
    type Message = GainMessage;

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        messages: impl Iterator<Item = GainMessage>,
        inputs: &[Input],
        outputs: &mut [Buffer],
    ) {
        for msg in messages {
            match msg {
                GainMessage::SetTarget(g) => self.gain.set_target(g),
                GainMessage::SetImmediate(g) => self.gain.set_immediate(g),
            }
        }

        mix_inputs(inputs, outputs);

        let Some(len) = outputs.first().map(|b| b.len()) else {
            return;
        };

        // One smoothed value per frame, shared by every channel
        for i in 0..len {
            let g = self.gain.next();
            for buffer in outputs.iter_mut() {
                buffer[i] *= g;
            }
        }
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        usize::MAX
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        self.channels
    }
}
