//! Digital delay with an internal feedback loop

use alloc::vec::Vec;

use dasp_graph::{Buffer, Input};

use crate::node::{AudioNode, ProcessContext};
use crate::nodes::mix_inputs;
use crate::smoothing::{Smoother, SmoothingPolicy};

/// Highest feedback the loop accepts. Anything at or above 1.0 would never decay.
pub const MAX_FEEDBACK: f32 = 0.95;

/// Messages to control a [`FeedbackDelay`]
#[derive(Clone, Copy, Debug)]
pub enum DelayMessage {
    /// Glide the delay time (seconds), clamped to the line length
    SetDelayTime(f32),
    /// Glide the feedback amount, clamped to `[0, MAX_FEEDBACK]`
    SetFeedback(f32),
}

/// A stereo delay line whose output is fed back into its own input.
///
/// The feedback path lives inside the node so the graph stays acyclic. Per
/// sample: `y = line[t - delay]`, then `line[t] = x + feedback * y`. The
/// output is the delayed signal only; the wet level is applied downstream.
///
/// Both delay time and feedback start at zero and glide under the node's
/// [`SmoothingPolicy`]. Fractional delays are read with linear interpolation,
/// and the delay never drops below one sample.
pub struct FeedbackDelay {
    lines: [Vec<f32>; 2],
    write: usize,
    delay_secs: Smoother,
    feedback: Smoother,
    max_delay_secs: f32,
}

impl FeedbackDelay {
    /// Allocate a line able to hold `max_delay_secs` of audio at `sample_rate`.
    pub fn new(max_delay_secs: f32, policy: SmoothingPolicy, sample_rate: u32) -> Self {
        let max_delay_secs = max_delay_secs.max(0.0);
        let len = (max_delay_secs * sample_rate as f32).ceil() as usize + 2;
        Self {
            lines: [vec![0.0; len], vec![0.0; len]],
            write: 0,
            delay_secs: Smoother::new(0.0, policy, sample_rate),
            feedback: Smoother::new(0.0, policy, sample_rate),
            max_delay_secs,
        }
    }

    /// Longest delay the line supports, in seconds.
    pub fn max_delay_secs(&self) -> f32 {
        self.max_delay_secs
    }

    #[inline]
    fn read(line: &[f32], write: usize, delay_samples: f32) -> f32 {
        let len = line.len();
        let whole = delay_samples.floor();
        let frac = delay_samples - whole;
        let whole = whole as usize;
        let a = line[(write + len - whole) % len];
        let b = line[(write + len - whole - 1) % len];
        a + (b - a) * frac
    }
}

impl AudioNode for FeedbackDelay {
    type Message = DelayMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = DelayMessage>,
        inputs: &[Input],
        outputs: &mut [Buffer],
    ) {
        for msg in messages {
            match msg {
                DelayMessage::SetDelayTime(t) => self.delay_secs.set_target(t.clamp(0.0, self.max_delay_secs)),
                DelayMessage::SetFeedback(f) => self.feedback.set_target(f.clamp(0.0, MAX_FEEDBACK)),
            }
        }

        mix_inputs(inputs, outputs);

        let sr = ctx.sample_rate as f32;
        let len = self.lines[0].len();
        let max_samples = (len - 2) as f32;
        let frames = outputs.first().map_or(0, |b| b.len());

        for i in 0..frames {
            let delay = (self.delay_secs.next() * sr).clamp(1.0, max_samples.max(1.0));
            let fb = self.feedback.next();

            for (line, buffer) in self.lines.iter_mut().zip(outputs.iter_mut()) {
                let x = buffer[i];
                let y = Self::read(line, self.write, delay);
                line[self.write] = x + fb * y;
                buffer[i] = y;
            }
            self.write = (self.write + 1) % len;
        }
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        usize::MAX
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AudioGraph;
    use crate::node::BLOCK_SIZE;
    use crate::nodes::{Collect, ImpulseSource};

    fn echoes(delay_secs: f32, feedback: f32, blocks: usize) -> Vec<f32> {
        let mut g = AudioGraph::new(48_000);
        let mut delay = g.add(FeedbackDelay::new(1.0, SmoothingPolicy::Instant, 48_000));
        delay.send(DelayMessage::SetDelayTime(delay_secs)).unwrap();
        delay.send(DelayMessage::SetFeedback(feedback)).unwrap();
        let src = g.add(ImpulseSource::new());
        let (collect, mut out) = Collect::new(blocks * BLOCK_SIZE);
        let sink = g.add(collect);
        g.connect(src.id(), delay.id());
        g.connect(delay.id(), sink.id());
        g.add_terminal(sink.id());
        for _ in 0..blocks {
            g.process();
        }
        out.drain_channel(0)
    }

    #[test]
    fn first_echo_arrives_after_the_delay_time() {
        // 100 samples at 48 kHz
        let out = echoes(100.0 / 48_000.0, 0.0, 8);
        assert!(out[..100].iter().all(|s| s.abs() < 1e-4));
        assert!((out[100] - 1.0).abs() < 1e-4);
        assert!(out[101..].iter().all(|s| s.abs() < 1e-4));
    }

    #[test]
    fn feedback_repeats_decay_geometrically() {
        let out = echoes(100.0 / 48_000.0, 0.5, 8);
        assert!((out[100] - 1.0).abs() < 1e-4);
        assert!((out[200] - 0.5).abs() < 1e-4);
        assert!((out[300] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn feedback_at_or_above_one_is_clamped_and_decays() {
        let out = echoes(64.0 / 48_000.0, 4.0, 400);
        let energy = |range: core::ops::Range<usize>| out[range].iter().map(|s| s * s).sum::<f32>();
        let early = energy(0..6_400);
        let late = energy(19_200..25_600);
        assert!(late < early, "early {early}, late {late}");
        assert!(out.iter().all(|s| s.abs() <= 1.0 + 1e-4));
    }

    #[test]
    fn zero_delay_is_one_sample() {
        let out = echoes(0.0, 0.0, 2);
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-4);
    }
}
