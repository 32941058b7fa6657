//! Self-terminating calibration tone

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use dasp_graph::{Buffer, Input};
use serde::{Deserialize, Serialize};

use crate::node::{AudioNode, ProcessContext};
use crate::nodes::silence;

/// Level the tone's envelope decays to by the end of its duration.
const END_LEVEL: f32 = 0.001;

/// Shape of the diagnostic tone.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToneSettings {
    /// Frequency in Hz.
    pub frequency: f32,
    /// Length of the burst in seconds.
    pub duration_secs: f32,
    /// Starting amplitude (0.3 is about -10 dBFS).
    pub level: f32,
}

impl Default for ToneSettings {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            duration_secs: 1.0,
            level: 0.3,
        }
    }
}

/// A sine burst whose amplitude decays exponentially from `level` to 0.001.
///
/// After `duration_secs` it outputs silence and raises its finished flag, so
/// the owner can detach it from the graph.
pub struct TestTone {
    phase: f32,
    step: f32,
    amplitude: f32,
    decay: f32,
    remaining: u64,
    finished: Arc<AtomicBool>,
}

impl TestTone {
    pub fn new(settings: ToneSettings, sample_rate: u32) -> Self {
        let sr = sample_rate.max(1) as f32;
        let total = (settings.duration_secs.max(0.0) * sr).round().max(1.0);
        let level = settings.level.clamp(END_LEVEL, 1.0);
        Self {
            phase: 0.0,
            step: settings.frequency / sr,
            amplitude: level,
            decay: (END_LEVEL / level).powf(1.0 / total),
            remaining: total as u64,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag raised once the burst has played out.
    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }
}

impl AudioNode for TestTone {
    type Message = ();

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        _inputs: &[Input],
        outputs: &mut [Buffer],
    ) {
        if self.remaining == 0 {
            silence(outputs);
            return;
        }

        let frames = outputs.first().map_or(0, |b| b.len());
        for i in 0..frames {
            let s = if self.remaining > 0 {
                self.remaining -= 1;
                let s = (self.phase * core::f32::consts::TAU).sin() * self.amplitude;
                self.phase = (self.phase + self.step).fract();
                self.amplitude *= self.decay;
                s
            } else {
                0.0
            };
            for buffer in outputs.iter_mut() {
                buffer[i] = s;
            }
        }

        if self.remaining == 0 {
            self.finished.store(true, Ordering::Release);
        }
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        2
    }
}
