//! Analysis tap - pass-through node plus a control-side spectrum reader

use alloc::sync::Arc;
use alloc::vec::Vec;

use dasp_graph::{Buffer, Input};
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::config::AnalyserConfig;
use crate::node::{AudioNode, ProcessContext};
use crate::nodes::mix_inputs;

/// Pass-through node that copies a mono downmix of its signal to an [`AnalyserTap`].
///
/// The audio itself flows through unchanged, so the analyser can sit inline
/// between two stages.
pub struct Analyser {
    producer: Producer<f32>,
}

impl Analyser {
    /// Create the node and the reader on the other end of its queue.
    pub fn new(config: &AnalyserConfig) -> (Self, AnalyserTap) {
        let fft_size = config.fft_size.max(32).next_power_of_two();
        let (producer, consumer) = RingBuffer::new(fft_size * 16);
        (Self { producer }, AnalyserTap::new(consumer, fft_size, config))
    }
}

impl AudioNode for Analyser {
    type Message = ();

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        inputs: &[Input],
        outputs: &mut [Buffer],
    ) {
        mix_inputs(inputs, outputs);

        let channels = outputs.len();
        if channels == 0 {
            return;
        }
        let scale = 1.0 / channels as f32;
        for i in 0..outputs[0].len() {
            let mono: f32 = outputs.iter().map(|b| b[i]).sum::<f32>() * scale;
            // Reader fell behind: drop rather than block.
            let _ = self.producer.push(mono);
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

/// Control-side reader producing byte-scaled magnitude spectra.
///
/// Keeps the most recent `fft_size` samples, and on every read applies a
/// Blackman window, a real FFT, temporal smoothing and a decibel-to-byte map.
/// All buffers are allocated up front; reading never allocates.
pub struct AnalyserTap {
    consumer: Consumer<f32>,
    fft: Arc<dyn RealToComplex<f32>>,

    history: Vec<f32>,
    write: usize,

    window: Vec<f32>,
    frame: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    bytes: Vec<u8>,

    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl AnalyserTap {
    fn new(consumer: Consumer<f32>, fft_size: usize, config: &AnalyserConfig) -> Self {
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let window = (0..fft_size)
            .map(|i| {
                let x = core::f32::consts::TAU * i as f32 / fft_size as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();
        let bins = fft_size / 2;

        Self {
            consumer,
            history: vec![0.0; fft_size],
            write: 0,
            window,
            frame: fft.make_input_vec(),
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            smoothed: vec![0.0; bins],
            bytes: vec![0; bins],
            fft,
            smoothing: config.smoothing.clamp(0.0, 1.0),
            min_db: config.min_decibels,
            max_db: config.max_decibels.max(config.min_decibels + 1.0),
        }
    }

    /// Number of bins a spectrum read produces (half the FFT size).
    #[inline]
    pub fn frequency_bin_count(&self) -> usize {
        self.smoothed.len()
    }

    /// Move every queued sample into the analysis window.
    pub fn pull(&mut self) {
        let len = self.history.len();
        while let Ok(sample) = self.consumer.pop() {
            self.history[self.write] = sample;
            self.write = (self.write + 1) % len;
        }
    }

    /// Compute a fresh spectrum and copy it into `out`, one byte per bin.
    ///
    /// Extra bins in `out` are zeroed; extra spectrum bins are dropped.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        self.analyse();
        let n = out.len().min(self.bytes.len());
        out[..n].copy_from_slice(&self.bytes[..n]);
        out[n..].iter_mut().for_each(|b| *b = 0);
    }

    /// Compute a fresh spectrum and return the mean bin value over 128, capped at 1.
    pub fn level(&mut self) -> f32 {
        self.analyse();
        let sum: u32 = self.bytes.iter().map(|&b| b as u32).sum();
        let mean = sum as f32 / self.bytes.len() as f32;
        (mean / 128.0).min(1.0)
    }

    fn analyse(&mut self) {
        self.pull();

        let len = self.history.len();
        for (i, (f, w)) in self.frame.iter_mut().zip(&self.window).enumerate() {
            *f = self.history[(self.write + i) % len] * w;
        }

        if self
            .fft
            .process_with_scratch(&mut self.frame, &mut self.spectrum, &mut self.scratch)
            .is_err()
        {
            return;
        }

        let norm = 1.0 / len as f32;
        let range = self.max_db - self.min_db;
        for ((smoothed, byte), bin) in self.smoothed.iter_mut().zip(self.bytes.iter_mut()).zip(&self.spectrum) {
            let magnitude = bin.norm() * norm;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            let db = if *smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = 255.0 / range * (db - self.min_db);
            *byte = scaled.clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AudioGraph;

    struct Sine {
        phase: f32,
        step: f32,
    }

    impl AudioNode for Sine {
        type Message = ();

        fn process(&mut self, _: &ProcessContext, _: impl Iterator<Item = ()>, _: &[Input], outputs: &mut [Buffer]) {
            for i in 0..outputs[0].len() {
                let s = (self.phase * core::f32::consts::TAU).sin();
                self.phase = (self.phase + self.step).fract();
                for b in outputs.iter_mut() {
                    b[i] = s;
                }
            }
        }

        fn num_outputs(&self) -> usize {
            2
        }
    }

    fn config(smoothing: f32) -> AnalyserConfig {
        AnalyserConfig {
            fft_size: 256,
            smoothing,
            ..AnalyserConfig::default()
        }
    }

    #[test]
    fn silence_reads_as_zero() {
        let (mut analyser_graph, mut tap) = {
            let mut g = AudioGraph::new(48_000);
            let (node, tap) = Analyser::new(&config(0.0));
            let a = g.add(node);
            g.add_terminal(a.id());
            (g, tap)
        };
        for _ in 0..8 {
            analyser_graph.process();
        }
        let mut bins = [1u8; 128];
        tap.byte_frequency_data(&mut bins);
        assert!(bins.iter().all(|&b| b == 0));
        assert_eq!(tap.level(), 0.0);
    }

    #[test]
    fn sine_peaks_in_its_bin() {
        let mut g = AudioGraph::new(48_000);
        // 1875 Hz is exactly bin 10 at 256 points
        let src = g.add(Sine {
            phase: 0.0,
            step: 1875.0 / 48_000.0,
        });
        let (node, mut tap) = Analyser::new(&config(0.0));
        let a = g.add(node);
        g.connect(src.id(), a.id());
        g.add_terminal(a.id());
        for _ in 0..8 {
            g.process();
        }

        let mut bins = [0u8; 128];
        tap.byte_frequency_data(&mut bins);
        assert_eq!(bins[10], 255);
        assert!(bins[40..].iter().all(|&b| b < 64), "leakage {:?}", &bins[40..]);
        assert!(tap.level() > 0.0);
    }

    #[test]
    fn smoothing_holds_energy_after_silence() {
        let mut g = AudioGraph::new(48_000);
        let (node, mut tap) = Analyser::new(&config(0.8));
        let mut src = g.add(crate::nodes::Gain::new(1.0, crate::SmoothingPolicy::Instant, 48_000));
        let a = g.add(node);
        g.connect(src.id(), a.id());
        g.add_terminal(a.id());
        let tone = g.add(Sine {
            phase: 0.0,
            step: 1875.0 / 48_000.0,
        });
        g.connect(tone.id(), src.id());

        for _ in 0..8 {
            g.process();
        }
        let mut bins = [0u8; 128];
        for _ in 0..10 {
            tap.byte_frequency_data(&mut bins);
        }
        let loud = bins[10];

        src.send(crate::nodes::GainMessage::SetImmediate(0.0)).unwrap();
        for _ in 0..8 {
            g.process();
        }
        tap.byte_frequency_data(&mut bins);
        assert!(bins[10] > 0 && bins[10] <= loud);
    }
}
