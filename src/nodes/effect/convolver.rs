//! Reverb convolver - non-uniformly partitioned overlap-save convolution
//!
//! The response is split into size classes: the head uses 64-frame partitions so the
//! wet signal has no added latency, and the partition size doubles after every two
//! partitions up to 8192 frames. Each class runs its own FFT pair and
//! frequency-domain delay line, firing once per `size` input frames. Products against
//! older spectra only depend on input already seen, so a class spreads them over the
//! blocks of its period and only the newest partition is left for the firing block.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use dasp_graph::{Buffer, Input};
use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::impulse::ImpulseResponse;
use crate::node::{AudioNode, ProcessContext, BLOCK_SIZE};
use crate::nodes::mix_inputs;

/// Smallest partition, one render block.
const HEAD_PARTITION: usize = BLOCK_SIZE;
/// Largest partition; the rest of the tail is cut into partitions of this size.
const MAX_PARTITION: usize = 8192;
/// Partitions per size before the size doubles.
const PARTITIONS_PER_SIZE: usize = 2;

const CHANNELS: usize = 2;

/// Blocks over which a replaced impulse response is crossfaded out.
const CROSSFADE_BLOCKS: usize = 8;

/// `(size, offset, count)` for every size class covering `len` frames.
///
/// A class of size `S` starts at offset `2S - 128` or later, which leaves it a full
/// period to compute before its first output frame is due.
fn size_classes(len: usize) -> Vec<(usize, usize, usize)> {
    let mut classes = Vec::new();
    let mut size = HEAD_PARTITION;
    let mut offset = 0;
    while offset < len {
        let needed = (len - offset + size - 1) / size;
        let count = if size < MAX_PARTITION {
            needed.min(PARTITIONS_PER_SIZE)
        } else {
            needed
        };
        classes.push((size, offset, count));
        offset += count * size;
        size = (size * 2).min(MAX_PARTITION);
    }
    if classes.is_empty() {
        classes.push((HEAD_PARTITION, 0, 1));
    }
    classes
}

#[inline]
fn multiply_accumulate(acc: &mut [Complex<f32>], x: &[Complex<f32>], h: &[Complex<f32>]) {
    for ((a, x), h) in acc.iter_mut().zip(x).zip(h) {
        *a += x * h;
    }
}

/// Per input channel time-domain state shared by every size class.
struct Lane {
    /// Recent input, indexed by absolute frame.
    history: Vec<f32>,
    /// Wet output not yet emitted, indexed by absolute frame.
    pending: Vec<f32>,
}

impl Lane {
    fn new(history: usize, reach: usize) -> Self {
        Self {
            history: vec![0.0; history.next_power_of_two()],
            pending: vec![0.0; reach.next_power_of_two()],
        }
    }

    fn write(&mut self, start: usize, block: &[f32]) {
        let mask = self.history.len() - 1;
        for (i, &s) in block.iter().enumerate() {
            self.history[start.wrapping_add(i) & mask] = s;
        }
    }

    /// Copy the `out.len()` frames ending just before `end`.
    fn read(&self, end: usize, out: &mut [f32]) {
        let mask = self.history.len() - 1;
        let start = end.wrapping_sub(out.len());
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.history[start.wrapping_add(i) & mask];
        }
    }

    fn schedule(&mut self, start: usize, samples: &[f32]) {
        let mask = self.pending.len() - 1;
        for (i, &s) in samples.iter().enumerate() {
            self.pending[start.wrapping_add(i) & mask] += s;
        }
    }

    fn take(&mut self, start: usize, out: &mut [f32]) {
        let mask = self.pending.len() - 1;
        for (i, o) in out.iter_mut().enumerate() {
            let slot = &mut self.pending[start.wrapping_add(i) & mask];
            *o = *slot;
            *slot = 0.0;
        }
    }
}

/// Partitions of one size, with their own transforms and delay line.
struct SizeClass {
    size: usize,
    offset: usize,
    partitions: usize,
    bins: usize,
    /// Render blocks per partition.
    period: usize,

    /// [impulse channel][partition * bins + bin]
    spectra: Vec<Vec<Complex<f32>>>,
    /// [input channel][slot * bins + bin]
    fdl: [Vec<Complex<f32>>; CHANNELS],
    /// Products gathered so far for the next firing.
    acc: [Vec<Complex<f32>>; CHANNELS],
    /// FDL slot holding the most recent input spectrum.
    newest: usize,

    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    time: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    out: Vec<f32>,
    scratch_fwd: Vec<Complex<f32>>,
    scratch_inv: Vec<Complex<f32>>,
}

impl SizeClass {
    fn new(
        ir: &ImpulseResponse,
        (size, offset, partitions): (usize, usize, usize),
        gain: f32,
        planner: &mut RealFftPlanner<f32>,
    ) -> Self {
        let r2c = planner.plan_fft_forward(2 * size);
        let c2r = planner.plan_fft_inverse(2 * size);
        let mut time = r2c.make_input_vec();
        let mut spectrum = r2c.make_output_vec();
        let mut scratch_fwd = r2c.make_scratch_vec();
        let bins = spectrum.len();

        // Inverse transforms are unnormalized; fold 1/N into the response.
        let scale = gain / (2 * size) as f32;

        let spectra = (0..ir.num_channels())
            .map(|ch| {
                let samples = ir.channel(ch);
                let mut out = Vec::with_capacity(partitions * bins);
                for p in 0..partitions {
                    let start = (offset + p * size).min(samples.len());
                    let end = (start + size).min(samples.len());
                    time.iter_mut().for_each(|s| *s = 0.0);
                    for (t, s) in time.iter_mut().zip(&samples[start..end]) {
                        *t = s * scale;
                    }
                    // Lengths come from the plan, so this cannot fail.
                    let _ = r2c.process_with_scratch(&mut time, &mut spectrum, &mut scratch_fwd);
                    out.extend_from_slice(&spectrum);
                }
                out
            })
            .collect();

        let zeros = || vec![Complex::new(0.0, 0.0); partitions * bins];
        Self {
            size,
            offset,
            partitions,
            bins,
            period: size / BLOCK_SIZE,
            spectra,
            fdl: [zeros(), zeros()],
            acc: [vec![Complex::new(0.0, 0.0); bins], vec![Complex::new(0.0, 0.0); bins]],
            newest: 0,
            out: c2r.make_output_vec(),
            scratch_inv: c2r.make_scratch_vec(),
            time,
            spectrum,
            scratch_fwd,
            r2c,
            c2r,
        }
    }

    #[inline]
    fn fires(&self, block: usize) -> bool {
        block % self.period == self.period - 1
    }

    fn next_slot(&self) -> usize {
        (self.newest + 1) % self.partitions
    }

    /// Partitions against older input handled during `block`.
    fn older_share(&self, block: usize) -> Range<usize> {
        let share = (self.partitions - 1 + self.period - 1) / self.period;
        let first = (1 + (block % self.period) * share).min(self.partitions);
        first..(first + share).min(self.partitions)
    }

    /// Advance channel `ch` by the render block ending at frame `end`.
    fn render(&mut self, ch: usize, imp_ch: usize, block: usize, end: usize, lane: &mut Lane) {
        let bins = self.bins;
        for p in self.older_share(block) {
            let slot = (self.newest + self.partitions + 1 - p) % self.partitions;
            multiply_accumulate(
                &mut self.acc[ch],
                &self.fdl[ch][slot * bins..(slot + 1) * bins],
                &self.spectra[imp_ch][p * bins..(p + 1) * bins],
            );
        }

        if !self.fires(block) {
            return;
        }

        lane.read(end, &mut self.time);
        if self
            .r2c
            .process_with_scratch(&mut self.time, &mut self.spectrum, &mut self.scratch_fwd)
            .is_err()
        {
            self.acc[ch].iter_mut().for_each(|c| *c = Complex::new(0.0, 0.0));
            return;
        }
        let slot = self.next_slot();
        self.fdl[ch][slot * bins..(slot + 1) * bins].copy_from_slice(&self.spectrum);

        let acc = &mut self.acc[ch];
        multiply_accumulate(acc, &self.spectrum, &self.spectra[imp_ch][..bins]);
        // Real signals: DC and Nyquist are purely real.
        acc[0].im = 0.0;
        acc[bins - 1].im = 0.0;
        let _ = self.c2r.process_with_scratch(acc, &mut self.out, &mut self.scratch_inv);
        acc.iter_mut().for_each(|c| *c = Complex::new(0.0, 0.0));

        lane.schedule(end - self.size + self.offset, &self.out[self.size..]);
    }
}

/// An impulse response pre-transformed into frequency-domain partitions,
/// bundled with the delay lines it convolves against.
///
/// Built on the control thread; everything the render path needs is allocated here.
pub struct PartitionedImpulse {
    classes: Vec<SizeClass>,
    lanes: [Lane; CHANNELS],
    impulse_channels: usize,
    /// Render blocks consumed so far.
    block: usize,
    duration_secs: f32,
}

impl PartitionedImpulse {
    /// Partition `ir`. With `normalize`, the response is scaled to a fixed loudness.
    pub fn new(ir: &ImpulseResponse, normalize: bool) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let gain = if normalize { ir.normalization_scale() } else { 1.0 };

        let classes: Vec<SizeClass> = size_classes(ir.len())
            .into_iter()
            .map(|class| SizeClass::new(ir, class, gain, &mut planner))
            .collect();

        let longest = classes.iter().map(|c| c.size).max().unwrap_or(HEAD_PARTITION);
        let reach = classes.iter().map(|c| c.offset + c.size).max().unwrap_or(HEAD_PARTITION);

        Self {
            classes,
            lanes: [(); CHANNELS].map(|_| Lane::new(2 * longest, reach + BLOCK_SIZE)),
            impulse_channels: ir.num_channels().max(1),
            block: 0,
            duration_secs: ir.duration_secs(),
        }
    }

    /// Number of partitions across every size class.
    #[inline]
    pub fn partitions(&self) -> usize {
        self.classes.iter().map(|c| c.partitions).sum()
    }

    /// Length of the source response in seconds.
    #[inline]
    pub fn duration_secs(&self) -> f32 {
        self.duration_secs
    }

    /// Average complex multiply-adds per channel per frame.
    pub fn multiply_adds_per_frame(&self) -> f32 {
        self.classes
            .iter()
            .map(|c| (c.partitions * c.bins) as f32 / c.size as f32)
            .sum()
    }

    /// Most complex multiply-adds a single render block spends per channel.
    pub fn peak_multiply_adds_per_block(&self) -> usize {
        let hyperperiod = self.classes.iter().map(|c| c.period).max().unwrap_or(1);
        (0..hyperperiod)
            .map(|block| {
                self.classes
                    .iter()
                    .map(|c| (c.older_share(block).len() + usize::from(c.fires(block))) * c.bins)
                    .sum::<usize>()
            })
            .max()
            .unwrap_or(0)
    }

    fn render(&mut self, ch: usize, input: &[f32], out: &mut [f32]) {
        let start = self.block * BLOCK_SIZE;
        let end = start + BLOCK_SIZE;
        let imp_ch = ch.min(self.impulse_channels - 1);
        let lane = &mut self.lanes[ch];

        lane.write(start, input);
        for class in self.classes.iter_mut() {
            class.render(ch, imp_ch, self.block, end, lane);
        }
        lane.take(start, out);
    }

    fn finish_block(&mut self) {
        for class in self.classes.iter_mut() {
            if class.fires(self.block) {
                class.newest = class.next_slot();
            }
        }
        self.block += 1;
    }
}

/// Messages to control a [`Convolver`]
pub enum ConvolverMessage {
    /// Swap in a rebuilt impulse response (crossfaded over a few blocks).
    SetImpulse(Box<PartitionedImpulse>),
}

/// Receives impulse responses the convolver has finished with, so they are
/// freed off the render path.
pub struct RetiredImpulses {
    consumer: Consumer<Box<PartitionedImpulse>>,
}

impl RetiredImpulses {
    /// Drop every retired response. Returns how many were released.
    pub fn release(&mut self) -> usize {
        let mut n = 0;
        while self.consumer.pop().is_ok() {
            n += 1;
        }
        n
    }
}

/// Stereo convolution reverb.
///
/// Each output channel is the matching input channel convolved with the
/// matching impulse channel. The wet level is applied downstream.
pub struct Convolver {
    impulse: Box<PartitionedImpulse>,
    fading_out: Option<(Box<PartitionedImpulse>, usize)>,
    retired: Producer<Box<PartitionedImpulse>>,

    input: [f32; BLOCK_SIZE],
    wet: [f32; BLOCK_SIZE],
    fade: [f32; BLOCK_SIZE],
}

impl Convolver {
    /// Create a convolver around `impulse`.
    ///
    /// Returns the node and the queue through which replaced responses come back.
    pub fn new(impulse: PartitionedImpulse) -> (Self, RetiredImpulses) {
        let (producer, consumer) = RingBuffer::new(4);

        let node = Self {
            impulse: Box::new(impulse),
            fading_out: None,
            retired: producer,
            input: [0.0; BLOCK_SIZE],
            wet: [0.0; BLOCK_SIZE],
            fade: [0.0; BLOCK_SIZE],
        };
        (node, RetiredImpulses { consumer })
    }

    fn retire(&mut self, impulse: Box<PartitionedImpulse>) {
        // Queue full: the control side stopped collecting, drop here instead.
        let _ = self.retired.push(impulse);
    }
}

impl AudioNode for Convolver {
    type Message = ConvolverMessage;

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        messages: impl Iterator<Item = ConvolverMessage>,
        inputs: &[Input],
        outputs: &mut [Buffer],
    ) {
        for msg in messages {
            match msg {
                ConvolverMessage::SetImpulse(next) => {
                    let previous = core::mem::replace(&mut self.impulse, next);
                    if let Some((older, _)) = self.fading_out.replace((previous, CROSSFADE_BLOCKS)) {
                        self.retire(older);
                    }
                }
            }
        }

        // Outputs double as the mixed input block
        mix_inputs(inputs, outputs);

        for (ch, buffer) in outputs.iter_mut().enumerate().take(CHANNELS) {
            self.input.copy_from_slice(&buffer[..]);
            self.impulse.render(ch, &self.input, &mut self.wet);

            match &mut self.fading_out {
                Some((old, remaining)) => {
                    old.render(ch, &self.input, &mut self.fade);

                    let total = (CROSSFADE_BLOCKS * BLOCK_SIZE) as f32;
                    let done = ((CROSSFADE_BLOCKS - *remaining) * BLOCK_SIZE) as f32;
                    for (i, sample) in buffer.iter_mut().enumerate() {
                        let t = (done + i as f32) / total;
                        *sample = self.wet[i] * t + self.fade[i] * (1.0 - t);
                    }
                }
                None => {
                    buffer.copy_from_slice(&self.wet);
                }
            }
        }

        self.impulse.finish_block();
        if let Some((mut old, remaining)) = self.fading_out.take() {
            old.finish_block();
            if remaining > 1 {
                self.fading_out = Some((old, remaining - 1));
            } else {
                self.retire(old);
            }
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
