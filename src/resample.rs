//! Linear-interpolating rate conversion for interleaved ring-buffer streams.
//!
//! Bridges a stream produced at one sample rate (a capture device, another
//! graph's stream tap) into a consumer running at a different rate.

use dasp_graph::Buffer;
use rtrb::Consumer;

/// Most interleaved channels a stream may carry.
pub const MAX_CHANNELS: usize = 8;

/// Converts a stream of frames from one rate to another by linear interpolation.
///
/// Holds the two most recent input frames and a fractional read position
/// between them. For higher quality, a sinc interpolator would be needed;
/// voice and monitoring paths don't warrant it.
#[derive(Clone, Debug)]
pub struct LinearResampler {
    channels: usize,
    ratio: f64,
    position: f64,
    prev: [f32; MAX_CHANNELS],
    curr: [f32; MAX_CHANNELS],
    primed: bool,
}

impl LinearResampler {
    /// Resampler for `channels`-wide frames arriving at `input_rate`, read at `output_rate`.
    pub fn new(channels: usize, input_rate: u32, output_rate: u32) -> Self {
        let mut r = Self {
            channels: channels.clamp(1, MAX_CHANNELS),
            ratio: 1.0,
            position: 0.0,
            prev: [0.0; MAX_CHANNELS],
            curr: [0.0; MAX_CHANNELS],
            primed: false,
        };
        r.set_rates(input_rate, output_rate);
        r
    }

    /// Change the conversion ratio without dropping state.
    pub fn set_rates(&mut self, input_rate: u32, output_rate: u32) {
        self.ratio = input_rate.max(1) as f64 / output_rate.max(1) as f64;
    }

    /// Input frames consumed per output frame.
    #[inline]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Channels per input frame.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    // Whole frames only; a half-written frame stays queued.
    fn read_frame(&mut self, source: &mut Consumer<f32>) -> bool {
        if source.slots() < self.channels {
            return false;
        }
        for ch in 0..self.channels {
            match source.pop() {
                Ok(sample) => self.curr[ch] = sample,
                Err(_) => return false,
            }
        }
        true
    }

    fn advance_frame(&mut self) {
        self.prev[..self.channels].copy_from_slice(&self.curr[..self.channels]);
    }

    /// Produce one output frame into `out`. Returns `false` on underrun,
    /// leaving `out` untouched and the read position where it was.
    pub fn next_frame(&mut self, source: &mut Consumer<f32>, out: &mut [f32]) -> bool {
        if !self.primed {
            if source.slots() < self.channels * 2 {
                return false;
            }
            self.read_frame(source);
            self.advance_frame();
            self.read_frame(source);
            self.primed = true;
        }

        while self.position >= 1.0 {
            if !self.read_frame_after_shift(source) {
                return false;
            }
            self.position -= 1.0;
        }

        let t = self.position as f32;
        for (ch, o) in out.iter_mut().enumerate() {
            let idx = ch % self.channels;
            let prev = self.prev[idx];
            *o = prev + t * (self.curr[idx] - prev);
        }

        self.position += self.ratio;
        true
    }

    fn read_frame_after_shift(&mut self, source: &mut Consumer<f32>) -> bool {
        if source.slots() < self.channels {
            return false;
        }
        self.advance_frame();
        self.read_frame(source)
    }
}

/// An interleaved ring-buffer stream read through a [`LinearResampler`].
///
/// Optionally waits until `prebuffer` frames are queued before producing
/// anything (and again after every underrun), trading latency for fewer dropouts.
/// Once more than `max_backlog` frames pile up, the oldest are discarded down
/// to half that, so latency stays bounded.
pub struct ResamplingReader {
    consumer: Consumer<f32>,
    resampler: LinearResampler,
    prebuffer: usize,
    max_backlog: usize,
    waiting: bool,
    frame: [f32; MAX_CHANNELS],
}

impl ResamplingReader {
    /// Read `channels`-wide frames at `input_rate` out at `output_rate`.
    pub fn new(consumer: Consumer<f32>, channels: usize, input_rate: u32, output_rate: u32) -> Self {
        Self {
            consumer,
            resampler: LinearResampler::new(channels, input_rate, output_rate),
            prebuffer: 0,
            max_backlog: usize::MAX,
            waiting: false,
            frame: [0.0; MAX_CHANNELS],
        }
    }

    /// Hold output until this many input frames are queued (builder pattern).
    pub fn with_prebuffer(mut self, frames: usize) -> Self {
        self.prebuffer = frames;
        self.waiting = frames > 0;
        self
    }

    /// Drop the oldest input once more than this many frames are queued (builder pattern).
    pub fn with_max_backlog(mut self, frames: usize) -> Self {
        self.max_backlog = frames.max(self.prebuffer + 2);
        self
    }

    /// Input frames currently queued.
    #[inline]
    pub fn queued_frames(&self) -> usize {
        self.consumer.slots() / self.resampler.channels()
    }

    /// Whether the reader is holding output until its prebuffer fills.
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    fn trim_backlog(&mut self) {
        let queued = self.queued_frames();
        if queued <= self.max_backlog {
            return;
        }
        let keep = (self.max_backlog / 2).max(self.prebuffer).max(2);
        let excess = (queued - keep) * self.resampler.channels();
        if let Ok(chunk) = self.consumer.read_chunk(excess) {
            chunk.commit_all();
        }
    }

    /// Fill every output buffer for one block. Output channels wrap around the
    /// stream's channels (mono feeds both sides); underruns produce silence.
    ///
    /// Returns the number of frames that carried real input.
    pub fn fill(&mut self, outputs: &mut [Buffer]) -> usize {
        let frames = outputs.first().map_or(0, |b| b.len());
        let channels = outputs.len().min(MAX_CHANNELS);

        self.trim_backlog();
        if self.waiting && self.queued_frames() >= self.prebuffer {
            self.waiting = false;
        }

        let mut produced = 0;
        for i in 0..frames {
            let ok = !self.waiting && self.resampler.next_frame(&mut self.consumer, &mut self.frame[..channels]);
            if ok {
                produced += 1;
            } else {
                if self.prebuffer > 0 {
                    self.waiting = true;
                }
                self.frame[..channels].iter_mut().for_each(|s| *s = 0.0);
            }
            for (buffer, &s) in outputs.iter_mut().zip(&self.frame[..channels]) {
                buffer[i] = s;
            }
        }
        produced
    }

    /// Write one block of interleaved frames into `out` (`out.len() / channels` frames).
    /// Underruns produce silence. Returns frames carrying real input.
    pub fn fill_interleaved(&mut self, out: &mut [f32], channels: usize) -> usize {
        let channels = channels.clamp(1, MAX_CHANNELS);

        self.trim_backlog();
        if self.waiting && self.queued_frames() >= self.prebuffer {
            self.waiting = false;
        }

        let mut produced = 0;
        for frame_out in out.chunks_mut(channels) {
            let ok = !self.waiting && self.resampler.next_frame(&mut self.consumer, &mut self.frame[..channels]);
            if ok {
                produced += 1;
            } else {
                if self.prebuffer > 0 {
                    self.waiting = true;
                }
                self.frame[..channels].iter_mut().for_each(|s| *s = 0.0);
            }
            for (o, &s) in frame_out.iter_mut().zip(&self.frame[..channels]) {
                *o = s;
            }
        }
        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtrb::RingBuffer;

    #[test]
    fn unity_ratio_passes_frames_through() {
        let (mut tx, mut rx) = RingBuffer::new(64);
        for i in 0..8 {
            tx.push(i as f32).unwrap();
        }
        let mut r = LinearResampler::new(1, 48_000, 48_000);
        let mut out = [0.0];
        let mut got = Vec::new();
        while r.next_frame(&mut rx, &mut out) {
            got.push(out[0]);
        }
        assert_eq!(got, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn upsampling_interpolates_between_frames() {
        let (mut tx, mut rx) = RingBuffer::new(64);
        for s in [0.0, 1.0, 2.0] {
            tx.push(s).unwrap();
        }
        let mut r = LinearResampler::new(1, 24_000, 48_000);
        let mut out = [0.0];
        let mut got = Vec::new();
        while r.next_frame(&mut rx, &mut out) {
            got.push(out[0]);
        }
        assert_eq!(got, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn mono_spreads_to_every_output_channel() {
        let (mut tx, mut rx) = RingBuffer::new(64);
        for _ in 0..4 {
            tx.push(0.5).unwrap();
        }
        let mut r = LinearResampler::new(1, 48_000, 48_000);
        let mut out = [0.0; 2];
        assert!(r.next_frame(&mut rx, &mut out));
        assert_eq!(out, [0.5, 0.5]);
    }

    #[test]
    fn partial_frames_stay_queued() {
        let (mut tx, mut rx) = RingBuffer::new(64);
        for s in [1.0, 1.0, 2.0, 2.0, 3.0] {
            tx.push(s).unwrap();
        }
        let mut r = LinearResampler::new(2, 48_000, 48_000);
        let mut out = [0.0; 2];
        assert!(r.next_frame(&mut rx, &mut out));
        assert!(!r.next_frame(&mut rx, &mut out));
        assert_eq!(rx.slots(), 1);
        tx.push(3.0).unwrap();
        assert!(r.next_frame(&mut rx, &mut out));
        assert_eq!(out, [2.0, 2.0]);
    }

    #[test]
    fn reader_holds_until_prebuffered() {
        let (mut tx, rx) = RingBuffer::new(4096);
        let mut reader = ResamplingReader::new(rx, 1, 48_000, 48_000).with_prebuffer(128);
        let mut block = [0.0f32; 64];

        for _ in 0..100 {
            tx.push(1.0).unwrap();
        }
        assert_eq!(reader.fill_interleaved(&mut block, 1), 0);
        assert!(reader.is_waiting());

        for _ in 0..100 {
            tx.push(1.0).unwrap();
        }
        assert_eq!(reader.fill_interleaved(&mut block, 1), 64);
        assert!(block.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn backlog_is_trimmed() {
        let (mut tx, rx) = RingBuffer::new(4096);
        let mut reader = ResamplingReader::new(rx, 1, 48_000, 48_000).with_max_backlog(256);
        for _ in 0..2_000 {
            tx.push(0.25).unwrap();
        }
        let mut block = [0.0f32; 64];
        reader.fill_interleaved(&mut block, 1);
        assert!(reader.queued_frames() < 256);
    }
}
