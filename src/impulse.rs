//! Procedural plate-style impulse responses for the reverb unit.

use alloc::vec::Vec;

use rand::Rng;

// Loudness calibration applied when normalizing, so the wet level stays put
// regardless of impulse length or sample rate.
const GAIN_CALIBRATION: f32 = 0.00125;
const GAIN_CALIBRATION_SAMPLE_RATE: f32 = 44_100.0;
const MIN_POWER: f32 = 0.000125;

/// A multi-channel impulse response held in the time domain.
#[derive(Clone, Debug)]
pub struct ImpulseResponse {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl ImpulseResponse {
    /// Build a stereo response of exponentially shaped noise.
    ///
    /// Each sample is `uniform(-1, 1) * (1 - i / len) ^ decay_exponent`, drawn
    /// independently per channel so left and right are decorrelated.
    /// `len` is `sample_rate * duration_secs`, at least one sample.
    pub fn decaying_noise<R: Rng + ?Sized>(
        sample_rate: u32,
        duration_secs: f32,
        decay_exponent: f32,
        rng: &mut R,
    ) -> Self {
        let len = ((sample_rate as f32 * duration_secs.max(0.0)) as usize).max(1);
        let channels = (0..2)
            .map(|_| {
                (0..len)
                    .map(|i| {
                        let envelope = (1.0 - i as f32 / len as f32).powf(decay_exponent);
                        rng.random_range(-1.0f32..1.0) * envelope
                    })
                    .collect()
            })
            .collect();

        Self { channels, sample_rate }
    }

    /// Wrap existing sample data. Channels shorter than the longest are zero-padded.
    pub fn from_channels(mut channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        if channels.is_empty() {
            channels.push(vec![0.0]);
        }
        let len = channels.iter().map(Vec::len).max().unwrap_or(0).max(1);
        for ch in channels.iter_mut() {
            ch.resize(len, 0.0);
        }
        Self { channels, sample_rate }
    }

    /// Length in frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    /// Always false; a response has at least one frame.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Number of channels.
    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples of one channel.
    #[inline]
    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.channels[ch]
    }

    /// Sample rate the response was generated for.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        self.len() as f32 / self.sample_rate as f32
    }

    /// Scale that brings the response to a fixed loudness, based on its RMS power.
    pub fn normalization_scale(&self) -> f32 {
        let total: f64 = self
            .channels
            .iter()
            .flat_map(|ch| ch.iter())
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        let count = (self.num_channels() * self.len()) as f64;
        let power = ((total / count).sqrt() as f32).max(MIN_POWER);

        GAIN_CALIBRATION / power * (GAIN_CALIBRATION_SAMPLE_RATE / self.sample_rate as f32)
    }

    /// Energy of one channel between two frame positions.
    pub fn energy(&self, ch: usize, range: core::ops::Range<usize>) -> f32 {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        self.channels[ch][start..end].iter().map(|s| s * s).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn plate(seed: u64) -> ImpulseResponse {
        ImpulseResponse::decaying_noise(8_000, 1.0, 2.0, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn length_follows_duration() {
        let ir = plate(1);
        assert_eq!(ir.len(), 8_000);
        assert_eq!(ir.num_channels(), 2);
        assert_eq!(ImpulseResponse::decaying_noise(8_000, 0.0, 2.0, &mut StdRng::seed_from_u64(1)).len(), 1);
    }

    #[test]
    fn samples_stay_under_the_envelope() {
        let ir = plate(2);
        for ch in 0..2 {
            for (i, &s) in ir.channel(ch).iter().enumerate() {
                let envelope = (1.0 - i as f32 / 8_000.0).powf(2.0);
                assert!(s.abs() <= envelope + 1e-6);
            }
        }
    }

    #[test]
    fn energy_decays_across_the_response() {
        let ir = plate(3);
        let early = ir.energy(0, 0..2_000);
        let late = ir.energy(0, 6_000..8_000);
        assert!(early > late * 10.0, "early {early}, late {late}");
    }

    #[test]
    fn channels_are_decorrelated() {
        let ir = plate(4);
        let dot: f32 = ir.channel(0).iter().zip(ir.channel(1)).map(|(a, b)| a * b).sum();
        let norm = ir.energy(0, 0..8_000).sqrt() * ir.energy(1, 0..8_000).sqrt();
        assert!((dot / norm).abs() < 0.1);
    }

    #[test]
    fn normalization_is_length_independent() {
        let short = ImpulseResponse::decaying_noise(48_000, 0.5, 2.0, &mut StdRng::seed_from_u64(5));
        let long = ImpulseResponse::decaying_noise(48_000, 4.0, 2.0, &mut StdRng::seed_from_u64(5));
        let ratio = short.normalization_scale() / long.normalization_scale();
        assert!((ratio - 1.0).abs() < 0.05, "ratio {ratio}");
    }

    #[test]
    fn from_channels_pads_to_equal_length() {
        let ir = ImpulseResponse::from_channels(vec![vec![1.0, 0.5], vec![1.0]], 48_000);
        assert_eq!(ir.len(), 2);
        assert_eq!(ir.channel(1), &[1.0, 0.0]);
    }
}
