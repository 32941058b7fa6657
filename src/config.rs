//! Engine configuration.
//!
//! Everything here is fixed for the lifetime of an [`Engine`](crate::Engine).
//! Runtime-adjustable values live in [`EffectParameters`](crate::EffectParameters).

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::nodes::ToneSettings;
use crate::smoothing::SmoothingPolicy;

/// Analysis tap settings, mirroring a classic analyser's knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnalyserConfig {
    /// FFT length; rounded up to a power of two.
    pub fft_size: usize,
    /// Temporal smoothing between reads, 0 (none) to 1 (frozen).
    pub smoothing: f32,
    /// Level mapped to byte 0.
    pub min_decibels: f32,
    /// Level mapped to byte 255.
    pub max_decibels: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

/// Reverb impulse generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReverbConfig {
    /// Exponent of the `(1 - i/len)` envelope.
    pub decay_exponent: f32,
    /// Seed for the noise; `None` draws from the OS.
    pub seed: Option<u64>,
    /// Scale the response to a fixed loudness.
    pub normalize: bool,
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            decay_exponent: 2.0,
            seed: None,
            normalize: true,
        }
    }
}

/// Fixed configuration for an engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Rate for the main context; `None` takes the host's default.
    pub sample_rate: Option<u32>,
    /// Glide applied to every automatable control.
    pub smoothing: SmoothingPolicy,
    pub analyser: AnalyserConfig,
    pub reverb: ReverbConfig,
    /// Longest delay time, in seconds; sizes the delay line.
    pub max_delay_secs: f32,
    pub test_tone: ToneSettings,
    /// Blocks a stream element buffers before it starts playing.
    pub element_jitter_blocks: usize,
    /// Capture backlog above which the oldest input is dropped, in seconds.
    pub capture_max_backlog_secs: f32,
    /// How long a capture request may stay unanswered before it counts as denied.
    /// Passed to the host with every capture request.
    #[serde(with = "millis")]
    pub permission_timeout: Duration,
    /// Delay between a parameter change and its persistence.
    #[serde(with = "millis")]
    pub persist_debounce: Duration,
    /// Blocks rendered ahead of wall-clock time by [`Engine::catch_up`](crate::Engine::catch_up).
    pub lookahead_blocks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: None,
            smoothing: SmoothingPolicy::default(),
            analyser: AnalyserConfig::default(),
            reverb: ReverbConfig::default(),
            max_delay_secs: 2.0,
            test_tone: ToneSettings::default(),
            element_jitter_blocks: 4,
            capture_max_backlog_secs: 0.2,
            permission_timeout: Duration::from_secs(10),
            persist_debounce: Duration::from_millis(250),
            lookahead_blocks: 4,
        }
    }
}

mod millis {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"sampleRate":44100,"analyser":{"fftSize":512},"persistDebounce":50}"#).unwrap();
        assert_eq!(config.sample_rate, Some(44_100));
        assert_eq!(config.analyser.fft_size, 512);
        assert_eq!(config.analyser.smoothing, 0.8);
        assert_eq!(config.persist_debounce, Duration::from_millis(50));
        assert_eq!(config.max_delay_secs, 2.0);
    }

    #[test]
    fn round_trips() {
        let config = EngineConfig {
            smoothing: SmoothingPolicy::Linear { ramp: 0.03 },
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
