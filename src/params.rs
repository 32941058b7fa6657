//! Effect parameters and the store holding the current snapshot.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::nodes::effect::MAX_FEEDBACK;

/// Bounds for the reverb length, in seconds.
pub const REVERB_DECAY_RANGE: (f32, f32) = (0.1, 10.0);
/// Bounds for the input and master gains.
pub const GAIN_RANGE: (f32, f32) = (0.0, 2.0);

/// The complete set of user-controlled effect values.
///
/// Always handled as a whole: a control change copies the previous snapshot,
/// overrides one field and submits the result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectParameters {
    /// Linear input trim, `[0, 2]`.
    pub input_gain: f32,
    /// Linear output level, `[0, 2]`.
    pub master_gain: f32,
    /// Reverb wet level, `[0, 1]`.
    pub reverb_mix: f32,
    /// Reverb impulse length in seconds. Applied by rebuilding the impulse.
    pub reverb_decay: f32,
    /// Delay time in seconds, `[0, max delay]`.
    pub delay_time: f32,
    /// Delay feedback, `[0, 0.95]`.
    pub delay_feedback: f32,
    /// Delay wet level, `[0, 1]`.
    pub delay_mix: f32,
    /// Silences the output without touching `master_gain`.
    pub is_muted: bool,
    /// Whether the monitor output is audible.
    pub monitoring_enabled: bool,
}

impl Default for EffectParameters {
    fn default() -> Self {
        Self {
            input_gain: 1.0,
            master_gain: 1.0,
            reverb_mix: 0.0,
            reverb_decay: 2.0,
            delay_time: 0.3,
            delay_feedback: 0.3,
            delay_mix: 0.0,
            is_muted: false,
            monitoring_enabled: false,
        }
    }
}

impl EffectParameters {
    /// Gain sent to the master stage: zero while muted.
    #[inline]
    pub fn effective_master_gain(&self) -> f32 {
        if self.is_muted {
            0.0
        } else {
            self.master_gain
        }
    }

    /// Copy with every field forced into its domain.
    ///
    /// Non-finite values fall back to the default for that field.
    pub fn sanitized(&self, max_delay_secs: f32) -> Self {
        let d = Self::default();
        let clamp = |v: f32, fallback: f32, lo: f32, hi: f32| {
            if v.is_finite() {
                v.clamp(lo, hi)
            } else {
                fallback.clamp(lo, hi)
            }
        };
        let max_delay = max_delay_secs.max(0.0);

        Self {
            input_gain: clamp(self.input_gain, d.input_gain, GAIN_RANGE.0, GAIN_RANGE.1),
            master_gain: clamp(self.master_gain, d.master_gain, GAIN_RANGE.0, GAIN_RANGE.1),
            reverb_mix: clamp(self.reverb_mix, d.reverb_mix, 0.0, 1.0),
            reverb_decay: clamp(self.reverb_decay, d.reverb_decay, REVERB_DECAY_RANGE.0, REVERB_DECAY_RANGE.1),
            delay_time: clamp(self.delay_time, d.delay_time, 0.0, max_delay),
            delay_feedback: clamp(self.delay_feedback, d.delay_feedback, 0.0, MAX_FEEDBACK),
            delay_mix: clamp(self.delay_mix, d.delay_mix, 0.0, 1.0),
            is_muted: self.is_muted,
            monitoring_enabled: self.monitoring_enabled,
        }
    }
}

/// Holds the current [`EffectParameters`] snapshot and tracks unsaved changes.
#[derive(Debug)]
pub struct ParameterStore {
    current: EffectParameters,
    max_delay_secs: f32,
    revision: u64,
    changed_at: Option<Instant>,
}

impl ParameterStore {
    /// Store starting from `initial` (sanitized).
    pub fn new(initial: EffectParameters, max_delay_secs: f32) -> Self {
        Self {
            current: initial.sanitized(max_delay_secs),
            max_delay_secs,
            revision: 0,
            changed_at: None,
        }
    }

    /// Replace the whole snapshot. Returns what was actually stored.
    pub fn set_all(&mut self, params: EffectParameters) -> EffectParameters {
        let clean = params.sanitized(self.max_delay_secs);
        if clean != params {
            warn!(?params, stored = ?clean, "parameters clamped to valid range");
        }
        self.current = clean;
        self.revision += 1;
        self.changed_at = Some(Instant::now());
        clean
    }

    /// Copy the current snapshot, let `f` override fields, then [`set_all`](Self::set_all).
    pub fn update(&mut self, f: impl FnOnce(&mut EffectParameters)) -> EffectParameters {
        let mut next = self.current;
        f(&mut next);
        self.set_all(next)
    }

    /// The current snapshot.
    #[inline]
    pub fn get(&self) -> EffectParameters {
        self.current
    }

    /// Number of snapshots submitted so far.
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether a change is waiting to be persisted.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.changed_at.is_some()
    }

    /// Snapshot to persist, once `debounce` has passed since the last change.
    pub fn take_pending(&mut self, now: Instant, debounce: Duration) -> Option<EffectParameters> {
        let changed_at = self.changed_at?;
        if now.saturating_duration_since(changed_at) < debounce {
            return None;
        }
        self.changed_at = None;
        Some(self.current)
    }
}
