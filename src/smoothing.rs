//! Control-value smoothing.
//!
//! Every automatable control in the signal chain glides toward its target
//! through a [`Smoother`] configured by one [`SmoothingPolicy`]. Swapping the
//! policy changes the glide for all controls without touching call sites.

use serde::{Deserialize, Serialize};

/// How a control value travels to a new target.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SmoothingPolicy {
    /// Exponential approach: after `time_constant` seconds the value has
    /// covered ~63% of the distance to the target.
    Exponential {
        /// Time constant in seconds.
        time_constant: f32,
    },
    /// Constant-rate ramp reaching the target after `ramp` seconds.
    Linear {
        /// Ramp duration in seconds.
        ramp: f32,
    },
    /// Jump straight to the target.
    Instant,
}

impl Default for SmoothingPolicy {
    fn default() -> Self {
        SmoothingPolicy::Exponential { time_constant: 0.02 }
    }
}

/// A single smoothed control value, advanced once per sample.
#[derive(Clone, Debug)]
pub struct Smoother {
    current: f32,
    target: f32,
    policy: SmoothingPolicy,
    /// Exponential: per-sample retention. Linear: unused.
    coeff: f32,
    /// Linear: per-sample increment and samples left.
    step: f32,
    remaining: u32,
    sample_rate: f32,
}

impl Smoother {
    /// Create a smoother resting at `initial`.
    pub fn new(initial: f32, policy: SmoothingPolicy, sample_rate: u32) -> Self {
        let mut s = Self {
            current: initial,
            target: initial,
            policy,
            coeff: 0.0,
            step: 0.0,
            remaining: 0,
            sample_rate: sample_rate.max(1) as f32,
        };
        s.recalculate();
        s
    }

    fn recalculate(&mut self) {
        self.coeff = match self.policy {
            SmoothingPolicy::Exponential { time_constant } if time_constant > 0.0 => {
                let samples = time_constant * self.sample_rate;
                (-1.0 / samples).exp()
            }
            _ => 0.0,
        };
    }

    /// Start gliding toward `target`.
    ///
    /// A new target replaces the old one mid-glide; the value continues from
    /// wherever it currently is, so successive targets never snap.
    pub fn set_target(&mut self, target: f32) {
        self.target = target;
        match self.policy {
            SmoothingPolicy::Linear { ramp } if ramp > 0.0 => {
                let samples = (ramp * self.sample_rate).round().max(1.0);
                self.remaining = samples as u32;
                self.step = (target - self.current) / samples;
            }
            SmoothingPolicy::Exponential { .. } if self.coeff > 0.0 => {}
            _ => self.current = target,
        }
    }

    /// Jump to `value` with no glide.
    pub fn set_immediate(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.remaining = 0;
    }

    /// Advance one sample and return the new value.
    #[inline]
    pub fn next(&mut self) -> f32 {
        match self.policy {
            SmoothingPolicy::Exponential { .. } => {
                self.current = self.target + self.coeff * (self.current - self.target);
            }
            SmoothingPolicy::Linear { .. } => {
                if self.remaining > 0 {
                    self.remaining -= 1;
                    self.current = if self.remaining == 0 {
                        self.target
                    } else {
                        self.current + self.step
                    };
                }
            }
            SmoothingPolicy::Instant => self.current = self.target,
        }
        self.current
    }

    /// Current value without advancing.
    #[inline]
    pub fn value(&self) -> f32 {
        self.current
    }

    /// Last target set.
    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    /// Whether the value is within `epsilon` of the target.
    #[inline]
    pub fn is_settled(&self, epsilon: f32) -> bool {
        (self.current - self.target).abs() <= epsilon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn exponential_reaches_63_percent_after_one_time_constant() {
        let mut s = Smoother::new(0.0, SmoothingPolicy::Exponential { time_constant: 0.01 }, 48_000);
        s.set_target(1.0);
        for _ in 0..480 {
            s.next();
        }
        assert_abs_diff_eq!(s.value(), 1.0 - (-1.0f32).exp(), epsilon = 1e-3);
    }

    #[test]
    fn exponential_never_overshoots() {
        let mut s = Smoother::new(0.0, SmoothingPolicy::default(), 48_000);
        s.set_target(0.8);
        let mut last = 0.0;
        for _ in 0..48_000 {
            let v = s.next();
            assert!(v >= last && v <= 0.8);
            last = v;
        }
        assert!(s.is_settled(1e-4));
    }

    #[test]
    fn retarget_mid_glide_continues_from_current_value() {
        let mut s = Smoother::new(0.0, SmoothingPolicy::default(), 48_000);
        s.set_target(1.0);
        for _ in 0..100 {
            s.next();
        }
        let mid = s.value();
        s.set_target(0.0);
        let after = s.next();
        assert!((after - mid).abs() < 0.01, "jumped from {mid} to {after}");
    }

    #[test]
    fn linear_lands_exactly_on_target() {
        let mut s = Smoother::new(0.5, SmoothingPolicy::Linear { ramp: 0.001 }, 48_000);
        s.set_target(1.5);
        let mut values = Vec::new();
        for _ in 0..48 {
            values.push(s.next());
        }
        assert_eq!(*values.last().unwrap(), 1.5);
        assert!(values.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(s.next(), 1.5);
    }

    #[test]
    fn instant_policy_snaps() {
        let mut s = Smoother::new(0.0, SmoothingPolicy::Instant, 48_000);
        s.set_target(0.7);
        assert_eq!(s.value(), 0.7);
        assert_eq!(s.next(), 0.7);
    }

    #[test]
    fn policy_round_trips_through_json() {
        let json = serde_json::to_string(&SmoothingPolicy::Linear { ramp: 0.05 }).unwrap();
        assert_eq!(json, r#"{"kind":"linear","ramp":0.05}"#);
        let back: SmoothingPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SmoothingPolicy::Linear { ramp: 0.05 });
    }
}
