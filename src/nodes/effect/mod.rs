//! Effect nodes - process audio from inputs to outputs

mod analyser;
mod convolver;
mod delay;
mod gain;

pub use analyser::{Analyser, AnalyserTap};
pub use convolver::{Convolver, ConvolverMessage, PartitionedImpulse, RetiredImpulses};
pub use delay::{DelayMessage, FeedbackDelay, MAX_FEEDBACK};
pub use gain::{Gain, GainMessage};
