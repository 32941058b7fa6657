//! Source nodes - generate audio with no audio inputs

mod capture;
mod stream_source;
mod test_tone;

pub use capture::{CaptureMessage, CaptureSource};
pub use stream_source::StreamSource;
pub use test_tone::{TestTone, ToneSettings};
