//! Level and spectrum readouts for a polling UI.

use serde::Serialize;

use crate::nodes::AnalyserTap;

/// Normalized levels, each roughly in `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Levels {
    pub input: f32,
    pub output: f32,
}

/// The two analysis taps of the main graph.
///
/// Reads never allocate: spectra are computed into buffers the taps own and
/// copied into the caller's slice.
pub struct Meter {
    input: AnalyserTap,
    output: AnalyserTap,
}

impl Meter {
    pub(crate) fn new(input: AnalyserTap, output: AnalyserTap) -> Self {
        Self { input, output }
    }

    /// Drain both taps' queues into their analysis windows.
    pub(crate) fn pull(&mut self) {
        self.input.pull();
        self.output.pull();
    }

    /// Mean spectrum magnitude of each tap, scaled by 1/128 and capped at 1.
    pub fn levels(&mut self) -> Levels {
        Levels {
            input: self.input.level(),
            output: self.output.level(),
        }
    }

    /// Byte magnitudes of the output spectrum, one per bin.
    pub fn spectrum(&mut self, out: &mut [u8]) {
        self.output.byte_frequency_data(out);
    }

    /// Size of a full spectrum read.
    pub fn frequency_bin_count(&self) -> usize {
        self.output.frequency_bin_count()
    }
}
