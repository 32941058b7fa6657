//! Source reading another graph's stream tap

use dasp_graph::{Buffer, Input};

use crate::node::{AudioNode, ProcessContext};
use crate::resample::ResamplingReader;

/// Plays a [`StreamTap`](crate::nodes::StreamTap) subscription into a second graph.
///
/// This is the only link between the main graph and the monitor context: the
/// source owns a read-only copy of the final mix and nothing else.
pub struct StreamSource {
    reader: ResamplingReader,
}

impl StreamSource {
    pub fn new(reader: ResamplingReader) -> Self {
        Self { reader }
    }
}

impl AudioNode for StreamSource {
    type Message = ();

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        _inputs: &[Input],
        outputs: &mut [Buffer],
    ) {
        self.reader.fill(outputs);
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        2
    }
}
