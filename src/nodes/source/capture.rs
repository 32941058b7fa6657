//! Microphone capture source

use dasp_graph::{Buffer, Input};

use crate::node::{AudioNode, ProcessContext};
use crate::nodes::silence;
use crate::resample::ResamplingReader;

/// Messages to control a [`CaptureSource`]
pub enum CaptureMessage {
    /// Start reading from a newly opened capture stream
    Attach(ResamplingReader),
    /// Stop reading; the source goes silent until the next attach
    Release,
}

/// Feeds samples from a capture stream into the graph.
///
/// The stream is read through a [`ResamplingReader`], so a device running at a
/// different rate than the graph, or with a single channel, still produces
/// stereo at the graph rate. Without a stream attached the source is silent.
pub struct CaptureSource {
    reader: Option<ResamplingReader>,
}

impl CaptureSource {
    /// A source with nothing attached yet.
    pub fn new() -> Self {
        Self { reader: None }
    }
}

impl Default for CaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for CaptureSource {
    type Message = CaptureMessage;

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        messages: impl Iterator<Item = CaptureMessage>,
        _inputs: &[Input],
        outputs: &mut [Buffer],
    ) {
        for msg in messages {
            match msg {
                CaptureMessage::Attach(reader) => self.reader = Some(reader),
                CaptureMessage::Release => self.reader = None,
            }
        }

        match &mut self.reader {
            Some(reader) => {
                reader.fill(outputs);
            }
            None => silence(outputs),
        }
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        2
    }
}
