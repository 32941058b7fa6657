//! Output device sink

use dasp_graph::{Buffer, Input};
use rtrb::Producer;

use super::push_interleaved;
use crate::node::{AudioNode, ProcessContext};

/// Messages to control a [`DeviceSink`]
pub enum DeviceSinkMessage {
    /// Start feeding an output stream's ring buffer
    Attach {
        /// Interleaved samples consumed by the device callback
        producer: Producer<f32>,
        /// Channels the device expects per frame
        channels: usize,
    },
    /// Stop feeding; blocks are discarded until the next attach
    Detach,
}

/// A sink that hands the graph's output to a device stream.
///
/// The device callback runs on its own thread and drains the ring buffer this
/// node fills. Retargeting to another device is an attach message with the new
/// stream's producer; the previous producer is dropped.
pub struct DeviceSink {
    target: Option<(Producer<f32>, usize)>,
}

impl DeviceSink {
    /// A sink not yet bound to any device.
    pub fn new() -> Self {
        Self { target: None }
    }
}

impl Default for DeviceSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for DeviceSink {
    type Message = DeviceSinkMessage;

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        messages: impl Iterator<Item = DeviceSinkMessage>,
        inputs: &[Input],
        _outputs: &mut [Buffer],
    ) {
        for msg in messages {
            match msg {
                DeviceSinkMessage::Attach { producer, channels } => {
                    self.target = Some((producer, channels.max(1)));
                }
                DeviceSinkMessage::Detach => self.target = None,
            }
        }

        if let Some((producer, channels)) = &mut self.target {
            // Generating faster than the device consumes: skip this block
            push_interleaved(inputs, producer, *channels);
        }
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        1
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        0
    }
}
