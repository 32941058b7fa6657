//! Fan-out of the final mix to ring-buffer subscribers

use dasp_graph::{Buffer, Input};
use rtrb::Producer;

use super::push_interleaved;
use crate::node::{AudioNode, ProcessContext};

/// Number of subscriber slots on a [`StreamTap`].
pub const MAX_SUBSCRIBERS: usize = 4;

/// Messages to control a [`StreamTap`]
pub enum StreamTapMessage {
    /// Start copying stereo frames into `producer` through the given slot
    Subscribe(usize, Producer<f32>),
    /// Stop copying to the slot's subscriber
    Unsubscribe(usize),
}

/// Copies its input, interleaved stereo, to every subscribed ring buffer.
///
/// Subscribers only ever read; a slow one misses whole blocks without
/// affecting the others.
pub struct StreamTap {
    slots: [Option<Producer<f32>>; MAX_SUBSCRIBERS],
}

impl StreamTap {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
        }
    }
}

impl Default for StreamTap {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioNode for StreamTap {
    type Message = StreamTapMessage;

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        messages: impl Iterator<Item = StreamTapMessage>,
        inputs: &[Input],
        _outputs: &mut [Buffer],
    ) {
        for msg in messages {
            match msg {
                StreamTapMessage::Subscribe(slot, producer) => {
                    if let Some(s) = self.slots.get_mut(slot) {
                        *s = Some(producer);
                    }
                }
                StreamTapMessage::Unsubscribe(slot) => {
                    if let Some(s) = self.slots.get_mut(slot) {
                        *s = None;
                    }
                }
            }
        }

        for producer in self.slots.iter_mut().flatten() {
            push_interleaved(inputs, producer, 2);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AudioGraph;
    use crate::nodes::ConstantSource;
    use rtrb::RingBuffer;

    #[test]
    fn every_subscriber_gets_a_copy() {
        let mut g = AudioGraph::new(48_000);
        let src = g.add(ConstantSource::new(0.25));
        let mut tap = g.add(StreamTap::new());
        g.connect(src.id(), tap.id());
        g.add_terminal(tap.id());

        let (a_tx, a_rx) = RingBuffer::new(512);
        let (b_tx, b_rx) = RingBuffer::new(64);
        assert!(tap.send(StreamTapMessage::Subscribe(0, a_tx)).is_ok());
        assert!(tap.send(StreamTapMessage::Subscribe(3, b_tx)).is_ok());
        g.process();

        assert_eq!(a_rx.slots(), 128);
        // Too small for a block: skipped, never partially written
        assert_eq!(b_rx.slots(), 0);

        assert!(tap.send(StreamTapMessage::Unsubscribe(0)).is_ok());
        g.process();
        assert_eq!(a_rx.slots(), 128);
    }
}
