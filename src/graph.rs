//! Audio graph - owns nodes, edges and per-node message queues

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;

use dasp_graph::{Buffer, Input, NodeData, Processor};
use hashbrown::HashMap;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::node::{AudioNode, NodeId, ProcessContext};

/// Default capacity of each node's message queue.
pub const MESSAGE_QUEUE_SIZE: usize = 64;

/// A handle for sending messages to a node in an [`AudioGraph`].
///
/// Messages are buffered in a lock-free ring buffer and drained at the start
/// of the node's next block. If the buffer is full, [`Handle::send`] returns
/// `Err(msg)` with the message that couldn't be sent.
pub struct Handle<M: Send + 'static> {
    pub(crate) id: NodeId,
    pub(crate) sender: Producer<M>,
    pub(crate) _marker: PhantomData<M>,
}

impl<M: Send + 'static> Handle<M> {
    /// Send a message to the node (applied next process cycle).
    pub fn send(&mut self, msg: M) -> Result<(), M> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(v)| v)
    }

    /// The node this handle talks to.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<M: Send + 'static> core::fmt::Debug for Handle<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

// Type-erased wrapper so we can store heterogeneous nodes
trait ErasedNode: Send {
    fn process_erased(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]);
}

struct NodeWrapper<N: AudioNode> {
    node: N,
    receiver: Consumer<N::Message>,
}

impl<N: AudioNode> ErasedNode for NodeWrapper<N> {
    fn process_erased(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]) {
        // Split borrow to avoid conflict between receiver and node
        let receiver = &mut self.receiver;
        let node = &mut self.node;

        // Draining iterator straight off the consumer - no allocation
        let messages = core::iter::from_fn(|| receiver.pop().ok());
        node.process(ctx, messages, inputs, outputs);
    }
}

// Adapter for dasp_graph
struct DaspAdapter {
    node: Box<dyn ErasedNode>,
    ctx: ProcessContext,
}

impl dasp_graph::Node for DaspAdapter {
    fn process(&mut self, inputs: &[Input], outputs: &mut [Buffer]) {
        self.node.process_erased(&self.ctx, inputs, outputs);
    }
}

/// Terminal every leaf hangs off, so a single traversal reaches all of them.
struct Junction;

impl AudioNode for Junction {
    type Message = ();

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        _inputs: &[Input],
        _outputs: &mut [Buffer],
    ) {
    }

    fn num_inputs(&self) -> usize {
        usize::MAX
    }

    fn num_outputs(&self) -> usize {
        0
    }
}

type InnerGraph = StableGraph<NodeData<DaspAdapter>, ()>;

/// An audio processing graph at a fixed sample rate.
///
/// Edges are plain audio connections; a node reads the output buffers of every
/// node connected into it. The graph is rendered one block at a time by
/// [`process`](Self::process). Leaves that must run every block (sinks, analysis
/// taps) are registered with [`add_terminal`](Self::add_terminal).
///
/// Node indices are stable, so nodes can be removed while others keep their ids.
pub struct AudioGraph {
    graph: InnerGraph,
    processor: Processor<InnerGraph>,
    ctx: ProcessContext,

    node_indices: HashMap<NodeId, NodeIndex>,
    next_node_id: u32,

    junction: NodeIndex,
    blocks_processed: u64,
}

impl AudioGraph {
    /// Create a new graph with the given sample rate
    pub fn new(sample_rate: u32) -> Self {
        let ctx = ProcessContext::new(sample_rate);
        let mut graph = InnerGraph::with_capacity(64, 64);
        let junction = graph.add_node(NodeData::new(
            DaspAdapter {
                node: Box::new(NodeWrapper {
                    node: Junction,
                    receiver: RingBuffer::new(1).1,
                }),
                ctx,
            },
            Vec::new(),
        ));

        Self {
            graph,
            processor: Processor::with_capacity(64),
            ctx,
            node_indices: HashMap::new(),
            next_node_id: 0,
            junction,
            blocks_processed: 0,
        }
    }

    /// Sample rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.ctx.sample_rate
    }

    /// The context handed to every node of this graph.
    #[inline]
    pub fn context(&self) -> ProcessContext {
        self.ctx
    }

    /// Add a node, returns a handle for sending messages
    pub fn add<N: AudioNode>(&mut self, node: N) -> Handle<N::Message> {
        self.add_with_queue_size(node, MESSAGE_QUEUE_SIZE)
    }

    /// Add a node with a custom message queue size
    pub fn add_with_queue_size<N: AudioNode>(&mut self, node: N, queue_size: usize) -> Handle<N::Message> {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;

        let (producer, consumer) = RingBuffer::new(queue_size.max(1));

        let num_outputs = node.num_outputs();
        let wrapper = NodeWrapper { node, receiver: consumer };
        let adapter = DaspAdapter {
            node: Box::new(wrapper),
            ctx: self.ctx,
        };

        let buffers = (0..num_outputs).map(|_| Buffer::default()).collect();
        let idx = self.graph.add_node(NodeData::new(adapter, buffers));
        self.node_indices.insert(id, idx);

        Handle {
            id,
            sender: producer,
            _marker: PhantomData,
        }
    }

    /// Connect output of `from` to input of `to`.
    ///
    /// Returns `false` if either node is unknown. Connecting twice is a no-op.
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> bool {
        let (Some(&from_idx), Some(&to_idx)) = (self.node_indices.get(&from), self.node_indices.get(&to)) else {
            return false;
        };
        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, ());
        }
        true
    }

    /// Remove the edge from `from` to `to`. Returns whether an edge was removed.
    pub fn disconnect(&mut self, from: NodeId, to: NodeId) -> bool {
        let (Some(&from_idx), Some(&to_idx)) = (self.node_indices.get(&from), self.node_indices.get(&to)) else {
            return false;
        };
        match self.graph.find_edge(from_idx, to_idx) {
            Some(edge) => self.graph.remove_edge(edge).is_some(),
            None => false,
        }
    }

    /// Whether `from` currently feeds `to`.
    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        match (self.node_indices.get(&from), self.node_indices.get(&to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Make `id` a leaf that is rendered every block.
    pub fn add_terminal(&mut self, id: NodeId) -> bool {
        match self.node_indices.get(&id) {
            Some(&idx) => {
                if self.graph.find_edge(idx, self.junction).is_none() {
                    self.graph.add_edge(idx, self.junction, ());
                }
                true
            }
            None => false,
        }
    }

    /// Remove a node and all of its edges.
    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.node_indices.remove(&id) {
            Some(idx) => self.graph.remove_node(idx).is_some(),
            None => false,
        }
    }

    /// Whether `id` is part of this graph.
    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.node_indices.contains_key(&id)
    }

    /// Number of nodes added through [`add`](Self::add) that are still present.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_indices.len()
    }

    /// Number of connections, excluding terminal registrations.
    pub fn edge_count(&self) -> usize {
        let terminals = self
            .graph
            .neighbors_directed(self.junction, petgraph::Direction::Incoming)
            .count();
        self.graph.edge_count() - terminals
    }

    /// Blocks rendered so far.
    #[inline]
    pub fn blocks_processed(&self) -> u64 {
        self.blocks_processed
    }

    /// Process one block of audio through the graph
    pub fn process(&mut self) {
        self.processor.process(&mut self.graph, self.junction);
        self.blocks_processed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Gain, GainMessage};
    use crate::smoothing::SmoothingPolicy;

    #[test]
    fn connect_and_disconnect_round_trip() {
        let mut g = AudioGraph::new(48_000);
        let a = g.add(Gain::new(1.0, SmoothingPolicy::Instant, 48_000));
        let b = g.add(Gain::new(1.0, SmoothingPolicy::Instant, 48_000));

        assert!(g.connect(a.id(), b.id()));
        assert!(g.connect(a.id(), b.id()));
        assert_eq!(g.edge_count(), 1);
        assert!(g.is_connected(a.id(), b.id()));

        assert!(g.disconnect(a.id(), b.id()));
        assert!(!g.disconnect(a.id(), b.id()));
        assert!(!g.is_connected(a.id(), b.id()));
    }

    #[test]
    fn removed_nodes_leave_other_ids_valid() {
        let mut g = AudioGraph::new(48_000);
        let a = g.add(Gain::new(1.0, SmoothingPolicy::Instant, 48_000));
        let b = g.add(Gain::new(1.0, SmoothingPolicy::Instant, 48_000));
        let mut c = g.add(Gain::new(1.0, SmoothingPolicy::Instant, 48_000));
        g.connect(b.id(), c.id());
        g.add_terminal(c.id());

        assert!(g.remove(a.id()));
        assert!(!g.contains(a.id()));
        assert!(g.is_connected(b.id(), c.id()));
        assert_eq!(g.node_count(), 2);

        c.send(GainMessage::SetTarget(0.5)).unwrap();
        g.process();
        assert_eq!(g.blocks_processed(), 1);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let mut g = AudioGraph::new(48_000);
        let a = g.add(Gain::new(1.0, SmoothingPolicy::Instant, 48_000));
        g.remove(a.id());
        assert!(!g.connect(a.id(), a.id()));
        assert!(!g.add_terminal(a.id()));
    }
}
