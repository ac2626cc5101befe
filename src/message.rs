//! Control thread ⇄ render thread messaging.
//!
//! Topology and allocation-requiring mutations travel as [`ControlMessage`]
//! values over an unbounded channel the graph drains at the top of each
//! `run`, before the sink is pulled. Anything that needs heap storage is
//! built on the control thread and handed over whole; the render side only
//! swaps it in. Retired resources travel back over a second channel and are
//! dropped on the control thread. A third, bounded channel carries render
//! diagnostics out without ever blocking the audio thread.

use std::sync::Arc;

use crate::buffer::{AudioBuffer, Buffer};
use crate::connection::{ConnectionRef, ConnectionShared};
use crate::error::GraphError;
use crate::graph::{build_node, GraphProperties, Node, NodeId, Processor};
use crate::routing::Routing;
use crate::socket::{Socket, SocketId};

use crossbeam_channel::{Receiver, Sender};

/// Deferred mutations applied between vectors.
pub(crate) enum ControlMessage {
    SetRouting {
        source: SocketId,
        dest: SocketId,
        routing: Routing,
    },
    SocketMul {
        socket: SocketId,
        value: f32,
    },
    SocketAdd {
        socket: SocketId,
        value: f32,
    },
    SocketMuted {
        socket: SocketId,
        muted: bool,
    },
    SetNchannels {
        socket: SocketId,
        nchannels: usize,
        buffer: Buffer,
    },
    Connect {
        source: SocketId,
        dest: SocketId,
        routing: Routing,
        shared: Arc<ConnectionShared>,
    },
    Disconnect {
        source: SocketId,
        dest: SocketId,
    },
    AddNode {
        node: Box<Node>,
        sockets: Vec<Socket>,
    },
    RemoveNode {
        node: NodeId,
        replacement: Box<dyn Processor>,
    },
    SetRate {
        rate: f64,
    },
}

/// Resources the render thread has let go of, shipped back whole so their
/// destructors run on the control thread. The payloads are never read
/// again, only dropped.
#[allow(dead_code)]
pub(crate) enum Retired {
    Buffer(Buffer),
    Edge(crate::connection::Edge),
    Params(Arc<ConnectionShared>),
    Processor(Box<dyn Processor>),
    Sockets(Vec<Socket>),
}

/// Render-path anomalies, forwarded off-thread instead of propagating.
#[derive(Debug)]
pub enum RenderDiag {
    /// A deferred mutation needed storage the realtime side did not have.
    AllocationRefused { what: &'static str },
    /// A queued connect or routing update failed validation.
    Refused {
        source: SocketId,
        dest: SocketId,
        error: GraphError,
    },
    /// A MIDI socket dropped events this vector.
    MidiOverflow { socket: SocketId },
}

/// Control-thread companion of a running [`Graph`](crate::graph::Graph).
///
/// Obtained from `Graph::controller` before the graph moves into the audio
/// callback. One controller per graph: node and socket ids for deferred
/// `add_node` calls are assigned control-side, so a single mutating owner
/// keeps the two sides in step (the queue is single-producer by design).
pub struct GraphController {
    pub(crate) sender: Sender<ControlMessage>,
    pub(crate) retired: Receiver<Retired>,
    pub(crate) diags: Receiver<RenderDiag>,
    pub(crate) properties: GraphProperties,
    pub(crate) next_node: usize,
    pub(crate) next_socket: usize,
}

impl GraphController {
    /// Replace the routing of the edge between `source` and `dest`.
    pub fn reconnect(&self, source: SocketId, dest: SocketId, routing: Routing) {
        let _ = self.sender.send(ControlMessage::SetRouting {
            source,
            dest,
            routing,
        });
    }

    /// Connect two sockets while the graph is running.
    ///
    /// The edge parameters are allocated here and handed over; the returned
    /// handle is live immediately, though the edge only joins the pull once
    /// the render thread drains the queue.
    pub fn connect(&self, source: SocketId, dest: SocketId, routing: Routing) -> ConnectionRef {
        let shared = Arc::new(ConnectionShared::new());
        let _ = self.sender.send(ControlMessage::Connect {
            source,
            dest,
            routing,
            shared: shared.clone(),
        });
        ConnectionRef {
            source,
            dest,
            shared,
        }
    }

    pub fn disconnect(&self, source: SocketId, dest: SocketId) {
        let _ = self
            .sender
            .send(ControlMessage::Disconnect { source, dest });
    }

    /// Resize an audio socket. The replacement buffer is allocated here, on
    /// the control thread; the render side swaps it in between vectors.
    pub fn set_nchannels(&self, socket: SocketId, nchannels: usize) {
        let buffer = Buffer::Audio(AudioBuffer::new(nchannels, self.properties.vector));
        let _ = self.sender.send(ControlMessage::SetNchannels {
            socket,
            nchannels,
            buffer,
        });
    }

    /// Register a node while the graph is running. Sockets, buffers and
    /// pools are all built here; the render side only installs the slots.
    /// Returns the node id and its socket ids, in declaration order.
    pub fn add_node<P: Processor + 'static>(&mut self, processor: P) -> (NodeId, Vec<SocketId>) {
        let id = NodeId(self.next_node);
        let (node, sockets) = build_node(
            Box::new(processor),
            id,
            self.next_socket,
            Some(&self.properties),
        );
        let ids = (0..sockets.len())
            .map(|i| SocketId(self.next_socket + i))
            .collect();
        self.next_node += 1;
        self.next_socket += sockets.len();
        let _ = self.sender.send(ControlMessage::AddNode {
            node: Box::new(node),
            sockets,
        });
        (id, ids)
    }

    /// Retire a node: its edges are disconnected and its processor and
    /// buffers are shipped back here for destruction. The arena slot stays
    /// behind as an inert placeholder so ids remain stable.
    pub fn remove_node(&self, node: NodeId) {
        let _ = self.sender.send(ControlMessage::RemoveNode {
            node,
            replacement: Box::new(crate::graph::Null),
        });
    }

    /// Broadcast a sample-rate change to every node.
    pub fn set_rate(&mut self, rate: f64) {
        self.properties.rate = rate;
        let _ = self.sender.send(ControlMessage::SetRate { rate });
    }

    /// Drop every resource the render thread has retired. Returns how many
    /// were reclaimed. Call this on the host's own cadence.
    pub fn reclaim(&self) -> usize {
        self.retired.try_iter().count()
    }

    /// Drain pending render diagnostics.
    pub fn diagnostics(&self) -> Vec<RenderDiag> {
        self.diags.try_iter().collect()
    }
}
