//! The processing graph: node/socket/edge arenas and the per-vector pull.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::{AudioBuffer, Buffer, MidiBuffer, Pool, MIDI_EVENT_CAPACITY};
use crate::connection::{ConnectionRef, Edge, EdgeId};
use crate::error::GraphError;
use crate::message::{ControlMessage, GraphController, RenderDiag, Retired};
use crate::routing::Routing;
use crate::socket::{Polarity, Socket, SocketId, SocketRef, SocketSpec, SocketType};

use crossbeam_channel::{Receiver, Sender};

/// Arena id of a node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub(crate) usize);

/// How a node auto-wires its subnodes at `component_complete`.
///
/// `Downwards` chains the node's default outputs through its subnodes in
/// declaration order; the last subnode becomes the node's chain-out.
/// `Upwards` merges each subnode's chain-out into the node's default inputs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Upwards,
    Downwards,
}

impl Default for Dispatch {
    fn default() -> Self {
        Dispatch::Upwards
    }
}

/// Stream properties shared with every node at initialization.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GraphProperties {
    /// Sample rate in Hertz.
    pub rate: f64,
    /// Frames per render vector.
    pub vector: usize,
}

/// The render contract every processing unit implements.
///
/// `sockets` is called once at registration, on the control thread, and
/// fixes the node's i/o layout for its lifetime. `render` runs on the audio
/// thread once per vector with the node's input and output pools; it must
/// not allocate, block or panic.
pub trait Processor: Send {
    /// Declare the node's sockets, in declaration order.
    fn sockets(&self) -> Vec<SocketSpec>;

    /// Produce one vector of output from the pulled inputs.
    fn render(&mut self, inputs: &Pool, outputs: &mut Pool, nframes: usize);

    /// One-shot setup once the graph is complete. Runs off the audio thread;
    /// allocation is allowed here.
    fn initialize(&mut self, _properties: &GraphProperties) {}

    /// The stream sample rate changed.
    fn rate_changed(&mut self, _rate: f64) {}

    /// Short name used in log output.
    fn label(&self) -> &'static str {
        "node"
    }
}

/// Inert processor installed in the slot of a removed node.
pub(crate) struct Null;

impl Processor for Null {
    fn sockets(&self) -> Vec<SocketSpec> {
        Vec::new()
    }

    fn render(&mut self, _inputs: &Pool, _outputs: &mut Pool, _nframes: usize) {}

    fn label(&self) -> &'static str {
        "null"
    }
}

/// Node flags shared with control-thread [`NodeRef`] handles.
#[derive(Debug)]
pub struct NodeShared {
    active: AtomicBool,
    muted: AtomicBool,
}

impl NodeShared {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            muted: AtomicBool::new(false),
        }
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

/// Control-thread handle to a node's flags.
#[derive(Clone)]
pub struct NodeRef {
    pub(crate) id: NodeId,
    pub(crate) shared: Arc<NodeShared>,
}

impl NodeRef {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn active(&self) -> bool {
        self.shared.active()
    }

    pub fn muted(&self) -> bool {
        self.shared.muted()
    }

    /// An inactive node is skipped entirely: no pulls, no render, silent
    /// outputs.
    pub fn set_active(&self, active: bool) {
        self.shared.set_active(active);
    }

    /// A muted node still renders (and pulls) but its outputs are silenced.
    pub fn set_muted(&self, muted: bool) {
        self.shared.set_muted(muted);
    }
}

/// A node slot in the graph arena.
pub(crate) struct Node {
    pub label: &'static str,
    pub processor: Box<dyn Processor>,
    pub inputs: Vec<SocketId>,
    pub outputs: Vec<SocketId>,
    pub subnodes: Vec<NodeId>,
    pub parent: Option<NodeId>,
    pub dispatch: Dispatch,
    pub shared: Arc<NodeShared>,
    pub processed: bool,
    pub retired: bool,
    pub input_pool: Pool,
    pub output_pool: Pool,
}

/// Build a node slot and its socket slots from a processor's declaration.
///
/// With `properties` present (deferred registration on a running graph) the
/// buffers and pools are allocated here and `initialize` is called; during
/// the building phase both happen later, in `component_complete`.
pub(crate) fn build_node(
    mut processor: Box<dyn Processor>,
    id: NodeId,
    first_socket: usize,
    properties: Option<&GraphProperties>,
) -> (Node, Vec<Socket>) {
    let specs = processor.sockets();
    let mut sockets = Vec::with_capacity(specs.len());
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    for spec in &specs {
        let sid = SocketId(first_socket + sockets.len());
        let mut socket = Socket::new(id, spec);
        if let Some(properties) = properties {
            socket.buffer = allocate_buffer(spec.stype, spec.nchannels, properties.vector);
            socket.edges.reserve(BACKREF_SPARE);
        }
        match spec.polarity {
            Polarity::Input => inputs.push(sid),
            Polarity::Output => outputs.push(sid),
        }
        sockets.push(socket);
    }

    if let Some(properties) = properties {
        processor.initialize(properties);
    }

    let node = Node {
        label: processor.label(),
        input_pool: Pool::with_len(inputs.len()),
        output_pool: Pool::with_len(outputs.len()),
        processor,
        inputs,
        outputs,
        subnodes: Vec::new(),
        parent: None,
        dispatch: Dispatch::default(),
        shared: Arc::new(NodeShared::new()),
        processed: false,
        retired: false,
    };

    (node, sockets)
}

fn allocate_buffer(stype: SocketType, nchannels: usize, vector: usize) -> Buffer {
    if stype.is_midi() {
        Buffer::Midi(MidiBuffer::with_capacity(MIDI_EVENT_CAPACITY))
    } else {
        Buffer::Audio(AudioBuffer::new(nchannels, vector))
    }
}

/// Either end of a connect call: a socket directly, or a node whose default
/// socket of the matching type is resolved.
#[derive(Copy, Clone, Debug)]
pub enum Endpoint {
    Node(NodeId),
    Socket(SocketId),
}

impl From<NodeId> for Endpoint {
    fn from(id: NodeId) -> Self {
        Endpoint::Node(id)
    }
}

impl From<SocketId> for Endpoint {
    fn from(id: SocketId) -> Self {
        Endpoint::Socket(id)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Building,
    Ready,
}

// Headroom reserved at component_complete so deferred mutations can land
// without reallocating arena storage on the audio thread.
const NODE_SPARE: usize = 16;
const SOCKET_SPARE: usize = 64;
const EDGE_SPARE: usize = 64;
const BACKREF_SPARE: usize = 8;
const DIAG_CAPACITY: usize = 256;

/// The processing graph.
///
/// Owns every node, socket and edge in dense arena tables addressed by
/// stable ids. Built and completed on the control thread, then moved into
/// the audio callback; from that point the control thread speaks to it only
/// through the [`GraphController`] queue and the shared atomic parameter
/// handles.
pub struct Graph {
    nodes: Vec<Node>,
    sockets: Vec<Socket>,
    edges: Vec<Option<Edge>>,
    properties: GraphProperties,
    state: State,
    receiver: Receiver<ControlMessage>,
    sender: Sender<ControlMessage>,
    retired_tx: Sender<Retired>,
    retired_rx: Receiver<Retired>,
    diag_tx: Sender<RenderDiag>,
    diag_rx: Receiver<RenderDiag>,
}

impl Graph {
    pub fn new(rate: f64, vector: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (retired_tx, retired_rx) = crossbeam_channel::unbounded();
        let (diag_tx, diag_rx) = crossbeam_channel::bounded(DIAG_CAPACITY);

        Self {
            nodes: Vec::new(),
            sockets: Vec::new(),
            edges: Vec::new(),
            properties: GraphProperties { rate, vector },
            state: State::Building,
            receiver,
            sender,
            retired_tx,
            retired_rx,
            diag_tx,
            diag_rx,
        }
    }

    pub fn properties(&self) -> GraphProperties {
        self.properties
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    pub fn nnodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nconnections(&self) -> usize {
        self.edges.iter().filter(|e| e.is_some()).count()
    }

    /// Change the vector size. Building phase only; buffers are sized from
    /// it at `component_complete`.
    pub fn set_vector(&mut self, vector: usize) -> Result<(), GraphError> {
        if self.state == State::Ready {
            return Err(GraphError::AlreadyComplete);
        }
        self.properties.vector = vector;
        Ok(())
    }

    /// Change the sample rate and broadcast it to every node.
    pub fn set_rate(&mut self, rate: f64) {
        self.properties.rate = rate;
        for node in &mut self.nodes {
            if !node.retired {
                node.processor.rate_changed(rate);
            }
        }
    }

    // ---------------------------------------------------------------------
    // registration
    // ---------------------------------------------------------------------

    /// Register a node. Its sockets are materialized from the processor's
    /// declaration; buffers are allocated at `component_complete` (or right
    /// here when the graph is already complete but not yet handed off).
    pub fn add_node<P: Processor + 'static>(&mut self, processor: P) -> NodeId {
        let id = NodeId(self.nodes.len());
        let properties = match self.state {
            State::Building => None,
            State::Ready => Some(&self.properties),
        };
        let (node, sockets) = build_node(Box::new(processor), id, self.sockets.len(), properties);
        log::debug!("registering node {} '{}'", id.0, node.label);
        self.sockets.extend(sockets);
        self.nodes.push(node);
        id
    }

    /// Make `child` a subnode of `parent`, in dispatch order.
    pub fn append_subnode(&mut self, parent: NodeId, child: NodeId) -> Result<(), GraphError> {
        if self.state == State::Ready {
            return Err(GraphError::AlreadyComplete);
        }
        if parent.0 >= self.nodes.len() || child.0 >= self.nodes.len() {
            return Err(GraphError::NoSuchNode);
        }
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].subnodes.push(child);
        Ok(())
    }

    pub fn set_dispatch(&mut self, node: NodeId, dispatch: Dispatch) {
        if let Some(node) = self.nodes.get_mut(node.0) {
            node.dispatch = dispatch;
        }
    }

    // ---------------------------------------------------------------------
    // lookup
    // ---------------------------------------------------------------------

    pub fn socket(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(id.0)
    }

    /// The i-th input socket of `node`, in declaration order.
    pub fn input(&self, node: NodeId, i: usize) -> Option<SocketId> {
        self.nodes.get(node.0)?.inputs.get(i).copied()
    }

    /// The i-th output socket of `node`, in declaration order.
    pub fn output(&self, node: NodeId, i: usize) -> Option<SocketId> {
        self.nodes.get(node.0)?.outputs.get(i).copied()
    }

    pub fn socket_named(&self, node: NodeId, name: &str) -> Option<SocketId> {
        let node = self.nodes.get(node.0)?;
        node.inputs
            .iter()
            .chain(node.outputs.iter())
            .copied()
            .find(|&sid| self.sockets[sid.0].name == name)
    }

    /// The node's default socket of the given polarity and type.
    pub fn default_socket(
        &self,
        node: NodeId,
        polarity: Polarity,
        stype: SocketType,
    ) -> Result<SocketId, GraphError> {
        let node = self.nodes.get(node.0).ok_or(GraphError::NoSuchNode)?;
        let list = match polarity {
            Polarity::Input => &node.inputs,
            Polarity::Output => &node.outputs,
        };
        list.iter()
            .copied()
            .find(|&sid| {
                let socket = &self.sockets[sid.0];
                socket.is_default && socket.stype == stype
            })
            .ok_or(GraphError::NoDefaultSocket)
    }

    fn default_output_any(&self, node: NodeId) -> Result<SocketId, GraphError> {
        let node = self.nodes.get(node.0).ok_or(GraphError::NoSuchNode)?;
        node.outputs
            .iter()
            .copied()
            .find(|&sid| self.sockets[sid.0].is_default)
            .ok_or(GraphError::NoDefaultSocket)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0)?.parent
    }

    /// The logical output face of a subtree: the node itself under
    /// `Upwards`, else the last subnode's chain-out, recursively.
    pub fn chain_out(&self, id: NodeId) -> NodeId {
        let node = &self.nodes[id.0];
        match node.dispatch {
            Dispatch::Upwards => id,
            Dispatch::Downwards => match node.subnodes.last() {
                Some(&last) => self.chain_out(last),
                None => id,
            },
        }
    }

    /// True when an edge exists between the two sockets, either direction.
    pub fn connected(&self, a: SocketId, b: SocketId) -> bool {
        self.edges.iter().flatten().any(|e| {
            (e.source == a && e.dest == b) || (e.source == b && e.dest == a)
        })
    }

    /// True when any edge on `socket` touches a socket of `node`.
    pub fn connected_to_node(&self, socket: SocketId, node: NodeId) -> bool {
        self.edges.iter().flatten().any(|e| {
            (e.source == socket && self.sockets[e.dest.0].node == node)
                || (e.dest == socket && self.sockets[e.source.0].node == node)
        })
    }

    // ---------------------------------------------------------------------
    // shared-parameter handles
    // ---------------------------------------------------------------------

    pub fn node_ref(&self, id: NodeId) -> Option<NodeRef> {
        Some(NodeRef {
            id,
            shared: self.nodes.get(id.0)?.shared.clone(),
        })
    }

    pub fn socket_ref(&self, id: SocketId) -> Option<SocketRef> {
        Some(SocketRef {
            id,
            shared: self.sockets.get(id.0)?.shared.clone(),
            sender: self.sender.clone(),
        })
    }

    pub fn connection(&self, id: EdgeId) -> Option<ConnectionRef> {
        let edge = self.edges.get(id.0)?.as_ref()?;
        Some(ConnectionRef {
            source: edge.source,
            dest: edge.dest,
            shared: edge.shared.clone(),
        })
    }

    /// The control-thread companion. Create it once, after
    /// `component_complete` and before handing the graph to the driver.
    pub fn controller(&self) -> GraphController {
        GraphController {
            sender: self.sender.clone(),
            retired: self.retired_rx.clone(),
            diags: self.diag_rx.clone(),
            properties: self.properties,
            next_node: self.nodes.len(),
            next_socket: self.sockets.len(),
        }
    }

    // ---------------------------------------------------------------------
    // socket mutators (direct, control side)
    // ---------------------------------------------------------------------

    /// Set the socket's mul and propagate it to every touching edge.
    pub fn set_socket_mul(&mut self, id: SocketId, mul: f32) {
        if let Some(socket) = self.sockets.get(id.0) {
            socket.shared.set_mul(mul);
            for &eid in &socket.edges {
                if let Some(Some(edge)) = self.edges.get(eid.0) {
                    edge.shared.set_mul(mul);
                }
            }
        }
    }

    /// Set the socket's add and propagate it to every touching edge.
    pub fn set_socket_add(&mut self, id: SocketId, add: f32) {
        if let Some(socket) = self.sockets.get(id.0) {
            socket.shared.set_add(add);
            for &eid in &socket.edges {
                if let Some(Some(edge)) = self.edges.get(eid.0) {
                    edge.shared.set_add(add);
                }
            }
        }
    }

    /// Mute or unmute every edge touching the socket.
    pub fn set_socket_muted(&mut self, id: SocketId, muted: bool) {
        if let Some(socket) = self.sockets.get(id.0) {
            socket.shared.set_muted(muted);
            for &eid in &socket.edges {
                if let Some(Some(edge)) = self.edges.get(eid.0) {
                    edge.shared.set_muted(muted);
                }
            }
        }
    }

    /// Resize a socket. Building phase: takes effect at allocation. Ready
    /// phase (still control-side, before the first render): reallocates the
    /// buffer and refits the touching edges.
    pub fn set_nchannels(&mut self, id: SocketId, nchannels: usize) -> Result<(), GraphError> {
        if id.0 >= self.sockets.len() {
            return Err(GraphError::NoSuchSocket);
        }
        self.sockets[id.0].nchannels = nchannels;
        if self.state == State::Ready {
            let vector = self.properties.vector;
            let stype = self.sockets[id.0].stype;
            let old = std::mem::replace(
                &mut self.sockets[id.0].buffer,
                allocate_buffer(stype, nchannels, vector),
            );
            let _ = self.retired_tx.send(Retired::Buffer(old));
            self.refit_edges_of(id);
        }
        Ok(())
    }

    /// Node-level setters proxy the first output socket, the node's level
    /// fader.
    pub fn set_node_mul(&mut self, id: NodeId, mul: f32) {
        if let Some(&sid) = self.nodes.get(id.0).and_then(|n| n.outputs.first()) {
            self.set_socket_mul(sid, mul);
        }
    }

    pub fn set_node_add(&mut self, id: NodeId, add: f32) {
        if let Some(&sid) = self.nodes.get(id.0).and_then(|n| n.outputs.first()) {
            self.set_socket_add(sid, add);
        }
    }

    // ---------------------------------------------------------------------
    // connections
    // ---------------------------------------------------------------------

    /// Connect two endpoints with the default straight routing.
    pub fn connect(
        &mut self,
        from: impl Into<Endpoint>,
        to: impl Into<Endpoint>,
    ) -> Result<EdgeId, GraphError> {
        self.connect_routed(from, to, Routing::new())
    }

    /// Connect two endpoints with an explicit routing.
    pub fn connect_routed(
        &mut self,
        from: impl Into<Endpoint>,
        to: impl Into<Endpoint>,
        routing: Routing,
    ) -> Result<EdgeId, GraphError> {
        let (source, dest) = self.resolve_endpoints(from.into(), to.into())?;
        self.connect_sockets(source, dest, routing)
    }

    /// Replace the routing of an existing connection (or create it).
    pub fn reconnect(
        &mut self,
        from: impl Into<Endpoint>,
        to: impl Into<Endpoint>,
        routing: Routing,
    ) -> Result<EdgeId, GraphError> {
        self.connect_routed(from, to, routing)
    }

    /// Connect by polarity: if `socket` is an input the other socket feeds
    /// it, if it is an output it feeds the other socket.
    pub fn assign(&mut self, socket: SocketId, other: SocketId) -> Result<EdgeId, GraphError> {
        let polarity = self
            .sockets
            .get(socket.0)
            .ok_or(GraphError::NoSuchSocket)?
            .polarity;
        match polarity {
            Polarity::Input => self.connect_sockets(other, socket, Routing::new()),
            Polarity::Output => self.connect_sockets(socket, other, Routing::new()),
        }
    }

    /// Remove the connection between two endpoints.
    pub fn disconnect(
        &mut self,
        from: impl Into<Endpoint>,
        to: impl Into<Endpoint>,
    ) -> Result<(), GraphError> {
        let (source, dest) = self.resolve_endpoints(from.into(), to.into())?;
        let eid = self
            .find_edge(source, dest)
            .ok_or(GraphError::NoSuchSocket)?;
        self.remove_edge(eid);
        Ok(())
    }

    fn resolve_endpoints(
        &self,
        from: Endpoint,
        to: Endpoint,
    ) -> Result<(SocketId, SocketId), GraphError> {
        match (from, to) {
            (Endpoint::Socket(s), Endpoint::Socket(d)) => Ok((s, d)),
            (Endpoint::Node(n), Endpoint::Socket(d)) => {
                let stype = self
                    .sockets
                    .get(d.0)
                    .ok_or(GraphError::NoSuchSocket)?
                    .stype;
                Ok((self.default_socket(n, Polarity::Output, stype)?, d))
            }
            (Endpoint::Socket(s), Endpoint::Node(n)) => {
                let stype = self
                    .sockets
                    .get(s.0)
                    .ok_or(GraphError::NoSuchSocket)?
                    .stype;
                Ok((s, self.default_socket(n, Polarity::Input, stype)?))
            }
            (Endpoint::Node(a), Endpoint::Node(b)) => {
                let source = self.default_output_any(a)?;
                let stype = self.sockets[source.0].stype;
                Ok((source, self.default_socket(b, Polarity::Input, stype)?))
            }
        }
    }

    fn find_edge(&self, source: SocketId, dest: SocketId) -> Option<EdgeId> {
        self.edges.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|e| e.source == source && e.dest == dest)
                .map(|_| EdgeId(i))
        })
    }

    fn validate_connection(
        &self,
        source: SocketId,
        dest: SocketId,
        routing: &Routing,
    ) -> Result<(), GraphError> {
        let src = self.sockets.get(source.0).ok_or(GraphError::NoSuchSocket)?;
        let dst = self.sockets.get(dest.0).ok_or(GraphError::NoSuchSocket)?;

        if src.polarity != Polarity::Output || dst.polarity != Polarity::Input {
            return Err(GraphError::PolarityMismatch);
        }
        if src.stype != dst.stype {
            return Err(GraphError::TypeMismatch {
                src: src.stype,
                dest: dst.stype,
            });
        }
        if !src.stype.is_midi() {
            if let Some(channel) = routing.max_source_channel() {
                if channel as usize >= src.nchannels {
                    return Err(GraphError::ChannelOutOfRange {
                        channel,
                        nchannels: src.nchannels,
                    });
                }
            }
            if let Some(channel) = routing.max_dest_channel() {
                if channel as usize >= dst.nchannels {
                    return Err(GraphError::ChannelOutOfRange {
                        channel,
                        nchannels: dst.nchannels,
                    });
                }
            }
        }
        Ok(())
    }

    fn connect_sockets(
        &mut self,
        source: SocketId,
        dest: SocketId,
        routing: Routing,
    ) -> Result<EdgeId, GraphError> {
        self.validate_connection(source, dest, &routing)?;

        // a (source, dest) pair has at most one edge: reconnection updates
        // the routing in place
        if let Some(eid) = self.find_edge(source, dest) {
            if let Some(edge) = self.edges[eid.0].as_mut() {
                edge.routing = routing;
            }
            return Ok(eid);
        }

        let eid = EdgeId(self.edges.len());
        self.edges.push(Some(Edge::new(source, dest, routing)));
        log::debug!(
            "connected {}:{} -> {}:{}",
            self.nodes[self.sockets[source.0].node.0].label,
            self.sockets[source.0].name,
            self.nodes[self.sockets[dest.0].node.0].label,
            self.sockets[dest.0].name,
        );

        if self.state == State::Ready {
            self.finish_edge(eid);
        }
        Ok(eid)
    }

    /// Fix the channel count, seed the parameters from the socket defaults
    /// and register the back-references. Batched over all edges inside
    /// `component_complete`; called per edge for connections made after.
    fn finish_edge(&mut self, eid: EdgeId) {
        let (source, dest) = match &self.edges[eid.0] {
            Some(e) => (e.source, e.dest),
            None => return,
        };
        let nchannels = self.sockets[source.0]
            .nchannels
            .min(self.sockets[dest.0].nchannels);
        let mul = self.sockets[source.0].shared.mul() * self.sockets[dest.0].shared.mul();
        let add = self.sockets[source.0].shared.add() + self.sockets[dest.0].shared.add();
        let muted = self.sockets[source.0].shared.muted() || self.sockets[dest.0].shared.muted();

        if let Some(edge) = self.edges[eid.0].as_mut() {
            edge.nchannels = nchannels;
            edge.shared.set_mul(mul);
            edge.shared.set_add(add);
            edge.shared.set_muted(muted);
        }
        self.sockets[source.0].edges.push(eid);
        self.sockets[dest.0].edges.push(eid);
    }

    fn remove_edge(&mut self, eid: EdgeId) {
        if let Some(edge) = self.edges[eid.0].take() {
            self.sockets[edge.source.0].edges.retain(|&e| e != eid);
            self.sockets[edge.dest.0].edges.retain(|&e| e != eid);
            let _ = self.retired_tx.send(Retired::Edge(edge));
        }
    }

    fn refit_edges_of(&mut self, socket: SocketId) {
        for i in 0..self.edges.len() {
            let (source, dest) = match &self.edges[i] {
                Some(e) if e.source == socket || e.dest == socket => (e.source, e.dest),
                _ => continue,
            };
            let nchannels = self.sockets[source.0]
                .nchannels
                .min(self.sockets[dest.0].nchannels);
            if let Some(edge) = self.edges[i].as_mut() {
                edge.nchannels = nchannels;
            }
        }
    }

    // ---------------------------------------------------------------------
    // completion
    // ---------------------------------------------------------------------

    /// One-shot transition from building to running: auto-wire dispatch
    /// hierarchies, assert feedback placement on every cycle, register the
    /// connection back-references in one batch, allocate every socket
    /// buffer and node pool, and initialize the nodes.
    pub fn component_complete(&mut self) -> Result<(), GraphError> {
        if self.state == State::Ready {
            return Err(GraphError::AlreadyComplete);
        }

        self.wire_dispatch()?;
        self.check_cycles()?;

        // back-references are taken only now, once the edge table's storage
        // is final for the building phase
        for socket in &mut self.sockets {
            socket.edges.clear();
        }
        for i in 0..self.edges.len() {
            if self.edges[i].is_some() {
                self.finish_edge(EdgeId(i));
            }
        }

        let properties = self.properties;
        for socket in &mut self.sockets {
            socket.buffer = allocate_buffer(socket.stype, socket.nchannels, properties.vector);
            socket.edges.reserve(BACKREF_SPARE);
        }
        for node in &mut self.nodes {
            node.input_pool = Pool::with_len(node.inputs.len());
            node.output_pool = Pool::with_len(node.outputs.len());
            node.processor.initialize(&properties);
        }

        self.nodes.reserve(NODE_SPARE);
        self.sockets.reserve(SOCKET_SPARE);
        self.edges.reserve(EDGE_SPARE);

        self.state = State::Ready;
        log::debug!(
            "graph ready: {} nodes, {} connections, rate {} vector {}",
            self.nodes.len(),
            self.nconnections(),
            properties.rate,
            properties.vector
        );
        Ok(())
    }

    fn wire_dispatch(&mut self) -> Result<(), GraphError> {
        for i in 0..self.nodes.len() {
            let id = NodeId(i);
            let subnodes = self.nodes[i].subnodes.clone();
            if subnodes.is_empty() || self.nodes[i].retired {
                continue;
            }
            match self.nodes[i].dispatch {
                Dispatch::Downwards => {
                    self.connect(id, subnodes[0])?;
                    let mut prev = subnodes[0];
                    for &sub in &subnodes[1..] {
                        let from = self.chain_out(prev);
                        self.connect(from, sub)?;
                        prev = sub;
                    }
                }
                Dispatch::Upwards => {
                    for &sub in &subnodes {
                        let from = self.chain_out(sub);
                        self.connect(from, id)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Depth-first search over the pull relation, ignoring feedback edges.
    /// Any remaining cycle is a configuration error.
    fn check_cycles(&self) -> Result<(), GraphError> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        // upstream adjacency: dest node <- source node
        let mut upstream: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for edge in self.edges.iter().flatten() {
            if !edge.shared.feedback() {
                let from = self.sockets[edge.dest.0].node.0;
                let to = self.sockets[edge.source.0].node.0;
                upstream[from].push(to);
            }
        }

        fn visit(n: usize, upstream: &[Vec<usize>], colors: &mut [u8]) -> bool {
            match colors[n] {
                GRAY => return true,
                BLACK => return false,
                _ => {}
            }
            colors[n] = GRAY;
            for &up in &upstream[n] {
                if visit(up, upstream, colors) {
                    return true;
                }
            }
            colors[n] = BLACK;
            false
        }

        let mut colors = vec![WHITE; self.nodes.len()];
        for n in 0..self.nodes.len() {
            if visit(n, &upstream, &mut colors) {
                return Err(GraphError::FeedbackNotMarked);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // the hot path
    // ---------------------------------------------------------------------

    /// Render one vector from the sink's chain-out.
    ///
    /// Called by the audio thread once per period. Drains the deferred
    /// mutation queue first, then pulls the graph, then clears every node's
    /// processed latch. Never allocates. The rendered output stays readable
    /// through [`Graph::sink_output`] until the next run.
    pub fn run(&mut self, sink: NodeId, nframes: usize) -> Result<(), GraphError> {
        if self.state != State::Ready {
            return Err(GraphError::NotReady);
        }
        self.drain_messages();

        let nframes = nframes.min(self.properties.vector);
        let target = self.chain_out(sink);
        self.process_node(target, nframes);

        for node in &mut self.nodes {
            node.processed = false;
        }
        Ok(())
    }

    /// The default audio output buffer of the sink's chain-out, the frames
    /// the driver interleaves into its device buffer.
    pub fn sink_output(&self, sink: NodeId) -> Result<&AudioBuffer, GraphError> {
        let target = self.chain_out(sink);
        let out = self.default_socket(target, Polarity::Output, SocketType::Audio)?;
        self.sockets[out.0]
            .buffer
            .as_audio()
            .ok_or(GraphError::NotReady)
    }

    fn process_node(&mut self, id: NodeId, nframes: usize) {
        if self.nodes[id.0].processed {
            return;
        }
        // latched before pulling: a node entered again through an unmarked
        // cycle reads the previous vector instead of recursing forever
        self.nodes[id.0].processed = true;

        let active = self.nodes[id.0].shared.active() && !self.nodes[id.0].retired;
        let muted = self.nodes[id.0].shared.muted();

        if !active {
            self.silence_outputs(id, nframes);
            return;
        }

        // inputs start from silence each vector; edges accumulate into them
        for i in 0..self.nodes[id.0].inputs.len() {
            let sid = self.nodes[id.0].inputs[i];
            match &mut self.sockets[sid.0].buffer {
                Buffer::Audio(b) => b.silence(nframes),
                Buffer::Midi(m) => m.clear(),
                Buffer::Empty => {}
            }
        }

        // pull in socket declaration order, then edge insertion order
        for i in 0..self.nodes[id.0].inputs.len() {
            let sid = self.nodes[id.0].inputs[i];
            let mut e = 0;
            loop {
                let eid = match self.sockets[sid.0].edges.get(e) {
                    Some(&eid) => eid,
                    None => break,
                };
                self.pull(eid, nframes);
                e += 1;
            }
        }

        let Graph {
            nodes,
            sockets,
            diag_tx,
            ..
        } = self;
        let node = &mut nodes[id.0];

        for i in 0..node.inputs.len() {
            let sid = node.inputs[i];
            std::mem::swap(&mut sockets[sid.0].buffer, &mut node.input_pool.slots[i]);
        }
        for i in 0..node.outputs.len() {
            let sid = node.outputs[i];
            std::mem::swap(&mut sockets[sid.0].buffer, &mut node.output_pool.slots[i]);
        }

        // the producing side owns its event buffers: clearing them here (and
        // nowhere else) keeps fan-out consumers reading identical sequences
        for slot in &mut node.output_pool.slots {
            if let Buffer::Midi(m) = slot {
                m.clear();
            }
        }

        {
            let Node {
                processor,
                input_pool,
                output_pool,
                ..
            } = node;
            processor.render(input_pool, output_pool, nframes);
        }

        if muted {
            for slot in &mut node.output_pool.slots {
                match slot {
                    Buffer::Audio(b) => b.silence(nframes),
                    Buffer::Midi(m) => m.clear(),
                    Buffer::Empty => {}
                }
            }
        }

        for (i, slot) in node.output_pool.slots.iter().enumerate() {
            if let Buffer::Midi(m) = slot {
                if m.overflowed() > 0 {
                    let _ = diag_tx.try_send(RenderDiag::MidiOverflow {
                        socket: node.outputs[i],
                    });
                }
            }
        }

        for i in 0..node.inputs.len() {
            let sid = node.inputs[i];
            std::mem::swap(&mut sockets[sid.0].buffer, &mut node.input_pool.slots[i]);
        }
        for i in 0..node.outputs.len() {
            let sid = node.outputs[i];
            std::mem::swap(&mut sockets[sid.0].buffer, &mut node.output_pool.slots[i]);
        }
    }

    fn pull(&mut self, eid: EdgeId, nframes: usize) {
        let (source, dest, nchannels, routing, muted, active, feedback, mul, add) = {
            let edge = match &self.edges[eid.0] {
                Some(e) => e,
                None => return,
            };
            (
                edge.source,
                edge.dest,
                edge.nchannels,
                edge.routing.clone(),
                edge.shared.muted(),
                edge.shared.active(),
                edge.shared.feedback(),
                edge.shared.mul(),
                edge.shared.add(),
            )
        };

        if !active {
            return;
        }

        // feedback edges read the previous vector and never wake the source
        if !feedback {
            let src_node = self.sockets[source.0].node;
            self.process_node(src_node, nframes);
        }

        if muted {
            return;
        }

        let stype = self.sockets[source.0].stype;
        let (src, dst) = socket_pair_mut(&mut self.sockets, source, dest);

        if stype.is_midi() {
            if let (Some(sbuf), Some(dbuf)) = (src.buffer.as_midi(), dst.buffer.as_midi_mut()) {
                dbuf.extend_from(sbuf);
            }
            return;
        }

        let sbuf = match src.buffer.as_audio() {
            Some(b) => b,
            None => return,
        };
        let dbuf = match dst.buffer.as_audio_mut() {
            Some(b) => b,
            None => return,
        };

        if routing.is_null() {
            let nch = nchannels.min(sbuf.nchannels()).min(dbuf.nchannels());
            for c in 0..nch {
                let lane = &sbuf.channel(c)[..nframes];
                for (d, s) in dbuf.channel_mut(c)[..nframes].iter_mut().zip(lane) {
                    *d += *s * mul + add;
                }
            }
        } else {
            for i in 0..routing.ncables() {
                let (cs, cd) = routing.cable(i);
                // unmapped channels contribute nothing
                if (cs as usize) >= sbuf.nchannels() || (cd as usize) >= dbuf.nchannels() {
                    continue;
                }
                let lane = &sbuf.channel(cs as usize)[..nframes];
                for (d, s) in dbuf.channel_mut(cd as usize)[..nframes].iter_mut().zip(lane) {
                    *d += *s * mul + add;
                }
            }
        }
    }

    fn silence_outputs(&mut self, id: NodeId, nframes: usize) {
        for i in 0..self.nodes[id.0].outputs.len() {
            let sid = self.nodes[id.0].outputs[i];
            match &mut self.sockets[sid.0].buffer {
                Buffer::Audio(b) => b.silence(nframes),
                Buffer::Midi(m) => m.clear(),
                Buffer::Empty => {}
            }
        }
    }

    // ---------------------------------------------------------------------
    // deferred mutations
    // ---------------------------------------------------------------------

    fn drain_messages(&mut self) {
        loop {
            let message = match self.receiver.try_recv() {
                Ok(message) => message,
                Err(_) => break,
            };
            self.apply_message(message);
        }
    }

    fn apply_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::SetRouting {
                source,
                dest,
                routing,
            } => match self.find_edge(source, dest) {
                Some(eid) => {
                    if let Err(error) = self.validate_connection(source, dest, &routing) {
                        let _ = self
                            .diag_tx
                            .try_send(RenderDiag::Refused { source, dest, error });
                        return;
                    }
                    if let Some(edge) = self.edges[eid.0].as_mut() {
                        edge.routing = routing;
                    }
                }
                None => {
                    let _ = self.diag_tx.try_send(RenderDiag::Refused {
                        source,
                        dest,
                        error: GraphError::NoSuchSocket,
                    });
                }
            },
            ControlMessage::SocketMul { socket, value } => self.set_socket_mul(socket, value),
            ControlMessage::SocketAdd { socket, value } => self.set_socket_add(socket, value),
            ControlMessage::SocketMuted { socket, muted } => self.set_socket_muted(socket, muted),
            ControlMessage::SetNchannels {
                socket,
                nchannels,
                buffer,
            } => {
                if let Some(slot) = self.sockets.get_mut(socket.0) {
                    slot.nchannels = nchannels;
                    let old = std::mem::replace(&mut slot.buffer, buffer);
                    let _ = self.retired_tx.send(Retired::Buffer(old));
                    self.refit_edges_of(socket);
                } else {
                    let _ = self.retired_tx.send(Retired::Buffer(buffer));
                }
            }
            ControlMessage::Connect {
                source,
                dest,
                routing,
                shared,
            } => {
                if let Err(error) = self.validate_connection(source, dest, &routing) {
                    let _ = self
                        .diag_tx
                        .try_send(RenderDiag::Refused { source, dest, error });
                    let _ = self.retired_tx.send(Retired::Params(shared));
                    return;
                }
                if let Some(eid) = self.find_edge(source, dest) {
                    // reconnection: adopt the caller's handle so its
                    // parameter writes land on the live edge
                    if let Some(edge) = self.edges[eid.0].as_mut() {
                        edge.routing = routing;
                        let old = std::mem::replace(&mut edge.shared, shared);
                        let _ = self.retired_tx.send(Retired::Params(old));
                    }
                    return;
                }
                let room = self.edges.len() < self.edges.capacity()
                    && self.sockets[source.0].edges.len() < self.sockets[source.0].edges.capacity()
                    && self.sockets[dest.0].edges.len() < self.sockets[dest.0].edges.capacity();
                if !room {
                    let _ = self
                        .diag_tx
                        .try_send(RenderDiag::AllocationRefused { what: "connect" });
                    let _ = self.retired_tx.send(Retired::Params(shared));
                    return;
                }
                let eid = EdgeId(self.edges.len());
                let mut edge = Edge::new(source, dest, routing);
                edge.shared = shared;
                self.edges.push(Some(edge));
                self.finish_edge(eid);
            }
            ControlMessage::Disconnect { source, dest } => {
                if let Some(eid) = self.find_edge(source, dest) {
                    self.remove_edge(eid);
                }
            }
            ControlMessage::AddNode { node, sockets } => {
                let first_expected = self.sockets.len();
                let ids_line_up = sockets
                    .first()
                    .map_or(true, |s| s.node().0 == self.nodes.len())
                    && node
                        .inputs
                        .iter()
                        .chain(node.outputs.iter())
                        .map(|s| s.0)
                        .min()
                        .map_or(true, |first| first == first_expected);
                let room = self.nodes.len() < self.nodes.capacity()
                    && self.sockets.len() + sockets.len() <= self.sockets.capacity();
                if !ids_line_up || !room {
                    let _ = self
                        .diag_tx
                        .try_send(RenderDiag::AllocationRefused { what: "add_node" });
                    let node = *node;
                    let _ = self.retired_tx.send(Retired::Processor(node.processor));
                    let _ = self.retired_tx.send(Retired::Sockets(sockets));
                    return;
                }
                self.sockets.extend(sockets);
                self.nodes.push(*node);
            }
            ControlMessage::RemoveNode { node, replacement } => {
                if node.0 >= self.nodes.len() || self.nodes[node.0].retired {
                    return;
                }
                // detach every edge touching the node's sockets
                for list in 0..2 {
                    for i in 0.. {
                        let sid = {
                            let slot = &self.nodes[node.0];
                            let sockets = if list == 0 { &slot.inputs } else { &slot.outputs };
                            match sockets.get(i) {
                                Some(&sid) => sid,
                                None => break,
                            }
                        };
                        while let Some(&eid) = self.sockets[sid.0].edges.first() {
                            self.remove_edge(eid);
                        }
                        let old = std::mem::take(&mut self.sockets[sid.0].buffer);
                        let _ = self.retired_tx.send(Retired::Buffer(old));
                    }
                }
                let slot = &mut self.nodes[node.0];
                slot.retired = true;
                slot.shared.set_active(false);
                let old = std::mem::replace(&mut slot.processor, replacement);
                let _ = self.retired_tx.send(Retired::Processor(old));
            }
            ControlMessage::SetRate { rate } => {
                self.properties.rate = rate;
                for node in &mut self.nodes {
                    if !node.retired {
                        node.processor.rate_changed(rate);
                    }
                }
            }
        }
    }
}

fn socket_pair_mut(sockets: &mut [Socket], a: SocketId, b: SocketId) -> (&mut Socket, &mut Socket) {
    debug_assert_ne!(a.0, b.0);
    if a.0 < b.0 {
        let (lo, hi) = sockets.split_at_mut(b.0);
        (&mut lo[a.0], &mut hi[0])
    } else {
        let (lo, hi) = sockets.split_at_mut(a.0);
        let first = &mut hi[0];
        (first, &mut lo[b.0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MidiEvent;
    use crate::node::{Delay, SineOsc, Sink, Vca};
    use float_eq::assert_float_eq;
    use std::f64::consts::PI;
    use std::sync::atomic::AtomicUsize;

    /// Emits a fixed value on each of its channels.
    struct ConstSource {
        values: Vec<f32>,
    }

    impl ConstSource {
        fn new(values: &[f32]) -> Self {
            Self {
                values: values.to_vec(),
            }
        }
    }

    impl Processor for ConstSource {
        fn sockets(&self) -> Vec<SocketSpec> {
            vec![SocketSpec::audio_out("outputs", self.values.len()).as_default()]
        }

        fn render(&mut self, _inputs: &Pool, outputs: &mut Pool, nframes: usize) {
            let out = outputs.audio_mut(0);
            for (c, &value) in self.values.iter().enumerate() {
                for sample in &mut out.channel_mut(c)[..nframes] {
                    *sample = value;
                }
            }
        }

        fn label(&self) -> &'static str {
            "const"
        }
    }

    /// Mono constant source that counts its render invocations.
    struct CountingSource {
        value: f32,
        count: Arc<AtomicUsize>,
    }

    impl CountingSource {
        fn new(value: f32) -> (Self, Arc<AtomicUsize>) {
            let count = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    value,
                    count: count.clone(),
                },
                count,
            )
        }
    }

    impl Processor for CountingSource {
        fn sockets(&self) -> Vec<SocketSpec> {
            vec![SocketSpec::audio_out("outputs", 1).as_default()]
        }

        fn render(&mut self, _inputs: &Pool, outputs: &mut Pool, nframes: usize) {
            self.count.fetch_add(1, Ordering::SeqCst);
            let out = outputs.audio_mut(0);
            for sample in &mut out.channel_mut(0)[..nframes] {
                *sample = self.value;
            }
        }

        fn label(&self) -> &'static str {
            "counting"
        }
    }

    /// Emits 1.0 on the first frame of the stream, silence after.
    struct ImpulseSource {
        fired: bool,
    }

    impl Processor for ImpulseSource {
        fn sockets(&self) -> Vec<SocketSpec> {
            vec![SocketSpec::audio_out("outputs", 1).as_default()]
        }

        fn render(&mut self, _inputs: &Pool, outputs: &mut Pool, nframes: usize) {
            let out = outputs.audio_mut(0);
            out.silence(nframes);
            if !self.fired {
                out.channel_mut(0)[0] = 1.;
                self.fired = true;
            }
        }

        fn label(&self) -> &'static str {
            "impulse"
        }
    }

    /// Emits the same event sequence every vector.
    struct MidiEmitter {
        events: Vec<MidiEvent>,
    }

    impl Processor for MidiEmitter {
        fn sockets(&self) -> Vec<SocketSpec> {
            vec![SocketSpec::midi_out("midi_out").as_default()]
        }

        fn render(&mut self, _inputs: &Pool, outputs: &mut Pool, _nframes: usize) {
            let out = outputs.midi_mut(0);
            for &event in &self.events {
                out.push(event);
            }
        }

        fn label(&self) -> &'static str {
            "emitter"
        }
    }

    /// MIDI consumer with a silent audio output so it can sit in an
    /// audio pull chain.
    struct MidiProbe;

    impl Processor for MidiProbe {
        fn sockets(&self) -> Vec<SocketSpec> {
            vec![
                SocketSpec::midi_in("midi_in").as_default(),
                SocketSpec::audio_out("outputs", 1).as_default(),
            ]
        }

        fn render(&mut self, _inputs: &Pool, _outputs: &mut Pool, _nframes: usize) {}

        fn label(&self) -> &'static str {
            "probe"
        }
    }

    fn midi_input_events(graph: &Graph, node: NodeId) -> Vec<MidiEvent> {
        let sid = graph.input(node, 0).unwrap();
        graph
            .socket(sid)
            .unwrap()
            .buffer()
            .as_midi()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }

    #[test]
    fn test_sine_pass_through() {
        let mut graph = Graph::new(48_000., 4);
        let osc = graph.add_node(SineOsc::new(440.));
        let vca = graph.add_node(Vca::new());
        let sink = graph.add_node(Sink::new(1));
        graph.connect(osc, vca).unwrap();
        graph.connect(vca, sink).unwrap();
        graph.component_complete().unwrap();

        graph.run(sink, 4).unwrap();
        let out = graph.sink_output(sink).unwrap();
        for n in 0..4 {
            let expected = (2. * PI * 440. * n as f64 / 48_000.).sin() as f32;
            assert_float_eq!(out.channel(0)[n], expected, abs <= 1e-6);
        }
    }

    #[test]
    fn test_muted_edge_is_silent_but_pulls() {
        let mut graph = Graph::new(48_000., 4);
        let (source, count) = CountingSource::new(0.8);
        let src = graph.add_node(source);
        let sink = graph.add_node(Sink::new(1));
        let edge = graph.connect(src, sink).unwrap();
        graph.component_complete().unwrap();

        graph.connection(edge).unwrap().set_muted(true);
        graph.run(sink, 4).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let out = graph.sink_output(sink).unwrap();
        assert_float_eq!(out.channel(0), &[0.; 4][..], abs_all <= 0.);
    }

    #[test]
    fn test_inactive_edge_skips_upstream() {
        let mut graph = Graph::new(48_000., 4);
        let (source, count) = CountingSource::new(0.8);
        let src = graph.add_node(source);
        let sink = graph.add_node(Sink::new(1));
        let edge = graph.connect(src, sink).unwrap();
        graph.component_complete().unwrap();

        graph.connection(edge).unwrap().set_active(false);
        graph.run(sink, 4).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        let out = graph.sink_output(sink).unwrap();
        assert_float_eq!(out.channel(0), &[0.; 4][..], abs_all <= 0.);
    }

    #[test]
    fn test_two_input_mix() {
        let mut graph = Graph::new(1_000., 2);
        let osc_a = graph.add_node(SineOsc::new(100.));
        let osc_b = graph.add_node(SineOsc::new(200.));
        let sink = graph.add_node(Sink::new(1));
        graph.connect(osc_a, sink).unwrap();
        let edge_b = graph.connect(osc_b, sink).unwrap();
        graph.component_complete().unwrap();

        graph.connection(edge_b).unwrap().set_mul(0.5);
        graph.run(sink, 2).unwrap();

        let out = graph.sink_output(sink).unwrap();
        assert_float_eq!(out.channel(0)[0], 0., abs <= 1e-7);
        let expected = ((2. * PI * 0.1).sin() + 0.5 * (2. * PI * 0.2).sin()) as f32;
        assert_float_eq!(out.channel(0)[1], expected, abs <= 1e-5);
    }

    #[test]
    fn test_accumulation_is_sample_exact() {
        let mut graph = Graph::new(48_000., 4);
        let a = graph.add_node(ConstSource::new(&[0.25]));
        let b = graph.add_node(ConstSource::new(&[0.5]));
        let sink = graph.add_node(Sink::new(1));
        graph.connect(a, sink).unwrap();
        graph.connect(b, sink).unwrap();
        graph.component_complete().unwrap();

        graph.run(sink, 4).unwrap();
        let out = graph.sink_output(sink).unwrap();
        assert_float_eq!(out.channel(0), &[0.75; 4][..], abs_all <= 1e-7);
    }

    #[test]
    fn test_gain_and_offset() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[0.5]));
        let sink = graph.add_node(Sink::new(1));
        let edge = graph.connect(src, sink).unwrap();
        graph.component_complete().unwrap();

        let connection = graph.connection(edge).unwrap();
        connection.set_mul(2.);
        connection.set_add(0.25);
        graph.run(sink, 4).unwrap();

        let out = graph.sink_output(sink).unwrap();
        assert_float_eq!(out.channel(0), &[1.25; 4][..], abs_all <= 1e-7);
    }

    #[test]
    fn test_routing_permutation() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[1., 2.]));
        let sink = graph.add_node(Sink::new(2));
        graph
            .connect_routed(src, sink, Routing::from_pairs(&[(0, 1), (1, 0)]))
            .unwrap();
        graph.component_complete().unwrap();

        graph.run(sink, 4).unwrap();
        let out = graph.sink_output(sink).unwrap();
        assert_float_eq!(out.channel(0), &[2.; 4][..], abs_all <= 0.);
        assert_float_eq!(out.channel(1), &[1.; 4][..], abs_all <= 0.);
    }

    #[test]
    fn test_null_routing_drops_extra_channels() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[1., 2., 3.]));
        let sink = graph.add_node(Sink::new(2));
        graph.connect(src, sink).unwrap();
        graph.component_complete().unwrap();

        graph.run(sink, 4).unwrap();
        let out = graph.sink_output(sink).unwrap();
        assert_float_eq!(out.channel(0), &[1.; 4][..], abs_all <= 0.);
        assert_float_eq!(out.channel(1), &[2.; 4][..], abs_all <= 0.);
    }

    #[test]
    fn test_single_render_per_vector() {
        let mut graph = Graph::new(48_000., 4);
        let (source, count) = CountingSource::new(0.1);
        let src = graph.add_node(source);
        let vca_a = graph.add_node(Vca::new());
        let vca_b = graph.add_node(Vca::new());
        let sink = graph.add_node(Sink::new(1));
        graph.connect(src, vca_a).unwrap();
        graph.connect(src, vca_b).unwrap();
        graph.connect(vca_a, sink).unwrap();
        graph.connect(vca_b, sink).unwrap();
        graph.component_complete().unwrap();

        graph.run(sink, 4).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // both branches carried the same vector
        let out = graph.sink_output(sink).unwrap();
        assert_float_eq!(out.channel(0), &[0.2; 4][..], abs_all <= 1e-7);
    }

    #[test]
    fn test_processed_flags_reset_after_run() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[0.1]));
        let sink = graph.add_node(Sink::new(1));
        graph.connect(src, sink).unwrap();
        graph.component_complete().unwrap();

        graph.run(sink, 4).unwrap();
        assert!(graph.nodes.iter().all(|n| !n.processed));
    }

    #[test]
    fn test_feedback_breaks_cycles() {
        let mut graph = Graph::new(48_000., 4);
        let vca_a = graph.add_node(Vca::new());
        let vca_b = graph.add_node(Vca::new());
        let sink = graph.add_node(Sink::new(1));
        graph.connect(vca_a, vca_b).unwrap();
        let back = graph.connect(vca_b, vca_a).unwrap();
        graph.connect(vca_b, sink).unwrap();

        assert_eq!(graph.component_complete(), Err(GraphError::FeedbackNotMarked));

        graph.connection(back).unwrap().set_feedback(true);
        graph.component_complete().unwrap();
        graph.run(sink, 4).unwrap();
    }

    #[test]
    fn test_delay_feedback_reads_previous_vector() {
        let mut graph = Graph::new(48_000., 4);
        let impulse = graph.add_node(ImpulseSource { fired: false });
        let delay = graph.add_node(Delay::new(2));
        let sink = graph.add_node(Sink::new(1));
        graph.connect(impulse, delay).unwrap();
        let delay_out = graph.output(delay, 0).unwrap();
        let delay_in = graph.input(delay, 0).unwrap();
        let back = graph.connect(delay_out, delay_in).unwrap();
        graph.connection(back).unwrap().set_feedback(true);
        graph.connect(delay, sink).unwrap();
        graph.component_complete().unwrap();

        graph.run(sink, 4).unwrap();
        let first: Vec<f32> = graph.sink_output(sink).unwrap().channel(0).to_vec();
        assert_float_eq!(&first[..], &[0., 0., 1., 0.][..], abs_all <= 1e-7);

        // the echo re-enters through the feedback edge one vector late
        graph.run(sink, 4).unwrap();
        let second: Vec<f32> = graph.sink_output(sink).unwrap().channel(0).to_vec();
        assert_float_eq!(&second[..], &[0.; 4][..], abs_all <= 1e-7);

        graph.run(sink, 4).unwrap();
        let third: Vec<f32> = graph.sink_output(sink).unwrap().channel(0).to_vec();
        assert_float_eq!(&third[..], &[1., 0., 0., 0.][..], abs_all <= 1e-7);
    }

    #[test]
    fn test_midi_fan_out_copies_to_every_destination() {
        let mut graph = Graph::new(48_000., 4);
        let emitter = graph.add_node(MidiEmitter {
            events: vec![
                MidiEvent::new(0x90, 60, 100),
                MidiEvent::new(0x80, 60, 0),
            ],
        });
        let probe_a = graph.add_node(MidiProbe);
        let probe_b = graph.add_node(MidiProbe);
        let sink = graph.add_node(Sink::new(1));
        graph.connect(emitter, probe_a).unwrap();
        graph.connect(emitter, probe_b).unwrap();
        graph.connect(probe_a, sink).unwrap();
        graph.connect(probe_b, sink).unwrap();
        graph.component_complete().unwrap();

        graph.run(sink, 4).unwrap();
        let expected = vec![MidiEvent::new(0x90, 60, 100), MidiEvent::new(0x80, 60, 0)];
        assert_eq!(midi_input_events(&graph, probe_a), expected);
        assert_eq!(midi_input_events(&graph, probe_b), expected);

        // producer-side clearing: the next vector carries the same set, not
        // an accumulation
        graph.run(sink, 4).unwrap();
        assert_eq!(midi_input_events(&graph, probe_a), expected);
        assert_eq!(midi_input_events(&graph, probe_b), expected);
    }

    #[test]
    fn test_muted_midi_edge_carries_no_events() {
        let mut graph = Graph::new(48_000., 4);
        let emitter = graph.add_node(MidiEmitter {
            events: vec![MidiEvent::new(0x90, 60, 100)],
        });
        let probe = graph.add_node(MidiProbe);
        let sink = graph.add_node(Sink::new(1));
        let edge = graph.connect(emitter, probe).unwrap();
        graph.connect(probe, sink).unwrap();
        graph.component_complete().unwrap();

        graph.connection(edge).unwrap().set_muted(true);
        graph.run(sink, 4).unwrap();
        assert!(midi_input_events(&graph, probe).is_empty());
    }

    #[test]
    fn test_socket_mutators_broadcast_to_edges() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[1.]));
        let sink = graph.add_node(Sink::new(1));
        graph.connect(src, sink).unwrap();
        graph.component_complete().unwrap();

        let out_socket = graph.output(src, 0).unwrap();
        graph.set_socket_mul(out_socket, 0.5);
        graph.run(sink, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.5; 4][..],
            abs_all <= 1e-7
        );

        graph.set_socket_muted(out_socket, true);
        graph.run(sink, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.; 4][..],
            abs_all <= 0.
        );
    }

    #[test]
    fn test_socket_defaults_seed_connection() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[1.]));
        let sink = graph.add_node(Sink::new(1));
        let edge = graph.connect(src, sink).unwrap();

        let out_socket = graph.output(src, 0).unwrap();
        let in_socket = graph.input(sink, 0).unwrap();
        graph.set_socket_mul(out_socket, 0.5);
        graph.set_socket_mul(in_socket, 0.5);
        graph.set_socket_add(in_socket, 0.1);
        graph.component_complete().unwrap();

        // mul multiplies, add sums across the two endpoints
        let connection = graph.connection(edge).unwrap();
        assert_float_eq!(connection.mul(), 0.25, abs <= 1e-7);
        assert_float_eq!(connection.add(), 0.1, abs <= 1e-7);
    }

    #[test]
    fn test_node_flags() {
        let mut graph = Graph::new(48_000., 4);
        let (source, count) = CountingSource::new(0.5);
        let src = graph.add_node(source);
        let vca = graph.add_node(Vca::new());
        let sink = graph.add_node(Sink::new(1));
        graph.connect(src, vca).unwrap();
        graph.connect(vca, sink).unwrap();
        graph.component_complete().unwrap();

        // an inactive node renders nothing and pulls nothing
        let vca_ref = graph.node_ref(vca).unwrap();
        vca_ref.set_active(false);
        graph.run(sink, 4).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.; 4][..],
            abs_all <= 0.
        );

        // a muted node still pulls but outputs silence
        vca_ref.set_active(true);
        vca_ref.set_muted(true);
        graph.run(sink, 4).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.; 4][..],
            abs_all <= 0.
        );
    }

    #[test]
    fn test_connect_validation() {
        let mut graph = Graph::new(48_000., 4);
        let emitter = graph.add_node(MidiEmitter { events: vec![] });
        let src = graph.add_node(ConstSource::new(&[1.]));
        let sink = graph.add_node(Sink::new(1));

        let midi_out = graph.output(emitter, 0).unwrap();
        let audio_out = graph.output(src, 0).unwrap();
        let audio_in = graph.input(sink, 0).unwrap();

        assert!(matches!(
            graph.connect(midi_out, audio_in),
            Err(GraphError::TypeMismatch { .. })
        ));
        assert_eq!(
            graph.connect(audio_in, audio_out),
            Err(GraphError::PolarityMismatch)
        );
        assert!(matches!(
            graph.connect_routed(audio_out, audio_in, Routing::from_pairs(&[(5, 0)])),
            Err(GraphError::ChannelOutOfRange { .. })
        ));
    }

    #[test]
    fn test_reconnect_updates_instead_of_duplicating() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[1., 2.]));
        let sink = graph.add_node(Sink::new(2));
        let first = graph.connect(src, sink).unwrap();
        let second = graph
            .reconnect(src, sink, Routing::from_pairs(&[(0, 1), (1, 0)]))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(graph.nconnections(), 1);
    }

    #[test]
    fn test_assign_follows_polarity() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[1.]));
        let sink = graph.add_node(Sink::new(1));
        let out = graph.output(src, 0).unwrap();
        let input = graph.input(sink, 0).unwrap();

        // assigning from either end produces the same edge direction
        graph.assign(input, out).unwrap();
        assert!(graph.connected(out, input));
        graph.assign(out, input).unwrap();
        assert_eq!(graph.nconnections(), 1);
    }

    #[test]
    fn test_run_before_complete_is_refused() {
        let mut graph = Graph::new(48_000., 4);
        let sink = graph.add_node(Sink::new(1));
        assert_eq!(graph.run(sink, 4), Err(GraphError::NotReady));

        graph.component_complete().unwrap();
        assert_eq!(graph.component_complete(), Err(GraphError::AlreadyComplete));
        graph.run(sink, 4).unwrap();
    }

    #[test]
    fn test_downwards_dispatch_chains_subnodes() {
        let mut graph = Graph::new(48_000., 4);
        let parent = graph.add_node(Vca::new());
        let stage_a = graph.add_node(Vca::new());
        let stage_b = graph.add_node(Vca::new());
        graph.set_dispatch(parent, Dispatch::Downwards);
        graph.append_subnode(parent, stage_a).unwrap();
        graph.append_subnode(parent, stage_b).unwrap();

        let src = graph.add_node(ConstSource::new(&[0.5]));
        graph.connect(src, parent).unwrap();
        graph.component_complete().unwrap();

        assert_eq!(graph.chain_out(parent), stage_b);
        assert!(graph.connected(
            graph.output(parent, 0).unwrap(),
            graph.input(stage_a, 0).unwrap()
        ));
        assert!(graph.connected(
            graph.output(stage_a, 0).unwrap(),
            graph.input(stage_b, 0).unwrap()
        ));

        // running the parent renders through the whole chain
        graph.run(parent, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(parent).unwrap().channel(0),
            &[0.5; 4][..],
            abs_all <= 1e-7
        );
    }

    #[test]
    fn test_upwards_dispatch_merges_subnodes() {
        let mut graph = Graph::new(48_000., 4);
        let parent = graph.add_node(Vca::new());
        let voice_a = graph.add_node(ConstSource::new(&[0.25]));
        let voice_b = graph.add_node(ConstSource::new(&[0.5]));
        graph.append_subnode(parent, voice_a).unwrap();
        graph.append_subnode(parent, voice_b).unwrap();
        graph.component_complete().unwrap();

        assert_eq!(graph.chain_out(parent), parent);
        graph.run(parent, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(parent).unwrap().channel(0),
            &[0.75; 4][..],
            abs_all <= 1e-7
        );
    }

    #[test]
    fn test_deferred_socket_broadcast() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[1.]));
        let sink = graph.add_node(Sink::new(1));
        graph.connect(src, sink).unwrap();
        graph.component_complete().unwrap();

        let socket = graph.socket_ref(graph.output(src, 0).unwrap()).unwrap();
        socket.set_mul(0.25);

        // applied at the top of the next run
        graph.run(sink, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.25; 4][..],
            abs_all <= 1e-7
        );
    }

    #[test]
    fn test_deferred_topology_changes() {
        let mut graph = Graph::new(48_000., 4);
        let src = graph.add_node(ConstSource::new(&[0.5]));
        let sink = graph.add_node(Sink::new(1));
        graph.component_complete().unwrap();

        let out = graph.output(src, 0).unwrap();
        let input = graph.input(sink, 0).unwrap();
        let controller = graph.controller();

        controller.connect(out, input, Routing::new());
        graph.run(sink, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.5; 4][..],
            abs_all <= 1e-7
        );

        controller.disconnect(out, input);
        graph.run(sink, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.; 4][..],
            abs_all <= 0.
        );
        assert!(controller.reclaim() > 0);
    }

    #[test]
    fn test_deferred_node_registration_and_removal() {
        let mut graph = Graph::new(48_000., 4);
        let sink = graph.add_node(Sink::new(1));
        graph.component_complete().unwrap();

        let input = graph.input(sink, 0).unwrap();
        let mut controller = graph.controller();

        let (node, sockets) = controller.add_node(ConstSource::new(&[0.5]));
        controller.connect(sockets[0], input, Routing::new());
        graph.run(sink, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.5; 4][..],
            abs_all <= 1e-7
        );

        controller.remove_node(node);
        graph.run(sink, 4).unwrap();
        assert_float_eq!(
            graph.sink_output(sink).unwrap().channel(0),
            &[0.; 4][..],
            abs_all <= 0.
        );
        assert!(controller.reclaim() > 0);
    }

    #[test]
    fn test_set_rate_reaches_processors() {
        let mut graph = Graph::new(48_000., 4);
        let osc = graph.add_node(SineOsc::new(1_000.));
        let sink = graph.add_node(Sink::new(1));
        graph.connect(osc, sink).unwrap();
        graph.component_complete().unwrap();
        graph.set_rate(4_000.);

        graph.run(sink, 4).unwrap();
        let out = graph.sink_output(sink).unwrap();
        // a quarter of the rate per frame: 0, 1, 0, -1
        assert_float_eq!(out.channel(0)[1], 1., abs <= 1e-6);
        assert_float_eq!(out.channel(0)[3], -1., abs <= 1e-6);
    }
}
