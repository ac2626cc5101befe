//! Typed input/output ports on nodes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::graph::NodeId;
use crate::message::ControlMessage;
use crate::AtomicF32;

use crossbeam_channel::Sender;

/// Signal direction of a socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Polarity {
    Output,
    Input,
}

/// The signal type a socket carries.
///
/// `Audio` is a channel-major frame matrix; `Midi10` a per-vector event
/// sequence. The remaining types are single-channel control lanes sharing
/// the audio sample path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketType {
    Audio,
    Midi10,
    Integer,
    FloatingPoint,
    Cv,
    Gate,
    Trigger,
}

impl SocketType {
    pub fn is_midi(self) -> bool {
        self == SocketType::Midi10
    }

    /// Single-channel control lanes (everything but audio and MIDI).
    pub fn is_control(self) -> bool {
        !matches!(self, SocketType::Audio | SocketType::Midi10)
    }
}

/// Declarative description of one socket, returned by
/// [`Processor::sockets`](crate::graph::Processor::sockets).
///
/// ```
/// use patchbay::socket::SocketSpec;
///
/// let spec = SocketSpec::audio_in("inputs", 2).as_default();
/// assert_eq!(spec.nchannels, 2);
/// assert!(spec.is_default);
/// ```
#[derive(Clone, Debug)]
pub struct SocketSpec {
    pub name: &'static str,
    pub polarity: Polarity,
    pub stype: SocketType,
    pub nchannels: usize,
    pub is_default: bool,
}

impl SocketSpec {
    pub fn new(
        name: &'static str,
        polarity: Polarity,
        stype: SocketType,
        nchannels: usize,
    ) -> Self {
        // control lanes are single-channel by definition
        let nchannels = if stype.is_control() { 1 } else { nchannels };
        Self {
            name,
            polarity,
            stype,
            nchannels,
            is_default: false,
        }
    }

    pub fn audio_in(name: &'static str, nchannels: usize) -> Self {
        Self::new(name, Polarity::Input, SocketType::Audio, nchannels)
    }

    pub fn audio_out(name: &'static str, nchannels: usize) -> Self {
        Self::new(name, Polarity::Output, SocketType::Audio, nchannels)
    }

    pub fn midi_in(name: &'static str) -> Self {
        Self::new(name, Polarity::Input, SocketType::Midi10, 0)
    }

    pub fn midi_out(name: &'static str) -> Self {
        Self::new(name, Polarity::Output, SocketType::Midi10, 0)
    }

    pub fn control_in(name: &'static str) -> Self {
        Self::new(name, Polarity::Input, SocketType::Cv, 1)
    }

    pub fn control_out(name: &'static str) -> Self {
        Self::new(name, Polarity::Output, SocketType::Cv, 1)
    }

    pub fn with_type(mut self, stype: SocketType) -> Self {
        self.stype = stype;
        self
    }

    /// Mark this socket as the node's default for its polarity and type.
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Per-socket scalar defaults, shared with the control thread.
///
/// Writing through a [`SocketRef`] broadcasts to every edge touching the
/// socket (the broadcast itself rides the deferred queue so it serializes
/// with topology changes).
#[derive(Debug)]
pub struct SocketShared {
    mul: AtomicF32,
    add: AtomicF32,
    muted: AtomicBool,
}

impl SocketShared {
    pub(crate) fn new() -> Self {
        Self {
            mul: AtomicF32::new(1.),
            add: AtomicF32::new(0.),
            muted: AtomicBool::new(false),
        }
    }

    pub fn mul(&self) -> f32 {
        self.mul.load()
    }

    pub fn add(&self) -> f32 {
        self.add.load()
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_mul(&self, mul: f32) {
        self.mul.store(mul);
    }

    pub(crate) fn set_add(&self, add: f32) {
        self.add.store(add);
    }

    pub(crate) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

/// Arena id of a socket.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SocketId(pub(crate) usize);

/// A socket slot in the graph arena.
///
/// Owned by exactly one node for the node's lifetime; the buffer exists
/// from `component_complete` until teardown. Connection back-references are
/// registered in one batch at `component_complete`.
#[derive(Debug)]
pub struct Socket {
    pub(crate) name: &'static str,
    pub(crate) node: NodeId,
    pub(crate) polarity: Polarity,
    pub(crate) stype: SocketType,
    pub(crate) nchannels: usize,
    pub(crate) is_default: bool,
    pub(crate) shared: Arc<SocketShared>,
    pub(crate) edges: Vec<crate::connection::EdgeId>,
    pub(crate) buffer: Buffer,
}

impl Socket {
    pub(crate) fn new(node: NodeId, spec: &SocketSpec) -> Self {
        Self {
            name: spec.name,
            node,
            polarity: spec.polarity,
            stype: spec.stype,
            nchannels: spec.nchannels,
            is_default: spec.is_default,
            shared: Arc::new(SocketShared::new()),
            edges: Vec::new(),
            buffer: Buffer::Empty,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn socket_type(&self) -> SocketType {
        self.stype
    }

    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// The socket's buffer. Empty until graph allocation; between runs it
    /// holds the last vector this socket produced or consumed.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

/// Control-thread handle to a socket's scalar parameters.
///
/// Obtained from [`Graph::socket_ref`](crate::graph::Graph::socket_ref)
/// before the graph is handed to the audio driver. Setters enqueue a
/// broadcast applied at the top of the next `run`.
#[derive(Clone)]
pub struct SocketRef {
    pub(crate) id: SocketId,
    pub(crate) shared: Arc<SocketShared>,
    pub(crate) sender: Sender<ControlMessage>,
}

impl SocketRef {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn mul(&self) -> f32 {
        self.shared.mul()
    }

    pub fn add(&self) -> f32 {
        self.shared.add()
    }

    pub fn muted(&self) -> bool {
        self.shared.muted()
    }

    /// Replace the mul of every edge touching this socket.
    pub fn set_mul(&self, mul: f32) {
        let _ = self.sender.send(ControlMessage::SocketMul {
            socket: self.id,
            value: mul,
        });
    }

    /// Replace the add of every edge touching this socket.
    pub fn set_add(&self, add: f32) {
        let _ = self.sender.send(ControlMessage::SocketAdd {
            socket: self.id,
            value: add,
        });
    }

    /// Mute or unmute every edge touching this socket.
    pub fn set_muted(&self, muted: bool) {
        let _ = self.sender.send(ControlMessage::SocketMuted {
            socket: self.id,
            muted,
        });
    }
}
