//! Error types surfaced to the control thread.
//!
//! Construction and `component_complete` failures are returned to the caller;
//! the render path never propagates errors (see [`crate::message::RenderDiag`]
//! for the off-thread diagnostic channel).

use crate::socket::SocketType;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// Attempted to connect two sockets of the same polarity, or swapped
    /// source and destination.
    #[error("connections run from an output socket to an input socket")]
    PolarityMismatch,

    /// The two endpoint sockets carry different signal types.
    #[error("socket types do not match: {src:?} -> {dest:?}")]
    TypeMismatch {
        src: SocketType,
        dest: SocketType,
    },

    /// A routing cable references a channel neither endpoint has.
    #[error("routing references channel {channel}, socket has {nchannels}")]
    ChannelOutOfRange { channel: u8, nchannels: usize },

    /// `run` was invoked before `component_complete`.
    #[error("graph is not ready, call component_complete first")]
    NotReady,

    /// A building-phase operation was invoked on a completed graph.
    #[error("graph is already complete")]
    AlreadyComplete,

    /// A deferred mutation needed storage the realtime side does not have.
    #[error("mutation refused, no spare capacity on the realtime side")]
    AllocationRefused,

    /// A cycle exists in the pull graph and no edge on it carries the
    /// feedback flag.
    #[error("graph contains a cycle with no feedback connection")]
    FeedbackNotMarked,

    /// A socket id did not resolve, or no edge exists between the sockets.
    #[error("no such socket")]
    NoSuchSocket,

    /// A node id did not resolve.
    #[error("no such node")]
    NoSuchNode,

    /// Endpoint resolution found no default socket of the requested kind.
    #[error("node has no default socket of the requested kind")]
    NoDefaultSocket,

    /// No output device was available when building the audio stream.
    #[error("no audio output device available")]
    DeviceUnavailable,

    /// The platform audio stream could not be built or started.
    #[error("audio stream error: {0}")]
    Stream(String),
}
