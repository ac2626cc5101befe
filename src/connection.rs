//! Directed edges between sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::routing::Routing;
use crate::socket::SocketId;
use crate::AtomicF32;

/// Arena id of a connection. Stable for the life of the graph (disconnected
/// edges leave a tombstone so later ids never shift).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct EdgeId(pub(crate) usize);

/// The word-sized parameters of an edge, shared between the render thread
/// and any number of control-thread [`ConnectionRef`] handles.
///
/// The render thread snapshots these to locals at the start of each pull,
/// so a concurrent store is picked up at the next vector boundary at the
/// latest, and no torn values are ever observed.
#[derive(Debug)]
pub struct ConnectionShared {
    mul: AtomicF32,
    add: AtomicF32,
    muted: AtomicBool,
    active: AtomicBool,
    feedback: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn new() -> Self {
        Self {
            mul: AtomicF32::new(1.),
            add: AtomicF32::new(0.),
            muted: AtomicBool::new(false),
            active: AtomicBool::new(true),
            feedback: AtomicBool::new(false),
        }
    }

    pub fn mul(&self) -> f32 {
        self.mul.load()
    }

    pub fn set_mul(&self, mul: f32) {
        self.mul.store(mul);
    }

    pub fn add(&self) -> f32 {
        self.add.load()
    }

    pub fn set_add(&self, add: f32) {
        self.add.store(add);
    }

    /// Muted edges produce silence (or no events) but still pull upstream.
    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Inactive edges are skipped entirely; upstream is not pulled.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Feedback edges read the source buffer as of the previous vector and
    /// never cause the source node to render. The exclusive mechanism for
    /// breaking cycles.
    pub fn feedback(&self) -> bool {
        self.feedback.load(Ordering::SeqCst)
    }

    pub fn set_feedback(&self, feedback: bool) {
        self.feedback.store(feedback, Ordering::SeqCst);
    }
}

/// An edge slot in the graph arena.
///
/// `nchannels` is fixed to `min(source, dest)` at `component_complete`;
/// the routing is replaced only through the deferred queue so the render
/// thread can snapshot it without synchronization.
#[derive(Debug)]
pub(crate) struct Edge {
    pub source: SocketId,
    pub dest: SocketId,
    pub nchannels: usize,
    pub routing: Routing,
    pub shared: Arc<ConnectionShared>,
}

impl Edge {
    pub fn new(source: SocketId, dest: SocketId, routing: Routing) -> Self {
        Self {
            source,
            dest,
            nchannels: 0,
            routing,
            shared: Arc::new(ConnectionShared::new()),
        }
    }
}

/// Control-thread handle to one connection, identified by its endpoint
/// pair (a given source/dest pair has at most one edge).
///
/// Cheap to clone; all setters are single atomic stores, safe to call while
/// the audio thread is rendering.
#[derive(Clone)]
pub struct ConnectionRef {
    pub(crate) source: SocketId,
    pub(crate) dest: SocketId,
    pub(crate) shared: Arc<ConnectionShared>,
}

impl ConnectionRef {
    pub fn source(&self) -> SocketId {
        self.source
    }

    pub fn dest(&self) -> SocketId {
        self.dest
    }

    pub fn mul(&self) -> f32 {
        self.shared.mul()
    }

    pub fn set_mul(&self, mul: f32) {
        self.shared.set_mul(mul);
    }

    pub fn add(&self) -> f32 {
        self.shared.add()
    }

    pub fn set_add(&self, add: f32) {
        self.shared.set_add(add);
    }

    pub fn muted(&self) -> bool {
        self.shared.muted()
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.set_muted(muted);
    }

    pub fn active(&self) -> bool {
        self.shared.active()
    }

    pub fn set_active(&self, active: bool) {
        self.shared.set_active(active);
    }

    pub fn feedback(&self) -> bool {
        self.shared.feedback()
    }

    pub fn set_feedback(&self, feedback: bool) {
        self.shared.set_feedback(feedback);
    }

    /// Gain expressed in decibels.
    pub fn set_level_db(&self, db: f32) {
        self.set_mul(crate::db_to_linear(db));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let shared = ConnectionShared::new();
        assert_eq!(shared.mul(), 1.);
        assert_eq!(shared.add(), 0.);
        assert!(!shared.muted());
        assert!(shared.active());
        assert!(!shared.feedback());
    }

    #[test]
    fn test_handles_share_state() {
        let edge = Edge::new(SocketId(0), SocketId(1), Routing::new());
        let a = ConnectionRef {
            source: edge.source,
            dest: edge.dest,
            shared: edge.shared.clone(),
        };
        let b = a.clone();

        a.set_mul(0.25);
        a.set_feedback(true);
        assert_eq!(b.mul(), 0.25);
        assert!(b.feedback());
        assert!(edge.shared.feedback());
    }
}
