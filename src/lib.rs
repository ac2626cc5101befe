//! A pull-based audio/MIDI processing graph for realtime applications.
//!
//! A host composes a directed graph of processing nodes (oscillators,
//! filters, mixers, i/o endpoints) connected through typed sockets. At
//! runtime the audio thread pulls one vector of samples at a time from a
//! designated sink node, which recursively renders its upstream
//! dependencies: correctly ordered, allocation-free, honoring
//! per-connection routing, gain, offset, mute and feedback.
//!
//! # Example
//!
//! ```no_run
//! use patchbay::{Graph, node};
//!
//! let mut graph = Graph::new(48_000., 128);
//! let osc = graph.add_node(node::SineOsc::new(440.));
//! let vca = graph.add_node(node::Vca::new());
//! let sink = graph.add_node(node::Sink::new(2));
//!
//! graph.connect(osc, vca).unwrap();
//! graph.connect(vca, sink).unwrap();
//! graph.component_complete().unwrap();
//!
//! let controller = graph.controller();
//! let stream = patchbay::io::OutputBuilder::new()
//!     .unwrap()
//!     .build(graph, sink)
//!     .unwrap();
//! # let _ = (controller, stream);
//! ```
//!
//! Two threads cooperate: the audio thread owns the graph and runs it once
//! per device period; the control thread mutates parameters through shared
//! atomics and submits topology changes over a queue the graph drains
//! between vectors. See [`graph::Graph`] and [`message::GraphController`].

use std::sync::atomic::{AtomicU32, Ordering};

pub mod buffer;
pub mod connection;
pub mod error;
pub mod graph;
pub mod io;
pub mod message;
pub mod node;
pub mod routing;
pub mod socket;

pub use buffer::{AudioBuffer, Buffer, MidiBuffer, MidiEvent, Pool};
pub use connection::{ConnectionRef, EdgeId};
pub use error::GraphError;
pub use graph::{Dispatch, Endpoint, Graph, GraphProperties, NodeId, NodeRef, Processor};
pub use message::{GraphController, RenderDiag};
pub use routing::Routing;
pub use socket::{Polarity, SocketId, SocketRef, SocketSpec, SocketType};

/// Decibels to linear amplitude: `10^(db/20)`.
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.)
}

/// Linear amplitude to decibels.
pub fn linear_to_db(linear: f32) -> f32 {
    20. * linear.log10()
}

/// MIDI note number to frequency in Hertz (A4 = 69 = 440 Hz).
pub fn midi_to_hz(note: u8) -> f64 {
    440. * 2f64.powf((note as f64 - 69.) / 12.)
}

/// Frequency in Hertz to the nearest MIDI note number.
pub fn hz_to_midi(frequency: f64) -> u8 {
    let note = 69. + 12. * (frequency / 440.).log2();
    note.round().max(0.).min(127.) as u8
}

/// An f32 with atomic load/store through its bit pattern. Parameters shared
/// between the control and audio threads are single words of this kind.
#[derive(Debug)]
pub(crate) struct AtomicF32 {
    bits: AtomicU32,
}

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::SeqCst))
    }

    pub fn store(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    #[test]
    fn test_db_conversions() {
        assert_float_eq!(db_to_linear(0.), 1., abs <= 1e-7);
        assert_float_eq!(db_to_linear(-6.), 0.501_187_2, abs <= 1e-6);
        assert_float_eq!(db_to_linear(20.), 10., abs <= 1e-5);
        assert_float_eq!(linear_to_db(1.), 0., abs <= 1e-7);
    }

    #[test]
    fn test_midi_conversions() {
        assert_float_eq!(midi_to_hz(69), 440., abs <= 1e-9);
        assert_float_eq!(midi_to_hz(57), 220., abs <= 1e-9);
        assert_eq!(hz_to_midi(440.), 69);
        assert_eq!(hz_to_midi(261.63), 60);
    }

    #[test]
    fn test_atomic_f32() {
        let a = AtomicF32::new(1.5);
        assert_float_eq!(a.load(), 1.5, abs <= 0.);
        a.store(-0.25);
        assert_float_eq!(a.load(), -0.25, abs <= 0.);
    }
}
