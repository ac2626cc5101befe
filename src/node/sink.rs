//! Driver-facing endpoint node.

use crate::buffer::Pool;
use crate::graph::Processor;
use crate::socket::SocketSpec;

/// The node the audio driver pulls.
///
/// Mixes everything connected to its default input and exposes the result
/// on its default output, where [`Graph::run`](crate::graph::Graph::run)
/// picks it up for interleaving into the device buffer.
pub struct Sink {
    nchannels: usize,
}

impl Sink {
    pub fn new(nchannels: usize) -> Self {
        Self { nchannels }
    }
}

impl Processor for Sink {
    fn sockets(&self) -> Vec<SocketSpec> {
        vec![
            SocketSpec::audio_in("inputs", self.nchannels).as_default(),
            SocketSpec::audio_out("outputs", self.nchannels).as_default(),
        ]
    }

    fn render(&mut self, inputs: &Pool, outputs: &mut Pool, nframes: usize) {
        let input = inputs.audio(0);
        let out = outputs.audio_mut(0);

        for c in 0..input.nchannels().min(out.nchannels()) {
            out.channel_mut(c)[..nframes].copy_from_slice(&input.channel(c)[..nframes]);
        }
    }

    fn label(&self) -> &'static str {
        "sink"
    }
}
