//! Fixed delay line.

use crate::buffer::Pool;
use crate::graph::{GraphProperties, Processor};
use crate::socket::SocketSpec;

/// Delays its mono input by a whole number of frames.
///
/// With its output fed back into its input over a feedback connection this
/// is the canonical loop-breaking element: each vector it reads what the
/// previous vector wrote.
pub struct Delay {
    delay_frames: usize,
    line: Vec<f32>,
    wpos: usize,
}

impl Delay {
    pub fn new(delay_frames: usize) -> Self {
        Self {
            delay_frames,
            line: Vec::new(),
            wpos: 0,
        }
    }
}

impl Processor for Delay {
    fn sockets(&self) -> Vec<SocketSpec> {
        vec![
            SocketSpec::audio_in("inputs", 1).as_default(),
            SocketSpec::audio_out("outputs", 1).as_default(),
        ]
    }

    fn initialize(&mut self, _properties: &GraphProperties) {
        self.line = vec![0.; self.delay_frames.max(1)];
        self.wpos = 0;
    }

    fn render(&mut self, inputs: &Pool, outputs: &mut Pool, nframes: usize) {
        let input = inputs.audio(0);
        let out = outputs.audio_mut(0);

        for f in 0..nframes {
            out.channel_mut(0)[f] = self.line[self.wpos];
            self.line[self.wpos] = input.channel(0)[f];
            self.wpos = (self.wpos + 1) % self.line.len();
        }
    }

    fn label(&self) -> &'static str {
        "delay"
    }
}
