//! Wavetable sine source.

use crate::buffer::Pool;
use crate::graph::{GraphProperties, Processor};
use crate::socket::SocketSpec;

/// A sine oscillator reading a shared wavetable.
///
/// Output sample `n` since the start of the stream is
/// `sin(2π · f · n / rate)`. The base frequency is modulated per frame by
/// the `frequency` control lane.
pub struct SineOsc {
    frequency: f32,
    phase: f64,
    rate: f64,
}

impl SineOsc {
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            phase: 0.,
            rate: 44_100.,
        }
    }

    pub fn set_frequency(&mut self, frequency: f32) {
        self.frequency = frequency;
    }
}

impl Processor for SineOsc {
    fn sockets(&self) -> Vec<SocketSpec> {
        vec![
            SocketSpec::control_in("frequency"),
            SocketSpec::audio_out("outputs", 1).as_default(),
        ]
    }

    fn initialize(&mut self, properties: &GraphProperties) {
        self.rate = properties.rate;
        self.phase = 0.;
    }

    fn rate_changed(&mut self, rate: f64) {
        self.rate = rate;
    }

    fn render(&mut self, inputs: &Pool, outputs: &mut Pool, nframes: usize) {
        let modulation = inputs.audio(0);
        let out = outputs.audio_mut(0);
        let lane = out.channel_mut(0);

        for f in 0..nframes {
            lane[f] = super::sine(self.phase);
            let frequency = self.frequency as f64 + modulation.channel(0)[f] as f64;
            self.phase += frequency / self.rate;
        }
    }

    fn label(&self) -> &'static str {
        "sine"
    }
}
