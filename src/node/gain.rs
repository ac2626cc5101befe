//! Voltage-controlled amplifier.

use crate::buffer::Pool;
use crate::graph::Processor;
use crate::socket::SocketSpec;

/// Scales its input by a base amount plus the `gain` control lane:
/// `out = in * (amount + gain[f])`.
pub struct Vca {
    nchannels: usize,
    amount: f32,
}

impl Vca {
    /// Mono, unity gain.
    pub fn new() -> Self {
        Self::with_channels(1)
    }

    pub fn with_channels(nchannels: usize) -> Self {
        Self {
            nchannels,
            amount: 1.,
        }
    }

    pub fn amount(mut self, amount: f32) -> Self {
        self.amount = amount;
        self
    }
}

impl Default for Vca {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Vca {
    fn sockets(&self) -> Vec<SocketSpec> {
        vec![
            SocketSpec::audio_in("inputs", self.nchannels).as_default(),
            SocketSpec::control_in("gain"),
            SocketSpec::audio_out("outputs", self.nchannels).as_default(),
        ]
    }

    fn render(&mut self, inputs: &Pool, outputs: &mut Pool, nframes: usize) {
        let input = inputs.audio(0);
        let gain = inputs.audio(1);
        let out = outputs.audio_mut(0);

        for c in 0..input.nchannels().min(out.nchannels()) {
            for f in 0..nframes {
                out.channel_mut(c)[f] = input.channel(c)[f] * (self.amount + gain.channel(0)[f]);
            }
        }
    }

    fn label(&self) -> &'static str {
        "vca"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AudioBuffer, Buffer};
    use float_eq::assert_float_eq;

    #[test]
    fn test_applies_amount() {
        let mut vca = Vca::new().amount(0.5);

        let mut inputs = Pool::with_len(2);
        let mut signal = AudioBuffer::new(1, 4);
        signal.channel_mut(0).copy_from_slice(&[1., -1., 0.5, 0.]);
        inputs.slots[0] = Buffer::Audio(signal);
        inputs.slots[1] = Buffer::Audio(AudioBuffer::new(1, 4));

        let mut outputs = Pool::with_len(1);
        outputs.slots[0] = Buffer::Audio(AudioBuffer::new(1, 4));

        vca.render(&inputs, &mut outputs, 4);
        assert_float_eq!(
            outputs.audio(0).channel(0),
            &[0.5, -0.5, 0.25, 0.][..],
            abs_all <= 1e-7
        );
    }

    #[test]
    fn test_gain_lane_modulates() {
        let mut vca = Vca::new().amount(0.);

        let mut inputs = Pool::with_len(2);
        let mut signal = AudioBuffer::new(1, 2);
        signal.channel_mut(0).copy_from_slice(&[1., 1.]);
        inputs.slots[0] = Buffer::Audio(signal);
        let mut gain = AudioBuffer::new(1, 2);
        gain.channel_mut(0).copy_from_slice(&[0.25, 0.75]);
        inputs.slots[1] = Buffer::Audio(gain);

        let mut outputs = Pool::with_len(1);
        outputs.slots[0] = Buffer::Audio(AudioBuffer::new(1, 2));

        vca.render(&inputs, &mut outputs, 2);
        assert_float_eq!(outputs.audio(0).channel(0), &[0.25, 0.75][..], abs_all <= 1e-7);
    }
}
