//! MIDI observer forwarding events to a non-audio thread.

use crate::buffer::Pool;
use crate::graph::Processor;
use crate::socket::SocketSpec;

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// A decoded event delivered to the observer thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TapEvent {
    NoteOn { channel: u8, index: u8, value: u8 },
    NoteOff { channel: u8, index: u8, value: u8 },
    Control { channel: u8, index: u8, value: u8 },
}

/// Listens on a MIDI input and forwards note and control events over a
/// bounded channel, best effort: the audio thread never blocks, events past
/// the channel capacity are dropped.
pub struct EventTap {
    sender: Sender<TapEvent>,
}

impl EventTap {
    /// Create the tap and the receiving end the observer thread drains on
    /// its own cadence.
    pub fn new(capacity: usize) -> (Self, Receiver<TapEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl Processor for EventTap {
    fn sockets(&self) -> Vec<SocketSpec> {
        vec![SocketSpec::midi_in("midi_in").as_default()]
    }

    fn render(&mut self, inputs: &Pool, _outputs: &mut Pool, _nframes: usize) {
        for event in inputs.midi(0).iter() {
            let decoded = match event.kind() {
                0x80 => TapEvent::NoteOff {
                    channel: event.channel(),
                    index: event.b1,
                    value: event.b2,
                },
                0x90 => TapEvent::NoteOn {
                    channel: event.channel(),
                    index: event.b1,
                    value: event.b2,
                },
                0xb0 => TapEvent::Control {
                    channel: event.channel(),
                    index: event.b1,
                    value: event.b2,
                },
                _ => continue,
            };
            if let Err(TrySendError::Full(_)) = self.sender.try_send(decoded) {
                // observer is behind; drop rather than stall the vector
                return;
            }
        }
    }

    fn label(&self) -> &'static str {
        "tap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, MidiBuffer, MidiEvent};

    #[test]
    fn test_decodes_status_nibbles() {
        let (mut tap, events) = EventTap::new(8);

        let mut buffer = MidiBuffer::with_capacity(8);
        buffer.push(MidiEvent::new(0x93, 60, 100));
        buffer.push(MidiEvent::new(0x83, 60, 0));
        buffer.push(MidiEvent::new(0xb0, 7, 127));
        buffer.push(MidiEvent::new(0xf8, 0, 0)); // clock, ignored

        let mut inputs = Pool::with_len(1);
        inputs.slots[0] = Buffer::Midi(buffer);
        let mut outputs = Pool::with_len(0);

        tap.render(&inputs, &mut outputs, 16);

        assert_eq!(
            events.try_recv().unwrap(),
            TapEvent::NoteOn {
                channel: 3,
                index: 60,
                value: 100
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            TapEvent::NoteOff {
                channel: 3,
                index: 60,
                value: 0
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            TapEvent::Control {
                channel: 0,
                index: 7,
                value: 127
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_never_blocks_when_full() {
        let (mut tap, events) = EventTap::new(1);

        let mut buffer = MidiBuffer::with_capacity(8);
        buffer.push(MidiEvent::new(0x90, 60, 100));
        buffer.push(MidiEvent::new(0x90, 62, 100));

        let mut inputs = Pool::with_len(1);
        inputs.slots[0] = Buffer::Midi(buffer);
        let mut outputs = Pool::with_len(0);

        tap.render(&inputs, &mut outputs, 16);
        assert_eq!(events.len(), 1);
    }
}
