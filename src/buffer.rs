//! Signal buffers owned by sockets, and the pools nodes render through.

/// A planar audio buffer, a matrix of `nchannels` lanes of `nframes` samples.
///
/// Samples are normalized `-1.0..1.0`. The buffer is allocated once at
/// `component_complete` and reused for every vector; the render thread only
/// ever reads and writes in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Allocate a silent buffer with the given channel and frame count.
    pub fn new(nchannels: usize, nframes: usize) -> Self {
        Self {
            channels: vec![vec![0.; nframes]; nchannels],
        }
    }

    pub fn nchannels(&self) -> usize {
        self.channels.len()
    }

    pub fn nframes(&self) -> usize {
        self.channels.get(0).map(Vec::len).unwrap_or(0)
    }

    /// One channel lane as a slice.
    ///
    /// Panics if `channel` is out of range.
    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.channels[channel]
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.channels[channel]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(Vec::as_slice)
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.channels.iter_mut().map(Vec::as_mut_slice)
    }

    /// Write silence over the first `nframes` frames of every lane.
    pub fn silence(&mut self, nframes: usize) {
        for lane in &mut self.channels {
            let n = nframes.min(lane.len());
            for sample in &mut lane[..n] {
                *sample = 0.;
            }
        }
    }
}

/// A single wire-format MIDI event: status byte plus two data bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MidiEvent {
    pub status: u8,
    pub b1: u8,
    pub b2: u8,
}

impl MidiEvent {
    pub fn new(status: u8, b1: u8, b2: u8) -> Self {
        Self { status, b1, b2 }
    }

    /// The channel nibble of the status byte.
    pub fn channel(&self) -> u8 {
        self.status & 0x0f
    }

    /// The kind nibble of the status byte (0x80 note-off, 0x90 note-on, ...).
    pub fn kind(&self) -> u8 {
        self.status & 0xf0
    }
}

/// Number of events a MIDI socket buffer can hold per vector.
pub const MIDI_EVENT_CAPACITY: usize = 64;

/// A bounded per-vector event sequence.
///
/// The producing node appends during its render; consumers copy. Capacity is
/// fixed at allocation so pushes never reallocate on the render thread;
/// events past capacity are counted and dropped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
    overflowed: usize,
}

impl MidiBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            overflowed: 0,
        }
    }

    /// Append an event. Returns false (and counts the drop) when full.
    pub fn push(&mut self, event: MidiEvent) -> bool {
        if self.events.len() == self.events.capacity() {
            self.overflowed += 1;
            return false;
        }
        self.events.push(event);
        true
    }

    /// Copy every event of `other` into this buffer, within capacity.
    pub fn extend_from(&mut self, other: &MidiBuffer) {
        for &event in other.iter() {
            if !self.push(event) {
                return;
            }
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MidiEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events dropped since the last clear.
    pub fn overflowed(&self) -> usize {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.overflowed = 0;
    }
}

/// The storage held by one socket.
///
/// `Empty` is the placeholder state used while the graph is still building
/// and inside node pools between renders; swapping a buffer in and out of a
/// pool is a pointer exchange, never an allocation.
#[derive(Clone, Debug, PartialEq)]
pub enum Buffer {
    Empty,
    Audio(AudioBuffer),
    Midi(MidiBuffer),
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::Empty
    }
}

impl Buffer {
    pub fn as_audio(&self) -> Option<&AudioBuffer> {
        match self {
            Buffer::Audio(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_audio_mut(&mut self) -> Option<&mut AudioBuffer> {
        match self {
            Buffer::Audio(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_midi(&self) -> Option<&MidiBuffer> {
        match self {
            Buffer::Midi(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_midi_mut(&mut self) -> Option<&mut MidiBuffer> {
        match self {
            Buffer::Midi(b) => Some(b),
            _ => None,
        }
    }
}

/// A node's view over its input or output socket buffers, in socket
/// declaration order.
///
/// The graph moves each socket buffer into the pool right before invoking
/// the node's render function and moves it back right after, so processors
/// address their i/o by declaration index without touching the arena.
#[derive(Debug, Default)]
pub struct Pool {
    pub(crate) slots: Vec<Buffer>,
}

impl Pool {
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Buffer::Empty).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The audio buffer at declaration index `i`.
    ///
    /// Panics if the socket at `i` is not an audio or control socket.
    pub fn audio(&self, i: usize) -> &AudioBuffer {
        self.slots[i]
            .as_audio()
            .unwrap_or_else(|| panic!("pool slot {} is not an audio buffer", i))
    }

    pub fn audio_mut(&mut self, i: usize) -> &mut AudioBuffer {
        self.slots[i]
            .as_audio_mut()
            .unwrap_or_else(|| panic!("pool slot {} is not an audio buffer", i))
    }

    /// The MIDI buffer at declaration index `i`.
    ///
    /// Panics if the socket at `i` is not a MIDI socket.
    pub fn midi(&self, i: usize) -> &MidiBuffer {
        self.slots[i]
            .as_midi()
            .unwrap_or_else(|| panic!("pool slot {} is not a midi buffer", i))
    }

    pub fn midi_mut(&mut self, i: usize) -> &mut MidiBuffer {
        self.slots[i]
            .as_midi_mut()
            .unwrap_or_else(|| panic!("pool slot {} is not a midi buffer", i))
    }
}
