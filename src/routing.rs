//! Channel-mapping matrices for connections.

use arrayvec::ArrayVec;

/// Maximum number of cables a single routing can hold.
pub const MAX_CABLES: usize = 32;

/// An immutable list of `(source_channel, destination_channel)` pairs
/// describing how an edge maps its source channels onto its destination.
///
/// An empty ("null") routing stands for the default straight mapping over
/// `min(source.nchannels, dest.nchannels)` channels. Routing is a plain
/// value: cheap to clone, comparable, and never heap-allocated, so the
/// render thread can snapshot it per pull.
///
/// ```
/// use patchbay::routing::Routing;
///
/// let swap = Routing::from_pairs(&[(0, 1), (1, 0)]);
/// assert_eq!(swap.ncables(), 2);
/// assert_eq!(swap.cable(0), (0, 1));
/// assert!(!swap.is_null());
/// assert!(Routing::new().is_null());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Routing {
    cables: ArrayVec<(u8, u8), MAX_CABLES>,
}

impl Routing {
    /// The null routing (straight mapping).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a routing from explicit `(source, dest)` channel pairs.
    ///
    /// Panics if more than [`MAX_CABLES`] pairs are given.
    pub fn from_pairs(pairs: &[(u8, u8)]) -> Self {
        let mut cables = ArrayVec::new();
        for &pair in pairs {
            cables.push(pair);
        }
        Self { cables }
    }

    /// Build a routing from a flat channel list, interpreted pairwise:
    /// `[0, 1, 1, 0]` maps channel 0 onto 1 and channel 1 onto 0.
    /// A trailing unpaired entry is ignored.
    pub fn from_flat(channels: &[u8]) -> Self {
        let mut cables = ArrayVec::new();
        for pair in channels.chunks_exact(2) {
            cables.push((pair[0], pair[1]));
        }
        Self { cables }
    }

    /// The i-th `(source, dest)` cable.
    ///
    /// Panics if `i >= ncables()`.
    pub fn cable(&self, i: usize) -> (u8, u8) {
        self.cables[i]
    }

    pub fn cables(&self) -> &[(u8, u8)] {
        self.cables.as_slice()
    }

    pub fn ncables(&self) -> usize {
        self.cables.len()
    }

    /// True for the default straight mapping.
    pub fn is_null(&self) -> bool {
        self.cables.is_empty()
    }

    /// Highest source channel referenced, if any.
    pub(crate) fn max_source_channel(&self) -> Option<u8> {
        self.cables.iter().map(|c| c.0).max()
    }

    /// Highest destination channel referenced, if any.
    pub(crate) fn max_dest_channel(&self) -> Option<u8> {
        self.cables.iter().map(|c| c.1).max()
    }
}
