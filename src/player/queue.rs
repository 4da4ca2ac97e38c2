use std::collections::VecDeque;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::protocol::tracks::Track;

/// Upcoming tracks. Interior mutability so handlers can share it through
/// an `Arc<Player>`.
#[derive(Default)]
pub struct Queue {
    tracks: Mutex<VecDeque<Track>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, track: Track) {
        self.tracks.lock().push_back(track);
    }

    pub fn push_front(&self, track: Track) {
        self.tracks.lock().push_front(track);
    }

    pub fn extend(&self, tracks: impl IntoIterator<Item = Track>) {
        self.tracks.lock().extend(tracks);
    }

    pub fn pop_front(&self) -> Option<Track> {
        self.tracks.lock().pop_front()
    }

    pub fn remove(&self, index: usize) -> Option<Track> {
        self.tracks.lock().remove(index)
    }

    /// Inserts at `index`, clamped to the queue length.
    pub fn insert(&self, index: usize, track: Track) {
        let mut tracks = self.tracks.lock();
        let index = index.min(tracks.len());
        tracks.insert(index, track);
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut tracks = self.tracks.lock();
        let removed = tracks.len();
        tracks.clear();
        removed
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.tracks.lock().iter().cloned().collect()
    }

    pub fn shuffle(&self) {
        let mut tracks = self.tracks.lock();
        tracks.make_contiguous().shuffle(&mut rand::thread_rng());
    }
}
