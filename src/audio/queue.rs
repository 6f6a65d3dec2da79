use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::{
    error::{PlayerError, PlayerResult},
    sources::QueuedSong,
};

/// Ordered songs plus a cursor marking "now playing".
///
/// Everything before the cursor is history, everything after it is the
/// queue ahead. The cursor may rest one past the last song once the queue has
/// been played through; `current()` is `None` in that state.
#[derive(Debug, Default)]
pub struct MusicQueue {
    songs: Vec<QueuedSong>,
    position: usize,
}

impl MusicQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a song, or slots it right after the current one when
    /// `insert_at_front` is set. Playlist songs always go to the tail.
    pub fn add(&mut self, song: QueuedSong, insert_at_front: bool) {
        if song.playlist.is_some() || !insert_at_front {
            info!("➕ Added to queue: {}", song.title);
            self.songs.push(song);
        } else {
            let insert_at = (self.position + 1).min(self.songs.len());
            info!("⏭️ Added as next song: {}", song.title);
            self.songs.insert(insert_at, song);
        }
    }

    pub fn current(&self) -> Option<&QueuedSong> {
        self.songs.get(self.position)
    }

    /// Songs after the cursor.
    pub fn ahead(&self) -> &[QueuedSong] {
        let start = (self.position + 1).min(self.songs.len());
        &self.songs[start..]
    }

    /// Songs before the cursor.
    pub fn history(&self) -> &[QueuedSong] {
        &self.songs[..self.position.min(self.songs.len())]
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of songs ahead of the cursor.
    pub fn size(&self) -> usize {
        self.ahead().len()
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn can_advance(&self, skip: usize) -> bool {
        skip > 0 && self.position + skip - 1 < self.songs.len()
    }

    pub fn advance(&mut self, skip: usize) -> PlayerResult<()> {
        if !self.can_advance(skip) {
            return Err(PlayerError::NothingToForward);
        }

        self.position += skip;
        debug!("Queue cursor advanced to {}", self.position);
        Ok(())
    }

    pub fn can_retreat(&self) -> bool {
        self.position >= 1
    }

    pub fn retreat(&mut self) -> PlayerResult<()> {
        if !self.can_retreat() {
            return Err(PlayerError::NothingToGoBack);
        }

        self.position -= 1;
        debug!("Queue cursor moved back to {}", self.position);
        Ok(())
    }

    /// Puts the cursor back where it was before a failed operation.
    pub(crate) fn restore_position(&mut self, position: usize) {
        self.position = position.min(self.songs.len());
    }

    /// Shuffles the songs ahead; history and the current song stay put.
    pub fn shuffle_ahead(&mut self) {
        let start = (self.position + 1).min(self.songs.len());
        let mut rng = rand::thread_rng();
        self.songs[start..].shuffle(&mut rng);
        info!("🔀 Queue shuffled");
    }

    /// Drops everything but the current song.
    pub fn clear(&mut self) {
        let current = self.current().cloned();
        self.songs = current.into_iter().collect();
        self.position = 0;
        info!("🗑️ Queue cleared");
    }

    /// Drops every song, including the current one.
    pub fn reset(&mut self) {
        self.songs.clear();
        self.position = 0;
    }

    /// Removes `amount` songs starting `index` places after the cursor.
    pub fn remove_range(&mut self, index: usize, amount: usize) -> PlayerResult<Vec<QueuedSong>> {
        let size = self.size();
        if index == 0 || amount == 0 || index + amount - 1 > size {
            return Err(PlayerError::IndexOutOfRange { index, size });
        }

        let start = self.position + index;
        let removed: Vec<QueuedSong> = self.songs.drain(start..start + amount).collect();
        debug!("❌ Removed {} song(s) at relative index {}", removed.len(), index);
        Ok(removed)
    }

    /// Moves a song between two places after the cursor and returns it.
    pub fn move_song(&mut self, from: usize, to: usize) -> PlayerResult<&QueuedSong> {
        let size = self.size();
        for index in [from, to] {
            if index == 0 || index > size {
                return Err(PlayerError::IndexOutOfRange { index, size });
            }
        }

        let song = self.songs.remove(self.position + from);
        self.songs.insert(self.position + to, song);
        debug!("📍 Song moved from {} to {}", from, to);
        Ok(&self.songs[self.position + to])
    }

    /// Sum of the lengths of the songs ahead, in seconds.
    pub fn total_ahead_length(&self) -> u64 {
        self.ahead().iter().map(|song| song.length).sum()
    }
}
