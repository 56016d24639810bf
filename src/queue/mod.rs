//! Queue subsystem: a bounded in-memory window over a persistent overflow
//! store, plus the pending staging area for songs that arrive mid-resolution.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use rand::prelude::*;
use tracing::debug;

use crate::error::Result;
use crate::model::SongRecord;
use crate::storage::QueueStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub added: usize,
    pub duplicates: usize,
}

pub struct TrackQueue {
    guild_id: String,
    cap: usize,
    reload_batch: usize,
    window: VecDeque<SongRecord>,
    pending: VecDeque<SongRecord>,
    overflow_count: u64,
    /// Ids already pulled from the overflow store, so a cursor reset cannot
    /// hand the same records back.
    loaded_ids: HashSet<String>,
    store: Arc<dyn QueueStore>,
    // Dedup keys covering the window and the overflow continuation.
    seen_stream_keys: HashSet<String>,
    seen_titles: HashSet<String>,
    seen_urls: HashSet<String>,
}

impl TrackQueue {
    pub fn new(guild_id: &str, cap: usize, reload_batch: usize, store: Arc<dyn QueueStore>) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            cap: cap.max(1),
            reload_batch: reload_batch.max(1),
            window: VecDeque::new(),
            pending: VecDeque::new(),
            overflow_count: 0,
            loaded_ids: HashSet::new(),
            store,
            seen_stream_keys: HashSet::new(),
            seen_titles: HashSet::new(),
            seen_urls: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty() && self.overflow_count == 0
    }

    pub fn overflow_len(&self) -> u64 {
        self.overflow_count
    }

    /// `|window| + |overflow|`, the user-visible queue size.
    pub fn total_count(&self) -> u64 {
        self.window.len() as u64 + self.overflow_count
    }

    pub fn head(&self) -> Option<&SongRecord> {
        self.window.front()
    }

    pub fn window_items(&self) -> Vec<SongRecord> {
        self.window.iter().cloned().collect()
    }

    fn is_duplicate(&self, song: &SongRecord) -> bool {
        if self.seen_stream_keys.contains(&song.stream_key) {
            return true;
        }
        if self.seen_titles.contains(&song.title) {
            return true;
        }
        matches!(&song.source_url, Some(url) if self.seen_urls.contains(url))
    }

    fn remember(&mut self, song: &SongRecord) {
        self.seen_stream_keys.insert(song.stream_key.clone());
        self.seen_titles.insert(song.title.clone());
        if let Some(url) = &song.source_url {
            self.seen_urls.insert(url.clone());
        }
    }

    fn forget(&mut self, song: &SongRecord) {
        self.seen_stream_keys.remove(&song.stream_key);
        self.seen_titles.remove(&song.title);
        if let Some(url) = &song.source_url {
            self.seen_urls.remove(url);
        }
    }

    /// Append songs; anything past the in-memory cap spills to the overflow
    /// store. Duplicates (by stream key, exact title, or source URL) are
    /// skipped and counted.
    pub async fn enqueue(&mut self, songs: Vec<SongRecord>) -> Result<EnqueueOutcome> {
        let mut outcome = EnqueueOutcome::default();
        let mut spill = Vec::new();

        for song in songs {
            if self.is_duplicate(&song) {
                outcome.duplicates += 1;
                continue;
            }
            self.remember(&song);
            if self.window.len() < self.cap && self.overflow_count == 0 {
                self.window.push_back(song);
            } else {
                spill.push(song);
            }
            outcome.added += 1;
        }

        if !spill.is_empty() {
            let count = spill.len() as u64;
            self.store.push_overflow(&self.guild_id, &spill).await?;
            self.overflow_count += count;
            debug!(
                "spilled {count} songs to overflow for guild {} (total {})",
                self.guild_id, self.overflow_count
            );
        }
        Ok(outcome)
    }

    /// Pop the head. When the window drops to half the cap and overflow is
    /// non-empty, the next batch is pulled in atomically.
    pub async fn dequeue(&mut self) -> Result<Option<SongRecord>> {
        let popped = self.window.pop_front();
        if let Some(song) = &popped {
            self.forget(song);
        }

        if self.window.len() <= self.cap / 2 && self.overflow_count > 0 {
            self.refill().await?;
        }
        Ok(popped)
    }

    async fn refill(&mut self) -> Result<()> {
        let exclude: Vec<String> = self.loaded_ids.iter().cloned().collect();
        let pulled = self
            .store
            .pull_overflow(&self.guild_id, self.reload_batch, &exclude)
            .await?;
        let pulled_count = pulled.len() as u64;
        for song in pulled {
            self.loaded_ids.insert(song.id.clone());
            self.remember(&song);
            self.window.push_back(song);
        }
        self.overflow_count = self.overflow_count.saturating_sub(pulled_count);
        // The store is authoritative after a pull; a cursor reset elsewhere
        // would otherwise leave the count drifting.
        if pulled_count == 0 {
            self.overflow_count = self.store.overflow_count(&self.guild_id).await?;
        }
        Ok(())
    }

    /// Fisher-Yates over the in-memory window. No-op below two songs.
    /// Returns whether anything moved.
    pub fn shuffle(&mut self) -> bool {
        if self.window.len() < 2 {
            return false;
        }
        let mut rng = rand::rng();
        self.window.make_contiguous().shuffle(&mut rng);
        true
    }

    /// Empty memory, overflow and pending, persisting the cleared state.
    pub async fn clear(&mut self) -> Result<()> {
        self.window.clear();
        self.pending.clear();
        self.loaded_ids.clear();
        self.seen_stream_keys.clear();
        self.seen_titles.clear();
        self.seen_urls.clear();
        self.overflow_count = 0;
        self.store.clear(&self.guild_id).await
    }

    pub fn push_pending(&mut self, songs: Vec<SongRecord>) {
        self.pending.extend(songs);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drain pending arrivals in insertion order for a normal enqueue.
    pub fn drain_pending(&mut self) -> Vec<SongRecord> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_song, MemoryStore};
    use tokio_test::assert_ok;
    use std::collections::BTreeMap;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn enqueue_spills_past_cap() {
        let store = store();
        let mut queue = TrackQueue::new("g1", 3, 3, store.clone());

        let songs: Vec<_> = (0..10).map(|i| test_song(&format!("s{i}"))).collect();
        let outcome = queue.enqueue(songs).await.unwrap();

        assert_eq!(outcome.added, 10);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.overflow_len(), 7);
        assert_eq!(queue.total_count(), 10);
    }

    #[tokio::test]
    async fn dedupe_by_stream_key_title_and_url() {
        let store = store();
        let mut queue = TrackQueue::new("g1", 3, 3, store);

        let original = test_song("a");
        queue.enqueue(vec![original.clone()]).await.unwrap();

        // Same stream key.
        let outcome = queue.enqueue(vec![original.clone()]).await.unwrap();
        assert_eq!(outcome.duplicates, 1);

        // Different key, same exact title.
        let mut same_title = test_song("b");
        same_title.title = original.title.clone();
        let outcome = queue.enqueue(vec![same_title]).await.unwrap();
        assert_eq!(outcome.duplicates, 1);

        // Different key and title, same source URL.
        let mut same_url = test_song("c");
        same_url.source_url = original.source_url.clone();
        let outcome = queue.enqueue(vec![same_url]).await.unwrap();
        assert_eq!(outcome.duplicates, 1);

        assert_eq!(queue.total_count(), 1);
    }

    #[tokio::test]
    async fn dequeue_refills_from_overflow() {
        let store = store();
        let mut queue = TrackQueue::new("g1", 3, 3, store);

        let songs: Vec<_> = (0..8).map(|i| test_song(&format!("s{i}"))).collect();
        queue.enqueue(songs).await.unwrap();

        // Pop twice: window 3 -> 1, which is <= cap/2, triggering a refill.
        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.stream_key, "https://youtu.be/s0");
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.stream_key, "https://youtu.be/s1");

        assert!(queue.len() >= 3, "window refilled, got {}", queue.len());
        assert_eq!(queue.total_count(), 6);
        // Order is preserved across the overflow boundary.
        assert_eq!(queue.head().unwrap().stream_key, "https://youtu.be/s2");
    }

    #[tokio::test]
    async fn refill_skips_already_loaded_ids() {
        let store = store();
        let mut queue = TrackQueue::new("g1", 3, 3, store.clone());

        let songs: Vec<_> = (0..6).map(|i| test_song(&format!("s{i}"))).collect();
        queue.enqueue(songs.clone()).await.unwrap();

        // Force a refill.
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        let loaded: Vec<String> = queue.loaded_ids.iter().cloned().collect();
        assert!(!loaded.is_empty());

        // Simulate a cursor reset: the store re-gains records the window
        // already saw. A further pull must not hand them back.
        store.push_overflow("g1", &songs[3..5]).await.unwrap();
        queue.overflow_count = 2;
        while queue.len() > 1 {
            queue.dequeue().await.unwrap();
        }
        queue.dequeue().await.unwrap();

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for song in queue.window_items() {
            *counts.entry(song.id).or_default() += 1;
        }
        assert!(counts.values().all(|&c| c == 1), "duplicate after reset");
        let window_ids: Vec<String> = queue.window_items().iter().map(|s| s.id.clone()).collect();
        for id in &loaded {
            assert!(!window_ids.contains(id), "re-loaded an already-seen id");
        }
    }

    #[tokio::test]
    async fn shuffle_is_a_permutation_and_noop_below_two() {
        let store = store();
        let mut queue = TrackQueue::new("g1", 10, 3, store);

        let songs: Vec<_> = (0..10).map(|i| test_song(&format!("s{i}"))).collect();
        queue.enqueue(songs.clone()).await.unwrap();

        let mut before: Vec<String> = queue.window_items().iter().map(|s| s.id.clone()).collect();
        queue.shuffle();
        let mut after: Vec<String> = queue.window_items().iter().map(|s| s.id.clone()).collect();

        before.sort();
        after.sort();
        assert_eq!(before, after, "shuffle must preserve the multiset");

        // Single-song queue: no-op.
        let store2 = Arc::new(MemoryStore::new());
        let mut single = TrackQueue::new("g2", 10, 3, store2);
        single.enqueue(vec![test_song("only")]).await.unwrap();
        assert!(!single.shuffle());
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let store = store();
        let mut queue = TrackQueue::new("g1", 3, 3, store.clone());

        queue
            .enqueue((0..8).map(|i| test_song(&format!("s{i}"))).collect())
            .await
            .unwrap();
        queue.push_pending(vec![test_song("pending")]);
        assert_ok!(queue.clear().await);

        assert_eq!(queue.total_count(), 0);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(store.overflow_count("g1").await.unwrap(), 0);

        // Previously-seen songs can be enqueued again after a clear.
        let outcome = queue.enqueue(vec![test_song("s0")]).await.unwrap();
        assert_eq!(outcome.added, 1);
    }

    #[tokio::test]
    async fn pending_drains_in_insertion_order() {
        let store = store();
        let mut queue = TrackQueue::new("g1", 3, 3, store);

        queue.push_pending(vec![test_song("p1")]);
        queue.push_pending(vec![test_song("p2"), test_song("p3")]);

        let drained = queue.drain_pending();
        let keys: Vec<_> = drained.iter().map(|s| s.stream_key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "https://youtu.be/p1",
                "https://youtu.be/p2",
                "https://youtu.be/p3"
            ]
        );
        assert_eq!(queue.pending_len(), 0);
    }
}
