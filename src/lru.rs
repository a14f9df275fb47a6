//! Per-stream recency tracking of data sections.
//!
//! Each stream remembers the sections it has touched, newest first, up to a
//! fixed capacity. Marking a new section fetches it in the shared buffer;
//! falling off the end releases it. The cache is strictly per-stream, so one
//! stream's eviction never drops a section another stream still wants — the
//! buffer's refcounts arbitrate.

use crate::streambuffer::StreamBuffer;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) struct SectionLru {
    cap: usize,
    /// Front is most recently used.
    order: VecDeque<u64>,
    buffer: Arc<StreamBuffer>,
}

impl SectionLru {
    pub(crate) fn new(cap: u64, buffer: Arc<StreamBuffer>) -> Self {
        SectionLru { cap: cap as usize, order: VecDeque::new(), buffer }
    }

    /// Mark `index` most recently used, fetching it if it is new and
    /// releasing the eldest entry past capacity.
    pub(crate) fn update(&mut self, index: u64) {
        if let Some(pos) = self.order.iter().position(|&i| i == index) {
            self.order.remove(pos);
            self.order.push_front(index);
            return;
        }
        self.buffer.fetch_section(index);
        self.order.push_front(index);
        if self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_back() {
                self.buffer.release_section(evicted);
            }
        }
    }

    /// Release every remembered section.
    pub(crate) fn evict_all(&mut self) {
        for index in self.order.drain(..) {
            self.buffer.release_section(index);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, index: u64) -> bool {
        self.order.contains(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streambuffer::tests::MemSource;
    use crate::streambuffer::StreamBufferSet;

    fn lru_with_buffer(cap: u64) -> (SectionLru, Arc<StreamBuffer>, crate::stream::Stream) {
        // Borrow a buffer from a real set; the stream keeps it alive.
        let set = StreamBufferSet::with_stream_cache_size(1 << 20);
        let stream = set.new_stream(MemSource::new(1 << 16, 64, 9), 0);
        let buffer = stream.buffer_for_tests();
        (SectionLru::new(cap, buffer.clone()), buffer, stream)
    }

    #[tokio::test]
    async fn eviction_follows_recency() {
        let (mut lru, buffer, _stream) = lru_with_buffer(3);
        for i in 10..13 {
            lru.update(i);
        }
        // Touch 10 so 11 becomes the eldest.
        lru.update(10);
        lru.update(13);
        assert!(!lru.contains(11));
        assert!(lru.contains(10) && lru.contains(12) && lru.contains(13));
        assert_eq!(lru.len(), 3);
        // The buffer dropped section 11 when its only reference went away.
        assert!(buffer.section(11).is_none());
        lru.evict_all();
    }

    #[tokio::test]
    async fn repeated_updates_do_not_leak_references() {
        let (mut lru, buffer, _stream) = lru_with_buffer(2);
        for _ in 0..10 {
            lru.update(5);
        }
        let counts = buffer.section_refcounts();
        assert!(counts.contains(&(5, 1)), "{counts:?}");
        lru.evict_all();
        assert!(buffer.section(5).is_none());
        assert_eq!(lru.len(), 0);
    }

    #[tokio::test]
    async fn evict_all_releases_everything() {
        let (mut lru, buffer, _stream) = lru_with_buffer(4);
        for i in 0..4 {
            lru.update(i);
        }
        lru.evict_all();
        for i in 0..4 {
            // Sections 0 and 1 may be held by the host stream's own lru;
            // anything above that must be gone.
            if i >= 2 {
                assert!(buffer.section(i).is_none());
            }
        }
    }
}
