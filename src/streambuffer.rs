//! The shared stream cache: one [`StreamBuffer`] per data source, shared by
//! every stream reading that source, holding refcounted sections of fetched
//! bytes.
//!
//! Fetches are not cancellable and not prioritized by distance from the read
//! head; a fetch that is already in flight is allowed to finish even if every
//! interested stream closes first.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::watch;

/// Default per-stream cache allowance. The LRU capacity is this figure
/// divided by the source's request size, floored at two sections.
pub const DEFAULT_BYTES_BUFFERED_PER_STREAM: u64 = 1 << 25; // 32 MiB

pub(crate) const MIN_CACHED_SECTIONS: u64 = 2;

/// Content-identifying hash: equal ids mean fully interchangeable bytes.
pub type SourceId = [u8; 32];

/// A random-access backend the stream buffer fetches from. Implementations
/// are typically high-latency (network fetches against remote hosts), which
/// is the whole reason the look-ahead cache exists.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// Total size of the data. Reads never cross this boundary.
    fn data_size(&self) -> u64;

    /// Identifier for the content. Sources returning the same id must serve
    /// identical bytes and be fully interchangeable.
    fn id(&self) -> SourceId;

    /// The fetch granularity this source prefers. Every `read_at` is issued
    /// at a multiple of this size, with exactly this many bytes requested
    /// except for the tail.
    fn request_size(&self) -> u64;

    /// Read `buf.len()` bytes at `offset`, returning how many were read. A
    /// short read without an error is treated as a source failure.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Close without an error to report. The source handles any logging if
    /// the close itself fails.
    fn silent_close(&self);
}

/// One fetched (or in-flight) aligned window of bytes. The bytes and error
/// are written exactly once, before the completion signal fires; afterwards
/// they are immutable. The refcount lives with the owning buffer's lock, not
/// here.
pub(crate) struct DataSection {
    done_rx: watch::Receiver<bool>,
    outcome: OnceLock<std::result::Result<Vec<u8>, String>>,
}

impl DataSection {
    /// Block until the fetch finishes, then return the bytes.
    pub(crate) async fn wait_data(&self) -> Result<&[u8]> {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        match self.outcome.get() {
            Some(Ok(data)) => Ok(data),
            Some(Err(msg)) => Err(Error::DataSource(msg.clone())),
            None => Err(Error::DataSource("fetch task died without a result".into())),
        }
    }
}

struct SectionEntry {
    section: Arc<DataSection>,
    ref_count: u64,
}

/// The cache for a single data source. Sections live exactly as long as some
/// stream's LRU (or an in-flight fetch registration) holds a reference.
pub struct StreamBuffer {
    source_id: SourceId,
    data_size: u64,
    section_size: u64,
    source: Arc<dyn DataSource>,
    sections: Mutex<HashMap<u64, SectionEntry>>,
}

impl StreamBuffer {
    fn new(source: Arc<dyn DataSource>) -> Arc<Self> {
        Arc::new(StreamBuffer {
            source_id: source.id(),
            data_size: source.data_size(),
            section_size: source.request_size().max(1),
            source,
            sections: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn data_size(&self) -> u64 {
        self.data_size
    }

    pub(crate) fn section_size(&self) -> u64 {
        self.section_size
    }

    pub(crate) fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// Bump the refcount of section `index`, creating it and starting its
    /// background fetch if it is not already cached.
    pub(crate) fn fetch_section(&self, index: u64) {
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = sections.entry(index).or_insert_with(|| SectionEntry {
            section: self.spawn_fetch(index),
            ref_count: 0,
        });
        entry.ref_count += 1;
    }

    /// Drop one reference to section `index`; the last reference deletes it.
    pub(crate) fn release_section(&self, index: u64) {
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = sections.get_mut(&index) else {
            debug_assert!(false, "released a data section that does not exist");
            return;
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            sections.remove(&index);
        }
    }

    /// The cached section at `index`, if present.
    pub(crate) fn section(&self, index: u64) -> Option<Arc<DataSection>> {
        let sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        sections.get(&index).map(|e| e.section.clone())
    }

    fn spawn_fetch(&self, index: u64) -> Arc<DataSection> {
        let start = index.saturating_mul(self.section_size);
        // The final section is sized to exactly the remaining bytes.
        let fetch_size = if start.saturating_add(self.section_size) > self.data_size {
            self.data_size.saturating_sub(start)
        } else {
            self.section_size
        };

        let (done_tx, done_rx) = watch::channel(false);
        let section = Arc::new(DataSection { done_rx, outcome: OnceLock::new() });

        let fetched = section.clone();
        let source = self.source.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; fetch_size as usize];
            let outcome = match source.read_at(&mut buf, start).await {
                Ok(n) if n as u64 == fetch_size => Ok(buf),
                Ok(n) => Err(format!("short read: {n} of {fetch_size} bytes at offset {start}")),
                Err(e) => Err(e.to_string()),
            };
            let _ = fetched.outcome.set(outcome);
            let _ = done_tx.send(true);
        });
        section
    }

    pub(crate) fn close_source(&self) {
        self.source.silent_close();
    }

    /// (index, refcount) pairs of the cached sections, for tests.
    #[cfg(test)]
    pub(crate) fn section_refcounts(&self) -> Vec<(u64, u64)> {
        let sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(u64, u64)> = sections.iter().map(|(i, e)| (*i, e.ref_count)).collect();
        out.sort();
        out
    }
}

struct BufferEntry {
    buffer: Arc<StreamBuffer>,
    ref_count: u64,
}

/// Process-wide index from source id to stream buffer. New streams for an
/// already-tracked source share the existing buffer; its refcount lives in
/// this set's lock domain so lookup and teardown stay consistent.
#[derive(Clone)]
pub struct StreamBufferSet {
    inner: Arc<SetInner>,
}

struct SetInner {
    bytes_per_stream: u64,
    buffers: Mutex<HashMap<SourceId, BufferEntry>>,
}

impl StreamBufferSet {
    pub fn new() -> Self {
        Self::with_stream_cache_size(DEFAULT_BYTES_BUFFERED_PER_STREAM)
    }

    /// A set whose streams each buffer `bytes_per_stream` bytes. Small
    /// figures keep cache-pressure tests cheap.
    pub fn with_stream_cache_size(bytes_per_stream: u64) -> Self {
        StreamBufferSet {
            inner: Arc::new(SetInner { bytes_per_stream, buffers: Mutex::new(HashMap::new()) }),
        }
    }

    /// Open a stream over `source` at `initial_offset`. When another stream
    /// already reads the same source id, the caller's source is silently
    /// closed and the existing buffer is shared.
    pub fn new_stream(&self, source: Arc<dyn DataSource>, initial_offset: u64) -> crate::stream::Stream {
        let source_id = source.id();
        let buffer = {
            let mut buffers = self.inner.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            match buffers.get_mut(&source_id) {
                Some(entry) => {
                    source.silent_close();
                    entry.ref_count += 1;
                    entry.buffer.clone()
                }
                None => {
                    let buffer = StreamBuffer::new(source);
                    buffers.insert(source_id, BufferEntry { buffer: buffer.clone(), ref_count: 1 });
                    buffer
                }
            }
        };
        crate::stream::Stream::new(self.clone(), buffer, initial_offset, self.inner.bytes_per_stream)
    }

    /// Drop one stream's reference to `buffer`. The last reference removes
    /// the buffer from the set and closes its data source, exactly once.
    pub(crate) fn remove_stream(&self, buffer: &Arc<StreamBuffer>) {
        let closing = {
            let mut buffers = self.inner.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = buffers.get_mut(&buffer.source_id()) else {
                debug_assert!(false, "removed a stream whose buffer is not tracked");
                return;
            };
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                buffers.remove(&buffer.source_id()).map(|e| e.buffer)
            } else {
                None
            }
        };
        if let Some(buffer) = closing {
            buffer.close_source();
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_buffers(&self) -> usize {
        self.inner.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for StreamBufferSet {
    fn default() -> Self {
        Self::new()
    }
}
