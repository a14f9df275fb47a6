//! The read/seek surface over a shared stream buffer.
//!
//! A stream is single-owner: `read` and `seek` take `&mut self`, so two
//! tasks can never race one stream. Concurrency happens across streams,
//! which share sections through the buffer's refcounts.

use crate::error::{Error, Result};
use crate::lru::SectionLru;
use crate::streambuffer::{StreamBuffer, StreamBufferSet, MIN_CACHED_SECTIONS};
use std::io::SeekFrom;
use std::sync::Arc;

/// A byte stream over one data source, backed by the shared look-ahead
/// cache. Close it when done; dropping an unclosed stream cleans up the same
/// way.
pub struct Stream {
    set: StreamBufferSet,
    buffer: Arc<StreamBuffer>,
    offset: u64,
    lru: SectionLru,
    closed: bool,
}

impl Stream {
    pub(crate) fn new(
        set: StreamBufferSet,
        buffer: Arc<StreamBuffer>,
        initial_offset: u64,
        bytes_per_stream: u64,
    ) -> Stream {
        let cap = (bytes_per_stream / buffer.section_size()).max(MIN_CACHED_SECTIONS);
        let mut stream = Stream {
            set,
            buffer: buffer.clone(),
            offset: initial_offset.min(buffer.data_size()),
            lru: SectionLru::new(cap, buffer),
            closed: false,
        };
        stream.prepare_offset();
        stream
    }

    /// Read up to `dst.len()` bytes at the current offset, never crossing a
    /// section boundary. Returns `Ok(0)` at end of stream.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let data_size = self.buffer.data_size();
        let section_size = self.buffer.section_size();

        if self.offset == data_size {
            return Ok(0);
        }

        let index = self.offset / section_size;
        let offset_in_section = self.offset % section_size;

        // Bytes left in this section, bounded by the end of the data.
        let last_section = (index + 1).saturating_mul(section_size) >= data_size;
        let remaining = if last_section {
            data_size - self.offset
        } else {
            section_size - offset_in_section
        };
        let to_read = remaining.min(dst.len() as u64) as usize;

        // The LRU keeps the section of the current offset resident; a miss
        // here is a bookkeeping bug, not a cache policy outcome.
        let Some(section) = self.buffer.section(index) else {
            debug_assert!(false, "data section for the current offset is not cached");
            return Err(Error::DataSource("data section for current offset missing".into()));
        };

        let data = section.wait_data().await?;
        let start = offset_in_section as usize;
        dst[..to_read].copy_from_slice(&data[start..start + to_read]);
        self.offset += to_read as u64;

        self.prepare_offset();
        Ok(to_read)
    }

    /// Move the read head.
    ///
    /// `SeekFrom::End(n)` treats `n` as a positive distance *before* the end
    /// of the data, not an offset past it: `End(100)` on a 1000-byte source
    /// lands at 900. Existing callers depend on this, so it stays. Negative
    /// arguments and seeks outside `[0, data_size]` are rejected.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let data_size = self.buffer.data_size();
        let new_offset = match pos {
            SeekFrom::Start(n) => {
                if n > data_size {
                    return Err(Error::InvalidArgument("cannot seek beyond the end of the data".into()));
                }
                n
            }
            SeekFrom::Current(d) => {
                if d < 0 {
                    return Err(Error::InvalidArgument("offset cannot be negative in call to seek".into()));
                }
                let new = self.offset.saturating_add(d as u64);
                if new > data_size {
                    return Err(Error::InvalidArgument("cannot seek beyond the end of the data".into()));
                }
                new
            }
            SeekFrom::End(d) => {
                if d < 0 {
                    return Err(Error::InvalidArgument("offset cannot be negative in call to seek".into()));
                }
                if d as u64 > data_size {
                    return Err(Error::InvalidArgument("cannot seek before the front of the data".into()));
                }
                data_size - d as u64
            }
        };
        self.offset = new_offset;
        self.prepare_offset();
        Ok(self.offset)
    }

    /// The current read offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Release every cached section and drop this stream's reference to the
    /// shared buffer. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.lru.evict_all();
        self.set.remove_stream(&self.buffer);
    }

    /// Keep the section under the read head resident, and the next one when
    /// there is a next one.
    fn prepare_offset(&mut self) {
        let data_size = self.buffer.data_size();
        let section_size = self.buffer.section_size();
        if self.offset == data_size {
            return;
        }
        let index = self.offset / section_size;
        self.lru.update(index);
        let next = index + 1;
        if next.saturating_mul(section_size) < data_size {
            self.lru.update(next);
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer_for_tests(&self) -> Arc<StreamBuffer> {
        self.buffer.clone()
    }

    #[cfg(test)]
    pub(crate) fn lru_len(&self) -> usize {
        self.lru.len()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streambuffer::tests::MemSource;

    fn small_set() -> StreamBufferSet {
        // bytes_per_stream 256 with 64-byte sections: four-section LRUs.
        StreamBufferSet::with_stream_cache_size(256)
    }

    #[tokio::test]
    async fn sequential_reads_cross_sections() {
        let set = small_set();
        let source = MemSource::new(1000, 64, 1);
        let mut stream = set.new_stream(source.clone(), 0);

        let mut collected = Vec::new();
        let mut buf = [0u8; 48];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, source.data);
        // At the end, reads keep returning end-of-stream.
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        stream.close();
    }

    #[tokio::test]
    async fn reads_stop_at_section_boundaries() {
        let set = small_set();
        let source = MemSource::new(1000, 64, 2);
        let mut stream = set.new_stream(source.clone(), 0);

        stream.seek(SeekFrom::Start(60)).unwrap();
        let mut buf = [0u8; 32];
        // Only 4 bytes remain in section 0.
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &source.data[60..64]);
        assert_eq!(stream.offset(), 64);

        stream.close();
    }

    #[tokio::test]
    async fn seek_matches_direct_reads() {
        let set = small_set();
        let source = MemSource::new(1000, 64, 3);
        let mut stream = set.new_stream(source.clone(), 0);

        for &target in &[0u64, 63, 64, 500, 999] {
            stream.seek(SeekFrom::Start(target)).unwrap();
            let mut buf = [0u8; 10];
            let n = stream.read(&mut buf).await.unwrap();
            let want = &source.data[target as usize..(target as usize + n)];
            assert_eq!(&buf[..n], want, "offset {target}");
        }

        stream.close();
    }

    #[tokio::test]
    async fn seek_end_is_distance_before_end() {
        let set = small_set();
        let source = MemSource::new(1000, 64, 4);
        let mut stream = set.new_stream(source.clone(), 0);

        assert_eq!(stream.seek(SeekFrom::End(100)).unwrap(), 900);
        let mut buf = [0u8; 50];
        let mut got = Vec::new();
        while got.len() < 50 {
            let n = stream.read(&mut buf[..50 - got.len()]).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got[..], &source.data[900..950]);

        assert!(matches!(stream.seek(SeekFrom::End(1001)), Err(Error::InvalidArgument(_))));
        assert_eq!(stream.seek(SeekFrom::End(0)).unwrap(), 1000);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        stream.close();
    }

    #[tokio::test]
    async fn seek_rejects_out_of_range() {
        let set = small_set();
        let mut stream = set.new_stream(MemSource::new(1000, 64, 5), 0);

        assert!(matches!(stream.seek(SeekFrom::Start(1001)), Err(Error::InvalidArgument(_))));
        assert!(matches!(stream.seek(SeekFrom::Current(-1)), Err(Error::InvalidArgument(_))));
        stream.seek(SeekFrom::Start(990)).unwrap();
        assert!(matches!(stream.seek(SeekFrom::Current(11)), Err(Error::InvalidArgument(_))));
        assert!(matches!(stream.seek(SeekFrom::End(-1)), Err(Error::InvalidArgument(_))));
        // A failed seek leaves the offset where it was.
        assert_eq!(stream.offset(), 990);
        stream.seek(SeekFrom::Current(10)).unwrap();
        assert_eq!(stream.offset(), 1000);

        stream.close();
    }

    #[tokio::test]
    async fn lru_walk_releases_old_sections() {
        let set = small_set();
        let source = MemSource::new(400, 64, 6);
        let mut stream = set.new_stream(source.clone(), 0);
        let buffer = stream.buffer_for_tests();

        // Walk the read head forward one section at a time.
        for offset in [0u64, 64, 128, 192, 256, 320] {
            stream.seek(SeekFrom::Start(offset)).unwrap();
        }

        // Capacity is 256/64 = 4 sections; after preparing 5 and 6 the
        // earliest sections must have been released.
        assert!(buffer.section(0).is_none());
        assert!(buffer.section(1).is_none());
        assert!(buffer.section(4).is_some());
        assert!(buffer.section(5).is_some());

        // Refcount bookkeeping matches the LRU contents exactly.
        let total: u64 = buffer.section_refcounts().iter().map(|(_, c)| c).sum();
        assert_eq!(total as usize, stream.lru_len());

        stream.close();
        assert_eq!(source.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drop_cleans_up() {
        let set = small_set();
        let source = MemSource::new(256, 64, 7);
        let mut stream = set.new_stream(source.clone(), 0);
        stream.close();
        stream.close();
        drop(stream);
        assert_eq!(source.closes.load(std::sync::atomic::Ordering::SeqCst), 1);

        let source2 = MemSource::new(256, 64, 8);
        {
            let _stream = set.new_stream(source2.clone(), 0);
            // Dropped without an explicit close.
        }
        assert_eq!(source2.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn initial_offset_is_honored() {
        let set = small_set();
        let source = MemSource::new(1000, 64, 9);
        let mut stream = set.new_stream(source.clone(), 130);
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &source.data[130..138]);
        stream.close();
    }
}
