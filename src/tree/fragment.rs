//! # Fragmented Keys and Values
//!
//! Entries that do not fit inline in a node are stored out of line as a
//! chain of dedicated fragment pages. The entry then carries a compact
//! descriptor instead of the bytes:
//!
//! ```text
//! +------------------+
//! | full_len (8B LE) |
//! | page id (8B LE)  |  ceil(full_len / page_size) direct pointers
//! | page id (8B LE)  |
//! | ...              |
//! +------------------+
//! ```
//!
//! Only direct pointer chains are produced. Indirect chains (a pointer page
//! of pointers) are rejected on read; the descriptor length bounds them
//! out of existence at supported page sizes.
//!
//! Fragment pages are raw data, written once when the entry is created and
//! freed when the entry is deleted or overwritten. Compaction migrates
//! fragment pages that sit above the compaction threshold by rewriting
//! them at freshly allocated (lower) ids and patching the descriptor in
//! place under the owning leaf's exclusive latch.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::store::{FreeList, PageFile};

/// Out-of-line storage for fragmented keys and values.
#[derive(Clone)]
pub struct FragmentStore {
    file: Arc<PageFile>,
    freelist: Arc<FreeList>,
    page_size: usize,
}

impl FragmentStore {
    pub fn new(file: Arc<PageFile>, freelist: Arc<FreeList>) -> Self {
        let page_size = file.page_size();
        Self {
            file,
            freelist,
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of descriptor bytes needed to fragment `len` bytes.
    pub fn descriptor_len(&self, len: usize) -> usize {
        8 + len.div_ceil(self.page_size) * 8
    }

    /// Writes `data` into freshly allocated fragment pages and returns the
    /// descriptor.
    pub fn write(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut descriptor = Vec::with_capacity(self.descriptor_len(data.len()));
        descriptor.extend_from_slice(&(data.len() as u64).to_le_bytes());

        let mut page = vec![0u8; self.page_size];
        for chunk in data.chunks(self.page_size) {
            let id = self.freelist.allocate();
            page[..chunk.len()].copy_from_slice(chunk);
            page[chunk.len()..].fill(0);
            self.file.write_page(id, &page)?;
            descriptor.extend_from_slice(&id.to_le_bytes());
        }
        Ok(descriptor)
    }

    /// Full length recorded in a descriptor.
    pub fn full_length(descriptor: &[u8]) -> Result<u64> {
        ensure!(descriptor.len() >= 8, "fragment descriptor truncated");
        Ok(u64::from_le_bytes(descriptor[0..8].try_into().unwrap()))
    }

    fn page_ids(descriptor: &[u8]) -> Result<(u64, &[u8])> {
        let len = Self::full_length(descriptor)?;
        let ids = &descriptor[8..];
        ensure!(
            ids.len() % 8 == 0,
            "fragment descriptor has a partial page id"
        );
        Ok((len, ids))
    }

    /// Reads the entire fragmented entry back.
    pub fn read(&self, descriptor: &[u8]) -> Result<Vec<u8>> {
        let (len, ids) = Self::page_ids(descriptor)?;
        let expected = (len as usize).div_ceil(self.page_size);
        ensure!(
            ids.len() / 8 == expected,
            "fragment descriptor lists {} pages, expected {}",
            ids.len() / 8,
            expected
        );

        let mut out = Vec::with_capacity(len as usize);
        let mut page = vec![0u8; self.page_size];
        let mut remaining = len as usize;
        for id_bytes in ids.chunks_exact(8) {
            let id = u64::from_le_bytes(id_bytes.try_into().unwrap());
            self.file.read_page(id, &mut page)?;
            let take = remaining.min(self.page_size);
            out.extend_from_slice(&page[..take]);
            remaining -= take;
        }
        Ok(out)
    }

    /// Reads `buf.len()` bytes starting at `pos`, returning the number of
    /// bytes read (short at end of value).
    pub fn read_at(&self, descriptor: &[u8], pos: u64, buf: &mut [u8]) -> Result<usize> {
        let (len, ids) = Self::page_ids(descriptor)?;
        if pos >= len {
            return Ok(0);
        }
        let mut page = vec![0u8; self.page_size];
        let mut copied = 0usize;
        let want = buf.len().min((len - pos) as usize);
        let mut at = pos as usize;
        while copied < want {
            let page_index = at / self.page_size;
            let within = at % self.page_size;
            let id_off = page_index * 8;
            ensure!(id_off + 8 <= ids.len(), "fragment descriptor truncated");
            let id = u64::from_le_bytes(ids[id_off..id_off + 8].try_into().unwrap());
            self.file.read_page(id, &mut page)?;
            let take = (self.page_size - within).min(want - copied);
            buf[copied..copied + take].copy_from_slice(&page[within..within + take]);
            copied += take;
            at += take;
        }
        Ok(copied)
    }

    /// Releases every fragment page named by the descriptor.
    pub fn free(&self, descriptor: &[u8]) -> Result<()> {
        let (_, ids) = Self::page_ids(descriptor)?;
        for id_bytes in ids.chunks_exact(8) {
            let id = u64::from_le_bytes(id_bytes.try_into().unwrap());
            self.freelist.release(id);
        }
        Ok(())
    }

    /// Rewrites every fragment page whose id exceeds `highest_id` at a
    /// freshly allocated id, patching the descriptor in place. Returns true
    /// if any page moved. Used by compaction; the caller holds the owning
    /// leaf exclusively latched.
    pub fn touch_above(&self, descriptor: &mut [u8], highest_id: u64) -> Result<bool> {
        ensure!(descriptor.len() >= 8, "fragment descriptor truncated");
        let mut moved = false;
        let mut page = vec![0u8; self.page_size];
        let ids = &mut descriptor[8..];
        for id_bytes in ids.chunks_exact_mut(8) {
            let id = u64::from_le_bytes((&*id_bytes).try_into().unwrap());
            if id <= highest_id {
                continue;
            }
            let new_id = self.freelist.allocate();
            self.file.read_page(id, &mut page)?;
            self.file.write_page(new_id, &page)?;
            self.freelist.release(id);
            id_bytes.copy_from_slice(&new_id.to_le_bytes());
            moved = true;
        }
        Ok(moved)
    }

    /// Highest fragment page id named by the descriptor.
    pub fn highest_page_id(descriptor: &[u8]) -> Result<u64> {
        let (_, ids) = Self::page_ids(descriptor)?;
        let mut highest = 0;
        for id_bytes in ids.chunks_exact(8) {
            highest = highest.max(u64::from_le_bytes(id_bytes.try_into().unwrap()));
        }
        Ok(highest)
    }
}

/// Read-only streaming access to a (possibly fragmented) value addressed by
/// a descriptor. Set-length and positional writes are not supported; the
/// only write-shaped operation is the compaction touch on [`FragmentStore`].
pub struct ValueStream<'a> {
    store: &'a FragmentStore,
    descriptor: &'a [u8],
}

impl<'a> ValueStream<'a> {
    pub fn new(store: &'a FragmentStore, descriptor: &'a [u8]) -> Self {
        Self { store, descriptor }
    }

    pub fn length(&self) -> Result<u64> {
        FragmentStore::full_length(self.descriptor)
    }

    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.store.read_at(self.descriptor, pos, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, FragmentStore) {
        let dir = tempdir().unwrap();
        let file = Arc::new(PageFile::create(&dir.path().join("frag.burrow"), 256).unwrap());
        let freelist = Arc::new(FreeList::new(1));
        (dir, FragmentStore::new(file, freelist))
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, store) = store();
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let descriptor = store.write(&data).unwrap();
        assert_eq!(FragmentStore::full_length(&descriptor).unwrap(), 1000);
        assert_eq!(store.read(&descriptor).unwrap(), data);
    }

    #[test]
    fn read_at_spans_page_boundaries() {
        let (_dir, store) = store();
        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let descriptor = store.write(&data).unwrap();

        let mut buf = vec![0u8; 100];
        let n = store.read_at(&descriptor, 200, &mut buf).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..], &data[200..300]);

        // Short read at the tail.
        let n = store.read_at(&descriptor, 550, &mut buf).unwrap();
        assert_eq!(n, 50);
        assert_eq!(&buf[..50], &data[550..600]);
    }

    #[test]
    fn touch_above_moves_high_pages() {
        let (_dir, store) = store();
        let data = vec![0x5A; 700];
        let mut descriptor = store.write(&data).unwrap();
        let highest = FragmentStore::highest_page_id(&descriptor).unwrap();
        assert!(highest >= 3);

        // Free nothing: the allocator hands out fresh ids past the end, so
        // a threshold of zero forces every page to move.
        let moved = store.touch_above(&mut descriptor, 0).unwrap();
        assert!(moved);
        assert_eq!(store.read(&descriptor).unwrap(), data);

        // All pages already above nothing to do at u64::MAX.
        let moved = store.touch_above(&mut descriptor, u64::MAX).unwrap();
        assert!(!moved);
    }

    #[test]
    fn value_stream_reports_length() {
        let (_dir, store) = store();
        let data = vec![7u8; 300];
        let descriptor = store.write(&data).unwrap();
        let stream = ValueStream::new(&store, &descriptor);
        assert_eq!(stream.length().unwrap(), 300);
        let mut buf = vec![0u8; 300];
        assert_eq!(stream.read(0, &mut buf).unwrap(), 300);
        assert_eq!(buf, data);
    }
}
