//! # Memory-Mapped Page File
//!
//! A single file of fixed-size pages. Page 0 carries the 128-byte database
//! header; data pages start at id 1. The file is memory-mapped and grown by
//! remapping; all access copies whole pages between the map and caller
//! buffers, so no reference into the map ever outlives the lock that
//! guards remapping.
//!
//! ## Header Layout
//!
//! The header is a zerocopy struct with little-endian fields:
//!
//! ```text
//! +------------------+
//! | magic (16B)      |  "BurrowDB KV v1\0\0"
//! | version (4B)     |
//! | page_size (4B)   |
//! | page_count (8B)  |  allocated pages, including page 0
//! | root_id (8B)     |  tree root page id
//! | freelist_head(8B)|  first chained freelist page, 0 if none
//! | redo_position(8B)|  redo log position covered by this checkpoint
//! | commit_state (1B)|  dirty generation in effect at the checkpoint
//! | reserved         |
//! +------------------+
//! ```
//!
//! Header publication is the commit point of a checkpoint: data pages and
//! freelist pages are written and synced first, then the header is written
//! and synced.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const DB_MAGIC: &[u8; 16] = b"BurrowDB KV v1\x00\x00";
pub const CURRENT_VERSION: u32 = 1;
pub const DB_HEADER_SIZE: usize = 128;

/// Page id of the header page. Never allocated to the tree.
pub const HEADER_PAGE_ID: u64 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    page_count: U64,
    root_id: U64,
    freelist_head: U64,
    redo_position: U64,
    commit_state: u8,
    reserved: [u8; 71],
}

const _: () = assert!(std::mem::size_of::<DbHeader>() == DB_HEADER_SIZE);

impl DbHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: *DB_MAGIC,
            version: U32::new(CURRENT_VERSION),
            page_size: U32::new(page_size),
            page_count: U64::new(1),
            root_id: U64::new(0),
            freelist_head: U64::new(0),
            redo_position: U64::new(0),
            commit_state: 0,
            reserved: [0u8; 71],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= DB_HEADER_SIZE,
            "buffer too small for database header: {} < {}",
            bytes.len(),
            DB_HEADER_SIZE
        );
        let header = Self::read_from_bytes(&bytes[..DB_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse database header: {:?}", e))?;
        ensure!(&header.magic == DB_MAGIC, "invalid magic bytes in header");
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "unsupported database version: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );
        Ok(header)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.get()
    }

    pub fn set_page_count(&mut self, count: u64) {
        self.page_count = U64::new(count);
    }

    pub fn root_id(&self) -> u64 {
        self.root_id.get()
    }

    pub fn set_root_id(&mut self, id: u64) {
        self.root_id = U64::new(id);
    }

    pub fn freelist_head(&self) -> u64 {
        self.freelist_head.get()
    }

    pub fn set_freelist_head(&mut self, id: u64) {
        self.freelist_head = U64::new(id);
    }

    pub fn redo_position(&self) -> u64 {
        self.redo_position.get()
    }

    pub fn set_redo_position(&mut self, pos: u64) {
        self.redo_position = U64::new(pos);
    }

    pub fn commit_state(&self) -> u8 {
        self.commit_state
    }

    pub fn set_commit_state(&mut self, state: u8) {
        self.commit_state = state;
    }
}

struct Mapping {
    file: std::fs::File,
    mmap: MmapMut,
    page_count: u64,
}

pub struct PageFile {
    page_size: usize,
    mapping: RwLock<Mapping>,
}

impl PageFile {
    /// Creates a new page file containing only a fresh header page.
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file '{}'", path.display()))?;

        file.set_len(page_size as u64)
            .wrap_err("failed to size new page file")?;

        // SAFETY: the file was just created with read+write access and sized
        // to one full page. The map is only reachable through the RwLock in
        // this struct; remapping in grow() takes the write lock, so no slice
        // into the map can outlive the mapping it came from.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = DbHeader::new(page_size as u32);
        mmap[..DB_HEADER_SIZE].copy_from_slice(header.as_bytes());
        mmap.flush().wrap_err("failed to flush new header")?;

        Ok(Self {
            page_size,
            mapping: RwLock::new(Mapping {
                file,
                mmap,
                page_count: 1,
            }),
        })
    }

    /// Opens an existing page file, validating the header.
    pub fn open(path: &Path) -> Result<(Self, DbHeader)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file '{}'", path.display()))?;

        let file_size = file.metadata().wrap_err("failed to stat page file")?.len();
        ensure!(file_size > 0, "page file '{}' is empty", path.display());

        // SAFETY: same reasoning as in create(); the map lives behind the
        // RwLock and every access copies page bytes under that lock.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = DbHeader::from_bytes(&mmap[..DB_HEADER_SIZE])?;
        let page_size = header.page_size() as usize;

        ensure!(
            file_size % page_size as u64 == 0,
            "page file size {} is not a multiple of page size {}",
            file_size,
            page_size
        );

        let page_count = (file_size / page_size as u64).max(header.page_count());

        Ok((
            Self {
                page_size,
                mapping: RwLock::new(Mapping {
                    file,
                    mmap,
                    page_count,
                }),
            },
            header,
        ))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.mapping.read().page_count
    }

    /// Copies the page into `buf`, which must be exactly one page long.
    pub fn read_page(&self, id: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(buf.len() == self.page_size, "read buffer is not page-sized");
        let mapping = self.mapping.read();
        ensure!(
            id < mapping.page_count,
            "page {} out of bounds (page_count={})",
            id,
            mapping.page_count
        );
        let offset = id as usize * self.page_size;
        buf.copy_from_slice(&mapping.mmap[offset..offset + self.page_size]);
        Ok(())
    }

    /// Copies `buf` into the page, growing the file as needed.
    pub fn write_page(&self, id: u64, buf: &[u8]) -> Result<()> {
        ensure!(buf.len() == self.page_size, "write buffer is not page-sized");
        {
            let mapping = self.mapping.read();
            if id < mapping.page_count {
                let offset = id as usize * self.page_size;
                // SAFETY: the mmap region for this page is exclusively ours
                // by the caller's protocol: a page id is written either by
                // the checkpointer (holding the node latch shared and the
                // id uniquely) or during recovery (single-threaded). The
                // read lock only protects against concurrent remapping.
                unsafe {
                    let dst = mapping.mmap.as_ptr().add(offset) as *mut u8;
                    std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, self.page_size);
                }
                return Ok(());
            }
        }
        self.grow(id + 1)?;
        self.write_page(id, buf)
    }

    /// Extends the file to hold at least `new_page_count` pages.
    pub fn grow(&self, new_page_count: u64) -> Result<()> {
        let mut guard = self.mapping.write();
        let mapping = &mut *guard;
        if new_page_count <= mapping.page_count {
            return Ok(());
        }
        // Grow in chunks to amortize remapping.
        let target = new_page_count.max(mapping.page_count + (mapping.page_count / 2).max(8));
        let new_size = target * self.page_size as u64;

        mapping
            .mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;
        mapping
            .file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend page file to {} bytes", new_size))?;

        // SAFETY: the write lock excludes all readers, so no slice into the
        // old map exists; the old map is dropped on reassignment.
        mapping.mmap = unsafe {
            MmapMut::map_mut(&mapping.file).wrap_err("failed to remap page file after grow")?
        };
        mapping.page_count = target;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mapping
            .read()
            .mmap
            .flush()
            .wrap_err("failed to sync page file")
    }

    /// Reads the current on-disk header.
    pub fn read_header(&self) -> Result<DbHeader> {
        let mapping = self.mapping.read();
        DbHeader::from_bytes(&mapping.mmap[..DB_HEADER_SIZE])
    }

    /// Writes and syncs the header. This is the checkpoint commit point.
    pub fn publish_header(&self, header: &DbHeader) -> Result<()> {
        {
            let mapping = self.mapping.read();
            // SAFETY: header bytes are only published by the checkpointer,
            // which is serialized by the commit lock; the read lock protects
            // against remapping only.
            unsafe {
                let dst = mapping.mmap.as_ptr() as *mut u8;
                std::ptr::copy_nonoverlapping(header.as_bytes().as_ptr(), dst, DB_HEADER_SIZE);
            }
        }
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.burrow");

        let file = PageFile::create(&path, 512).unwrap();
        assert_eq!(file.page_size(), 512);
        assert_eq!(file.page_count(), 1);
        drop(file);

        let (file, header) = PageFile::open(&path).unwrap();
        assert_eq!(header.page_size(), 512);
        assert_eq!(file.page_size(), 512);
    }

    #[test]
    fn write_read_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.burrow");
        let file = PageFile::create(&path, 512).unwrap();

        let page = vec![0xAB; 512];
        file.write_page(3, &page).unwrap();

        let mut out = vec![0u8; 512];
        file.read_page(3, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn header_publish_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.burrow");

        {
            let file = PageFile::create(&path, 512).unwrap();
            let mut header = file.read_header().unwrap();
            header.set_root_id(42);
            header.set_redo_position(1234);
            header.set_page_count(file.page_count());
            file.publish_header(&header).unwrap();
        }

        let (_, header) = PageFile::open(&path).unwrap();
        assert_eq!(header.root_id(), 42);
        assert_eq!(header.redo_position(), 1234);
    }

    #[test]
    fn rejects_wrong_sized_buffers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.burrow");
        let file = PageFile::create(&path, 512).unwrap();

        let mut small = vec![0u8; 100];
        assert!(file.read_page(0, &mut small).is_err());
        assert!(file.write_page(0, &small).is_err());
    }
}
