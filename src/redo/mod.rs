//! # Redo Log
//!
//! Append-only record log providing durability for stores and deletes.
//! Appends happen under the exclusive leaf latch plus the shared commit
//! lock, which gives durable writes a total order; the returned position
//! (the byte offset just past the record) is awaited *outside* latches and
//! the commit lock via [`RedoLog::commit_sync`].
//!
//! ## Record Format
//!
//! ```text
//! +--------------------+
//! | kind (1B)          |  store / delete / txn-store / txn-delete /
//! | reserved (7B)      |  commit / rollback
//! | txn_id (8B LE)     |  0 for autocommit records
//! | tree_id (8B LE)    |
//! | key_len (4B LE)    |
//! | value_len (4B LE)  |  u32::MAX encodes "no value" (delete)
//! | crc (8B LE)        |  CRC-64/ECMA over header fields + payload
//! +--------------------+
//! | key bytes          |
//! | value bytes        |
//! +--------------------+
//! ```
//!
//! ## Group commit
//!
//! Writers append under a mutex and then wait for durability to their
//! position. The first waiter past the durable horizon performs one
//! `sync_data` on behalf of the whole group.
//!
//! ## Recovery
//!
//! Recovery scans from the checkpoint's recorded position. Autocommit
//! records apply immediately; transactional records are staged and applied
//! at their commit record. A corrupt or truncated record ends the scan —
//! that is the normal crash boundary, not an error.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::repl::ReplicationManager;
use crate::txn::DurabilityMode;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const RECORD_HEADER_SIZE: usize = 40;
const NO_VALUE: u32 = u32::MAX;

pub const KIND_STORE: u8 = 1;
pub const KIND_TXN_STORE: u8 = 2;
pub const KIND_COMMIT: u8 = 3;
pub const KIND_ROLLBACK: u8 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RecordHeader {
    kind: u8,
    reserved: [u8; 7],
    txn_id: U64,
    tree_id: U64,
    key_len: U32,
    value_len: U32,
    crc: U64,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

fn record_crc(header: &RecordHeader, key: &[u8], value: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&[header.kind]);
    digest.update(&header.txn_id.get().to_le_bytes());
    digest.update(&header.tree_id.get().to_le_bytes());
    digest.update(&header.key_len.get().to_le_bytes());
    digest.update(&header.value_len.get().to_le_bytes());
    digest.update(key);
    digest.update(value);
    digest.finalize()
}

/// One recovered operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoOp {
    pub tree_id: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

struct Writer {
    file: File,
    /// End-of-log position: offset just past the last appended record.
    position: u64,
}

struct SyncState {
    durable_position: u64,
    syncing: bool,
}

pub struct RedoLog {
    writer: Mutex<Writer>,
    sync_state: Mutex<SyncState>,
    sync_cond: Condvar,
    durability: DurabilityMode,
    replication: Option<Arc<dyn ReplicationManager>>,
}

impl RedoLog {
    pub fn open(
        path: &Path,
        durability: DurabilityMode,
        replication: Option<Arc<dyn ReplicationManager>>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open redo log '{}'", path.display()))?;
        let position = file.seek(SeekFrom::End(0)).wrap_err("failed to seek redo log")?;

        Ok(Self {
            writer: Mutex::new(Writer { file, position }),
            sync_state: Mutex::new(SyncState {
                durable_position: position,
                syncing: false,
            }),
            sync_cond: Condvar::new(),
            durability,
            replication,
        })
    }

    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// End-of-log position.
    pub fn position(&self) -> u64 {
        self.writer.lock().position
    }

    /// Durable horizon for checkpoint headers.
    pub fn durable_position(&self) -> u64 {
        if self.durability == DurabilityMode::Sync {
            self.sync_state.lock().durable_position
        } else {
            self.position()
        }
    }

    fn append(
        &self,
        kind: u8,
        txn_id: u64,
        tree_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<u64> {
        if self.durability == DurabilityMode::NoRedo {
            return Ok(0);
        }

        let value_bytes = value.unwrap_or(&[]);
        let mut header = RecordHeader {
            kind,
            reserved: [0; 7],
            txn_id: U64::new(txn_id),
            tree_id: U64::new(tree_id),
            key_len: U32::new(key.len() as u32),
            value_len: U32::new(match value {
                Some(v) => v.len() as u32,
                None => NO_VALUE,
            }),
            crc: U64::new(0),
        };
        header.crc = U64::new(record_crc(&header, key, value_bytes));

        let mut writer = self.writer.lock();
        writer
            .file
            .write_all(header.as_bytes())
            .wrap_err("failed to append redo header")?;
        writer.file.write_all(key).wrap_err("failed to append redo key")?;
        writer
            .file
            .write_all(value_bytes)
            .wrap_err("failed to append redo value")?;
        writer.position += (RECORD_HEADER_SIZE + key.len() + value_bytes.len()) as u64;
        let position = writer.position;

        if let Some(repl) = &self.replication {
            let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + value_bytes.len());
            buf.extend_from_slice(header.as_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(value_bytes);
            repl.write(&buf)?;
        }

        Ok(position)
    }

    /// Appends an autocommit store (`value` None deletes) and returns the
    /// position to await.
    pub fn store(&self, tree_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        self.append(KIND_STORE, 0, tree_id, key, value)
    }

    /// Appends a transactional store; durability is awaited at commit.
    pub fn txn_store(&self, txn_id: u64, tree_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        self.append(KIND_TXN_STORE, txn_id, tree_id, key, value)
    }

    pub fn txn_commit(&self, txn_id: u64) -> Result<u64> {
        self.append(KIND_COMMIT, txn_id, 0, &[], None)
    }

    pub fn txn_rollback(&self, txn_id: u64) -> Result<u64> {
        self.append(KIND_ROLLBACK, txn_id, 0, &[], None)
    }

    /// Waits until the log is durable through `position`. The first waiter
    /// past the horizon syncs for the whole group. Never called while a
    /// latch or the commit lock is held.
    pub fn commit_sync(&self, position: u64) -> Result<()> {
        if position == 0 || self.durability != DurabilityMode::Sync {
            return Ok(());
        }

        let mut state = self.sync_state.lock();
        loop {
            if state.durable_position >= position {
                if let Some(repl) = &self.replication {
                    drop(state);
                    repl.sync_confirm(position, -1)?;
                    return Ok(());
                }
                return Ok(());
            }
            if state.syncing {
                self.sync_cond.wait(&mut state);
                continue;
            }
            state.syncing = true;
            drop(state);

            // Sync everything appended so far on behalf of the group.
            let target = {
                let writer = self.writer.lock();
                writer.file.sync_data().wrap_err("failed to sync redo log")?;
                writer.position
            };

            state = self.sync_state.lock();
            state.syncing = false;
            if target > state.durable_position {
                state.durable_position = target;
            }
            self.sync_cond.notify_all();
        }
    }

    /// Scans records from `from` and feeds committed operations to
    /// `apply`: autocommit records immediately, transactional records at
    /// their commit record. Returns the end-of-scan position.
    pub fn recover(
        path: &Path,
        from: u64,
        mut apply: impl FnMut(RedoOp) -> Result<()>,
    ) -> Result<u64> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return Ok(from),
        };
        let len = file.metadata().wrap_err("failed to stat redo log")?.len();
        ensure!(
            from <= len,
            "redo position {} beyond log length {}",
            from,
            len
        );
        file.seek(SeekFrom::Start(from)).wrap_err("failed to seek redo log")?;

        let mut staged: HashMap<u64, Vec<RedoOp>> = HashMap::new();
        let mut position = from;
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];

        loop {
            match file.read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(_) => break,
            }
            let header = match RecordHeader::read_from_bytes(&header_buf) {
                Ok(header) => header,
                Err(_) => break,
            };
            let key_len = header.key_len.get() as usize;
            let value_len = header.value_len.get();
            let payload_len = key_len
                + if value_len == NO_VALUE {
                    0
                } else {
                    value_len as usize
                };

            let mut payload = vec![0u8; payload_len];
            if file.read_exact(&mut payload).is_err() {
                break;
            }
            let (key, value_bytes) = payload.split_at(key_len);
            if record_crc(&header, key, value_bytes) != header.crc.get() {
                break;
            }
            position += (RECORD_HEADER_SIZE + payload_len) as u64;

            let value = if value_len == NO_VALUE {
                None
            } else {
                Some(value_bytes.to_vec())
            };
            let op = RedoOp {
                tree_id: header.tree_id.get(),
                key: key.to_vec(),
                value,
            };

            match header.kind {
                KIND_STORE => apply(op)?,
                KIND_TXN_STORE => staged.entry(header.txn_id.get()).or_default().push(op),
                KIND_COMMIT => {
                    if let Some(ops) = staged.remove(&header.txn_id.get()) {
                        for op in ops {
                            apply(op)?;
                        }
                    }
                }
                KIND_ROLLBACK => {
                    staged.remove(&header.txn_id.get());
                }
                _ => break,
            }
        }

        // Uncommitted staged transactions are discarded: their locks died
        // with the crash and their undo was never needed.
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn autocommit_records_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::open(&path, DurabilityMode::Sync, None).unwrap();

        let p1 = log.store(1, b"a", Some(b"1")).unwrap();
        let p2 = log.store(1, b"b", None).unwrap();
        assert!(p2 > p1);
        log.commit_sync(p2).unwrap();
        drop(log);

        let mut ops = Vec::new();
        let end = RedoLog::recover(&path, 0, |op| {
            ops.push(op);
            Ok(())
        })
        .unwrap();
        assert_eq!(end, p2);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].key, b"a");
        assert_eq!(ops[0].value.as_deref(), Some(b"1" as &[u8]));
        assert_eq!(ops[1].key, b"b");
        assert_eq!(ops[1].value, None);
    }

    #[test]
    fn transactional_records_wait_for_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::open(&path, DurabilityMode::Sync, None).unwrap();

        log.txn_store(7, 1, b"x", Some(b"1")).unwrap();
        log.txn_store(8, 1, b"y", Some(b"2")).unwrap();
        log.txn_commit(7).unwrap();
        // Txn 8 never commits.
        drop(log);

        let mut ops = Vec::new();
        RedoLog::recover(&path, 0, |op| {
            ops.push(op);
            Ok(())
        })
        .unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].key, b"x");
    }

    #[test]
    fn rollback_discards_staged_ops() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::open(&path, DurabilityMode::Sync, None).unwrap();

        log.txn_store(7, 1, b"x", Some(b"1")).unwrap();
        log.txn_rollback(7).unwrap();
        drop(log);

        let mut count = 0;
        RedoLog::recover(&path, 0, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn truncated_tail_ends_the_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::open(&path, DurabilityMode::Sync, None).unwrap();
        let p1 = log.store(1, b"a", Some(b"1")).unwrap();
        log.store(1, b"b", Some(b"2")).unwrap();
        drop(log);

        // Chop the last record in half.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(p1 + 10).unwrap();

        let mut ops = Vec::new();
        let end = RedoLog::recover(&path, 0, |op| {
            ops.push(op);
            Ok(())
        })
        .unwrap();
        assert_eq!(end, p1);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn no_redo_mode_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::open(&path, DurabilityMode::NoRedo, None).unwrap();
        assert_eq!(log.store(1, b"a", Some(b"1")).unwrap(), 0);
        assert_eq!(log.position(), 0);
    }
}
