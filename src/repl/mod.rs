//! # Replication Interface
//!
//! The engine replicates by streaming its redo log through a
//! [`ReplicationManager`]. Positions are 64-bit, non-negative, and
//! non-decreasing; a replica confirms durability up to a position, and the
//! engine awaits confirmation outside latches and the commit lock.
//!
//! The manager is supplied programmatically through the database builder;
//! the engine never constructs one itself. [`LoopbackReplica`] is an
//! in-memory implementation used by tests and by embedders that want the
//! interface without a transport.

use eyre::Result;
use parking_lot::{Condvar, Mutex};

/// Transport-side interface for transactional replay. Timeouts are
/// nanoseconds, `-1` meaning infinite.
pub trait ReplicationManager: Send + Sync {
    /// Starts replication at the given log position.
    fn start(&self, position: u64) -> Result<()>;

    /// Position the next read will observe.
    fn read_position(&self) -> u64;

    /// Position the next write will be assigned.
    fn write_position(&self) -> u64;

    /// Reads replicated bytes; `Ok(None)` signals a leadership change and
    /// the end of the readable stream.
    fn read(&self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Switches from reading (replica) to writing (leader).
    fn flip(&self) -> Result<()>;

    /// Appends bytes to the replication stream.
    fn write(&self, buf: &[u8]) -> Result<()>;

    /// Commits buffered writes, returning the confirmation position.
    fn commit(&self) -> Result<u64>;

    /// Waits until the stream is confirmed through `position`.
    fn confirm(&self, position: u64, timeout_nanos: i64) -> Result<bool>;

    /// Flushes buffered writes without waiting for confirmation.
    fn sync(&self) -> Result<()>;

    /// Flushes and waits for confirmation through `position`.
    fn sync_confirm(&self, position: u64, timeout_nanos: i64) -> Result<bool> {
        self.sync()?;
        self.confirm(position, timeout_nanos)
    }
}

#[derive(Default)]
struct LoopbackState {
    log: Vec<u8>,
    read_position: u64,
    confirmed: u64,
    writable: bool,
}

/// In-memory replication manager: everything written is immediately
/// readable and confirmable. Useful for tests and single-process setups.
#[derive(Default)]
pub struct LoopbackReplica {
    state: Mutex<LoopbackState>,
    cond: Condvar,
}

impl LoopbackReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes written, for assertions.
    pub fn written_len(&self) -> usize {
        self.state.lock().log.len()
    }
}

impl ReplicationManager for LoopbackReplica {
    fn start(&self, position: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.read_position = position.min(state.log.len() as u64);
        Ok(())
    }

    fn read_position(&self) -> u64 {
        self.state.lock().read_position
    }

    fn write_position(&self) -> u64 {
        self.state.lock().log.len() as u64
    }

    fn read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut state = self.state.lock();
        if state.writable {
            // Leadership changed: readers are done.
            return Ok(None);
        }
        let at = state.read_position as usize;
        let available = state.log.len().saturating_sub(at);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&state.log[at..at + n]);
        state.read_position += n as u64;
        Ok(Some(n))
    }

    fn flip(&self) -> Result<()> {
        self.state.lock().writable = true;
        Ok(())
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.log.extend_from_slice(buf);
        Ok(())
    }

    fn commit(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.confirmed = state.log.len() as u64;
        let position = state.confirmed;
        drop(state);
        self.cond.notify_all();
        Ok(position)
    }

    fn confirm(&self, position: u64, timeout_nanos: i64) -> Result<bool> {
        let mut state = self.state.lock();
        // Loopback confirms synchronously on commit.
        if state.confirmed < position && state.log.len() as u64 >= position {
            state.confirmed = state.log.len() as u64;
        }
        if state.confirmed >= position {
            return Ok(true);
        }
        if timeout_nanos == 0 {
            return Ok(false);
        }
        let deadline = if timeout_nanos < 0 {
            None
        } else {
            Some(std::time::Instant::now() + std::time::Duration::from_nanos(timeout_nanos as u64))
        };
        loop {
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.confirmed >= position);
                    }
                }
            }
            if state.confirmed >= position {
                return Ok(true);
            }
        }
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let replica = LoopbackReplica::new();
        replica.write(b"hello").unwrap();
        replica.write(b" world").unwrap();
        assert_eq!(replica.write_position(), 11);

        replica.start(0).unwrap();
        let mut buf = [0u8; 16];
        let n = replica.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(replica.read_position(), 11);
    }

    #[test]
    fn flip_ends_the_read_stream() {
        let replica = LoopbackReplica::new();
        replica.write(b"x").unwrap();
        replica.flip().unwrap();
        let mut buf = [0u8; 4];
        assert!(replica.read(&mut buf).unwrap().is_none());
    }

    #[test]
    fn commit_confirms_positions() {
        let replica = LoopbackReplica::new();
        replica.write(b"abc").unwrap();
        let position = replica.commit().unwrap();
        assert_eq!(position, 3);
        assert!(replica.confirm(position, 0).unwrap());
        assert!(replica.sync_confirm(position, -1).unwrap());
    }
}
