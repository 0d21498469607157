//! Named, bounded shared-memory channel - one producer, one consumer.
//!
//! A channel is a file in the bus directory (normally `/dev/shm`) mapped by
//! both processes. Layout:
//!
//! ```text
//! 0    magic u32 | capacity u32 | max_msg_len u32
//! 64   head u64   (frames consumed, written by the consumer)
//! 128  tail u64   (frames produced, written by the producer)
//! 192  capacity × slot { len u32 | bytes[max_msg_len] }
//! ```
//!
//! The producer publishes a slot by bumping `tail` with Release after the
//! bytes are in place; the consumer frees it by bumping `head` the same way.

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::core::{Error, Result};

const MAGIC: u32 = 0x4255_5331; // "BUS1"
const HEAD_OFFSET: usize = 64;
const TAIL_OFFSET: usize = 128;
const SLOTS_OFFSET: usize = 192;
const LEN_PREFIX: usize = 4;
const IDLE_BACKOFF: Duration = Duration::from_micros(200);

fn slot_stride(max_msg_len: usize) -> usize {
    (LEN_PREFIX + max_msg_len + 7) & !7
}

fn file_len(capacity: usize, max_msg_len: usize) -> usize {
    SLOTS_OFFSET + capacity * slot_stride(max_msg_len)
}

fn channel_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'));
    if !valid {
        return Err(Error::ChannelName(name.to_string()));
    }
    Ok(dir.join(name))
}

pub struct ShmChannel {
    name: String,
    path: PathBuf,
    mmap: MmapMut,
    capacity: usize,
    max_msg_len: usize,
}

impl ShmChannel {
    /// Create a fresh channel, replacing any stale file of the same name.
    pub fn create(dir: &Path, name: &str, capacity: usize, max_msg_len: usize) -> Result<Self> {
        if capacity == 0 || max_msg_len == 0 {
            return Err(Error::Config(format!(
                "channel {} needs non-zero capacity and record size",
                name
            )));
        }
        let path = channel_path(dir, name)?;
        Self::remove_path(&path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(file_len(capacity, max_msg_len) as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        mmap[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        mmap[4..8].copy_from_slice(&(capacity as u32).to_le_bytes());
        mmap[8..12].copy_from_slice(&(max_msg_len as u32).to_le_bytes());

        tracing::debug!(channel = name, capacity, max_msg_len, "bus channel created");
        Ok(Self {
            name: name.to_string(),
            path,
            mmap,
            capacity,
            max_msg_len,
        })
    }

    /// Attach to a channel created by the other side.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = channel_path(dir, name)?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < SLOTS_OFFSET {
            return Err(Error::ChannelCorrupt(name.to_string()));
        }

        let word = |at: usize| u32::from_le_bytes([mmap[at], mmap[at + 1], mmap[at + 2], mmap[at + 3]]);
        let (magic, capacity, max_msg_len) = (word(0), word(4) as usize, word(8) as usize);
        if magic != MAGIC || capacity == 0 || mmap.len() < file_len(capacity, max_msg_len) {
            return Err(Error::ChannelCorrupt(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            path,
            mmap,
            capacity,
            max_msg_len,
        })
    }

    /// Unlink a channel file. Missing files are not an error.
    pub fn remove(dir: &Path, name: &str) -> Result<()> {
        Self::remove_path(&channel_path(dir, name)?)
    }

    fn remove_path(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[inline(always)]
    fn counter(&self, offset: usize) -> &AtomicU64 {
        // The mapping is page aligned and both offsets are multiples of 64.
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn slot_offset(&self, seq: u64) -> usize {
        SLOTS_OFFSET + (seq % self.capacity as u64) as usize * slot_stride(self.max_msg_len)
    }

    /// Queue one frame. Never blocks.
    pub fn try_send(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_msg_len {
            return Err(Error::FrameTooLarge {
                len: frame.len(),
                max: self.max_msg_len,
            });
        }
        let head = self.counter(HEAD_OFFSET).load(Ordering::Acquire);
        let tail = self.counter(TAIL_OFFSET).load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= self.capacity as u64 {
            return Err(Error::ChannelFull(self.name.clone()));
        }

        let at = self.slot_offset(tail);
        self.mmap[at..at + LEN_PREFIX].copy_from_slice(&(frame.len() as u32).to_le_bytes());
        self.mmap[at + LEN_PREFIX..at + LEN_PREFIX + frame.len()].copy_from_slice(frame);

        self.counter(TAIL_OFFSET).store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Take the oldest frame, if any.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        let tail = self.counter(TAIL_OFFSET).load(Ordering::Acquire);
        let head = self.counter(HEAD_OFFSET).load(Ordering::Relaxed);
        if head == tail {
            return None;
        }

        let at = self.slot_offset(head);
        let len = u32::from_le_bytes([
            self.mmap[at],
            self.mmap[at + 1],
            self.mmap[at + 2],
            self.mmap[at + 3],
        ]) as usize;
        let len = len.min(self.max_msg_len);
        let frame = self.mmap[at + LEN_PREFIX..at + LEN_PREFIX + len].to_vec();

        self.counter(HEAD_OFFSET).store(head + 1, Ordering::Release);
        Some(frame)
    }

    /// Wait up to `timeout` for a frame. Returning `None` lets callers
    /// re-check their stop flag, which keeps the receive interruptible.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_recv() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(IDLE_BACKOFF.min(deadline - now));
        }
    }

    /// Frames queued and not yet consumed.
    pub fn len(&self) -> usize {
        let tail = self.counter(TAIL_OFFSET).load(Ordering::Acquire);
        let head = self.counter(HEAD_OFFSET).load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_msg_len(&self) -> usize {
        self.max_msg_len
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
