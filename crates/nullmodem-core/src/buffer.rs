//! Receive ring buffer
//!
//! Each port owns one [`RingBuffer`] holding the bytes its peer has written
//! and it has not yet read. The buffer is an index-based circular store over
//! an owned allocation with three occupancy figures:
//!
//! - `capacity` — physical size of the backing store
//! - `limit` — the active throttle point; ordinary writes never admit bytes
//!   beyond it, and partial consumption is the normal backpressure signal
//! - `size80` — the `(limit*4 + 4)/5` watermark used to trigger proactive
//!   flow-control signaling before the buffer is completely full (the exact
//!   rounding is a compatibility contract)
//!
//! Alongside the ring proper the buffer carries a one-bit pending-escape
//! flag (the owed second byte of a split literal-doubling pair) and a small
//! [`RawData`] side channel for priority out-of-band bytes. Readers always
//! drain ring content first, then the pending escape byte, then the side
//! channel.

use crate::flow::{copy_with_escape, FlowFilter};

/// Inline capacity of a [`RawData`] block: the longest escape sequence
/// (marker + code + 4-byte payload) with one byte to spare.
pub const RAW_DATA_CAPACITY: usize = 7;

/// Small fixed-capacity byte block used for escape sequences in flight
#[derive(Debug, Clone, Copy, Default)]
pub struct RawData {
    data: [u8; RAW_DATA_CAPACITY],
    size: u8,
}

impl RawData {
    /// Empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Block pre-filled from `bytes` (must fit)
    pub fn from_slice(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= RAW_DATA_CAPACITY, "raw data block overflow");
        let mut raw = Self::new();
        raw.data[..bytes.len()].copy_from_slice(bytes);
        raw.size = bytes.len() as u8;
        raw
    }

    /// Number of bytes held
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// True when no bytes are held
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The held bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// Discard all held bytes
    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// Drop the first `done` bytes, shifting the remainder down
    pub fn compact(&mut self, done: usize) {
        if done == 0 {
            return;
        }
        let size = self.len();
        assert!(done <= size, "raw data accounting mismatch");
        self.data.copy_within(done..size, 0);
        self.size = (size - done) as u8;
    }

    /// Move as much of `src` as fits into `self`; returns true when `src`
    /// has been fully drained
    pub fn move_from(&mut self, src: &mut RawData) -> bool {
        if src.is_empty() {
            return true;
        }
        let free = RAW_DATA_CAPACITY - self.len();
        let take = free.min(src.len());
        if take > 0 {
            let at = self.len();
            self.data[at..at + take].copy_from_slice(&src.as_slice()[..take]);
            self.size += take as u8;
            src.compact(take);
        }
        src.is_empty()
    }
}

/// Fixed-capacity circular byte store with throttle limit and escape
/// side-channel state
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    read_at: usize,
    write_at: usize,
    busy: usize,
    limit: usize,
    size80: usize,
    pending_escape: bool,
    insert_data: RawData,
}

fn watermark(limit: usize) -> usize {
    (limit * 4 + 4) / 5
}

impl RingBuffer {
    /// Allocate a buffer of `capacity` bytes; the limit starts at capacity
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            tracing::warn!("ring buffer allocated with zero capacity, running degraded");
        }
        Self {
            data: vec![0; capacity],
            read_at: 0,
            write_at: 0,
            busy: 0,
            limit: capacity,
            size80: watermark(capacity),
            pending_escape: false,
            insert_data: RawData::new(),
        }
    }

    /// Physical size of the backing store
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently stored in the ring proper
    pub fn busy(&self) -> usize {
        self.busy
    }

    /// Active throttle point for ordinary writes
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The 80% occupancy watermark derived from the limit
    pub fn size80(&self) -> usize {
        self.size80
    }

    /// Bytes a reader could currently obtain, side-channel state included
    pub fn pending_bytes(&self) -> usize {
        self.busy + usize::from(self.pending_escape) + self.insert_data.len()
    }

    pub(crate) fn escape_parts(&mut self) -> (&mut bool, &mut RawData) {
        (&mut self.pending_escape, &mut self.insert_data)
    }

    /// Contiguous free region starting at the write cursor
    fn free_region(&self) -> (usize, usize) {
        let cap = self.data.len();
        if self.busy >= cap {
            return (self.write_at, 0);
        }
        let len = if self.write_at >= self.read_at {
            cap - self.write_at
        } else {
            self.read_at - self.write_at
        };
        (self.write_at, len)
    }

    /// Contiguous occupied region starting at the read cursor
    fn busy_region(&self) -> (usize, usize) {
        let cap = self.data.len();
        let len = if self.write_at <= self.read_at && self.busy > 0 {
            cap - self.read_at
        } else {
            self.busy
        };
        (self.read_at, len)
    }

    fn advance_write(&mut self, n: usize) {
        self.busy += n;
        assert!(self.busy <= self.data.len(), "buffer accounting mismatch");
        self.write_at = (self.write_at + n) % self.data.len().max(1);
    }

    /// Copy as many bytes from `src` as fit under the throttle limit,
    /// running them through `filter` when present. Returns the number of
    /// source bytes consumed (delivered or filtered out); a short count is
    /// the backpressure signal, not an error.
    pub fn write(&mut self, src: &[u8], mut filter: Option<&mut FlowFilter>) -> usize {
        let mut consumed = 0;
        while consumed < src.len() {
            if self.busy >= self.limit {
                break;
            }
            let (at, contig) = self.free_region();
            let room = contig.min(self.limit - self.busy);
            if room == 0 {
                break;
            }
            let Self {
                data,
                pending_escape,
                insert_data,
                ..
            } = self;
            let dest = &mut data[at..at + room];
            let (produced, used) =
                copy_with_escape(pending_escape, insert_data, filter.as_deref_mut(), dest, &src[consumed..]);
            self.advance_write(produced);
            consumed += used;
            if produced == 0 && used == 0 {
                break;
            }
        }
        consumed
    }

    /// Drain up to `dest.len()` bytes in FIFO order: ring content first,
    /// then the pending escape byte, then the side channel. Returns 0 when
    /// empty.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let mut pos = 0;
        while pos < dest.len() {
            if self.busy == 0 {
                if self.pending_escape {
                    dest[pos] = crate::escape::CODE_LITERAL;
                    pos += 1;
                    self.pending_escape = false;
                    if pos >= dest.len() {
                        break;
                    }
                }
                if !self.insert_data.is_empty() {
                    let n = self.insert_data.len().min(dest.len() - pos);
                    dest[pos..pos + n].copy_from_slice(&self.insert_data.as_slice()[..n]);
                    self.insert_data.compact(n);
                    pos += n;
                }
                break;
            }
            let (at, contig) = self.busy_region();
            let n = contig.min(dest.len() - pos);
            dest[pos..pos + n].copy_from_slice(&self.data[at..at + n]);
            self.busy -= n;
            self.read_at = (self.read_at + n) % self.data.len();
            pos += n;
        }
        pos
    }

    /// Append a byte that must always be visible: at the throttle limit the
    /// most recently written byte is overwritten instead of failing, a
    /// deliberately lossy policy that keeps a mandatory status byte the
    /// newest value a reader sees.
    pub fn write_mandatory(&mut self, ch: u8) {
        let cap = self.data.len();
        if cap == 0 {
            return;
        }
        if self.busy >= self.limit {
            if self.busy > 0 {
                let at = (self.write_at + cap - 1) % cap;
                self.data[at] = ch;
            }
        } else {
            self.data[self.write_at] = ch;
            self.advance_write(1);
        }
    }

    /// Inject a priority block (an already escape-coded status sequence)
    /// ahead of subsequent ordinary writes. The priority path may fill up to
    /// physical capacity, past the throttle limit. Returns bytes consumed;
    /// the caller retries any remainder.
    pub fn write_priority_block(&mut self, src: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < src.len() {
            let (at, contig) = self.free_region();
            if contig == 0 {
                break;
            }
            let Self {
                data,
                pending_escape,
                insert_data,
                ..
            } = self;
            let dest = &mut data[at..at + contig];
            let (produced, used) =
                copy_with_escape(pending_escape, insert_data, None, dest, &src[consumed..]);
            self.advance_write(produced);
            consumed += used;
            if produced == 0 && used == 0 {
                break;
            }
        }
        consumed
    }

    /// Merge a raw-data block through the priority path; returns true once
    /// the block is fully consumed
    pub fn write_raw_data(&mut self, raw: &mut RawData) -> bool {
        let consumed = self.write_priority_block(raw.as_slice());
        raw.compact(consumed);
        raw.is_empty()
    }

    /// Replace the backing store with a larger one, preserving content
    /// order and count. A `new_capacity` not larger than the current
    /// capacity is a no-op. Returns whether the buffer grew.
    pub fn grow(&mut self, new_capacity: usize) -> bool {
        if new_capacity <= self.data.len() {
            return false;
        }
        let mut data = vec![0; new_capacity];
        let busy = self.busy;
        let mut copied = 0;
        while copied < busy {
            let (at, contig) = self.busy_region();
            let n = contig.min(busy - copied);
            data[copied..copied + n].copy_from_slice(&self.data[at..at + n]);
            self.busy -= n;
            self.read_at = (self.read_at + n) % self.data.len();
            copied += n;
        }
        self.data = data;
        self.read_at = 0;
        self.write_at = busy;
        self.busy = busy;
        self.limit = new_capacity;
        self.size80 = watermark(new_capacity);
        true
    }

    /// Reset to empty, discarding content and side-channel state
    pub fn purge(&mut self) {
        self.read_at = 0;
        self.write_at = 0;
        self.busy = 0;
        self.pending_escape = false;
        self.insert_data.clear();
    }

    /// Move the throttle point; clamped to physical capacity. The `size80`
    /// watermark follows the new limit.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(self.data.len());
        self.size80 = watermark(self.limit);
    }
}
