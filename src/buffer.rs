//! Growable byte buffer with independent read/write cursors and a reserved
//! prepend region.
//!
//! Every connection owns two of these (inbound and outbound). The layout is
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0              reader             writer            capacity
//! ```
//!
//! The prepend region lets a protocol layer stamp a length prefix in front of
//! already-serialized data without shifting it.

/// Space kept in front of the readable region for prepended headers.
pub const PREPEND_RESERVE: usize = 8;

const INITIAL_CAPACITY: usize = 1024;

pub struct Buffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; PREPEND_RESERVE + capacity],
            reader: PREPEND_RESERVE,
            writer: PREPEND_RESERVE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// Zero-copy view of the current readable range.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader..self.writer]
    }

    /// Copies `data` into the writable region, growing or compacting storage
    /// first so the write always succeeds.
    pub fn append(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.data[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Writes `data` into the reserved region in front of the readable bytes.
    ///
    /// Returns `false` when the prepend region cannot hold `data`.
    pub fn prepend(&mut self, data: &[u8]) -> bool {
        if data.len() > self.prependable_bytes() {
            return false;
        }
        self.reader -= data.len();
        self.data[self.reader..self.reader + data.len()].copy_from_slice(data);
        true
    }

    /// Advances the read cursor by `min(n, readable_bytes())`.
    ///
    /// When the buffer empties, both cursors snap back to the prepend boundary
    /// so subsequent appends reuse the front of the allocation.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.readable_bytes());
        self.reader += n;
        if self.reader == self.writer {
            self.reader = PREPEND_RESERVE;
            self.writer = PREPEND_RESERVE;
        }
    }

    pub fn consume_all(&mut self) {
        self.consume(self.readable_bytes());
    }

    /// Copies out the readable range and consumes it.
    pub fn read_all(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.consume_all();
        out
    }

    /// Guarantees at least `n` writable bytes.
    ///
    /// If dead prependable space plus the current writable tail already covers
    /// `n`, the readable bytes are moved back to the prepend boundary instead
    /// of reallocating; otherwise the storage grows to `writer + n`.
    pub fn reserve(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() >= n + PREPEND_RESERVE {
            let readable = self.readable_bytes();
            self.data.copy_within(self.reader..self.writer, PREPEND_RESERVE);
            self.reader = PREPEND_RESERVE;
            self.writer = PREPEND_RESERVE + readable;
        } else {
            self.data.resize(self.writer + n, 0);
        }
    }

    /// Mutable view of the writable region, for I/O that reads straight into
    /// the buffer. Pair with [`commit`](Buffer::commit).
    pub fn writable_mut(&mut self) -> &mut [u8] {
        let writer = self.writer;
        &mut self.data[writer..]
    }

    /// Marks `n` bytes of the writable region as filled.
    pub fn commit(&mut self, n: usize) {
        self.writer += n.min(self.writable_bytes());
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}
