//! Per-direction forwarding buffer.
//!
//! Each direction of a connection pair owns one [`ForwardBuffer`]: bytes
//! read from one peer sit here until the opposite peer accepts them. The
//! buffer grows through a fixed ladder (1 KiB, 4 KiB, 16 KiB, 64 KiB,
//! 128 KiB) and only when a read filled the previously prepared region
//! exactly, so idle connections stay at 1 KiB. It never shrinks during the
//! life of a pair. Once `len()` reaches the maximum the owner must stop
//! reading until writes drain it (backpressure).

/// First rung of the capacity ladder.
pub const INITIAL_CAPACITY: usize = 1024;

/// Default top of the capacity ladder, and the high-water mark.
pub const MAX_CAPACITY: usize = 128 * 1024;

/// A contiguous byte queue with bounded, read-driven growth.
///
/// Invariant: `0 <= len() <= capacity() <= max`.
#[derive(Debug)]
pub struct ForwardBuffer {
    storage: Vec<u8>,
    start: usize,
    end: usize,
    max: usize,
}

impl ForwardBuffer {
    pub fn new() -> Self {
        Self::with_max(MAX_CAPACITY)
    }

    pub fn with_max(max: usize) -> Self {
        Self {
            storage: vec![0; INITIAL_CAPACITY.min(max)],
            start: 0,
            end: 0,
            max,
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The owner must stop reading while this holds.
    pub fn at_high_water(&self) -> bool {
        self.len() >= self.max
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Return the writable region.
    ///
    /// When `grow` is set and the buffer is full, capacity advances to the
    /// next ladder rung first. The caller passes `grow = true` when the
    /// previous read filled the prepared region exactly.
    pub fn prepare(&mut self, grow: bool) -> &mut [u8] {
        if grow && self.len() == self.storage.len() && self.storage.len() < self.max {
            let next = (self.storage.len() * 4).min(self.max);
            self.storage.resize(next, 0);
        }
        // Reclaim the consumed prefix once the tail is exhausted.
        if self.start > 0 && self.end == self.storage.len() {
            self.storage.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        &mut self.storage[self.end..]
    }

    /// Record `n` bytes written into the last prepared region.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.storage.len());
        self.end += n;
    }

    /// The buffered, not-yet-written bytes.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    /// Drop `n` bytes from the front after a successful write.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }
}

impl Default for ForwardBuffer {
    fn default() -> Self {
        Self::new()
    }
}
