//! Fixed-size byte ring with head/tail indices.
//!
//! One slot is always left empty so `head == tail` means empty. A put into a
//! full ring is refused and latches the overflow flag; stored data is never
//! overwritten.

/// CAN, inserted by [`RingBuffer::cancel`].
pub const ASCII_CAN: u8 = 0x18;

/// Byte ring buffer.
#[derive(Debug)]
pub struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
    overflow: bool,
}

impl RingBuffer {
    /// Create a ring of `size` slots holding at most `size - 1` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size.max(2)].into_boxed_slice(),
            head: 0,
            tail: 0,
            overflow: false,
        }
    }

    #[inline]
    fn next(&self, index: usize) -> usize {
        if index + 1 == self.data.len() {
            0
        } else {
            index + 1
        }
    }

    /// Usable capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len() - 1
    }

    /// Bytes stored.
    #[inline]
    pub fn count(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.data.len() - self.tail + self.head
        }
    }

    /// Bytes that can still be stored.
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.count()
    }

    /// `true` if nothing is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Store one byte. Returns `false` and sets the overflow flag when full.
    pub fn put(&mut self, byte: u8) -> bool {
        let next_head = self.next(self.head);
        if next_head == self.tail {
            self.overflow = true;
            return false;
        }
        self.data[self.head] = byte;
        self.head = next_head;
        true
    }

    /// Store as many bytes as fit. Returns the number stored.
    pub fn put_slice(&mut self, bytes: &[u8]) -> usize {
        bytes.iter().take_while(|&&b| self.put(b)).count()
    }

    /// Remove and return the oldest byte.
    pub fn get(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.data[self.tail];
        self.tail = self.next(self.tail);
        Some(byte)
    }

    /// Copy the oldest bytes into `out` without removing them.
    pub fn peek_into(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.count());
        let mut index = self.tail;
        for slot in out.iter_mut().take(n) {
            *slot = self.data[index];
            index = self.next(index);
        }
        n
    }

    /// Remove `n` bytes (clamped to the stored count).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.count());
        self.tail = (self.tail + n) % self.data.len();
    }

    /// Discard everything stored.
    pub fn flush(&mut self) {
        self.tail = self.head;
    }

    /// Discard everything and leave a single CAN byte.
    pub fn cancel(&mut self) {
        self.flush();
        self.put(ASCII_CAN);
    }

    /// Overflow flag state.
    #[inline]
    pub fn overflow(&self) -> bool {
        self.overflow
    }

    /// Read and clear the overflow flag.
    pub fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflow)
    }
}
