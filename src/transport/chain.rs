//! Cursor over received segments that were not fully processed yet.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// Queue of receive segments with a byte cursor.
///
/// Segments are never copied; consuming bytes advances the front segment and
/// drops it once empty.
#[derive(Debug, Default)]
pub struct PacketChain {
    segments: VecDeque<Bytes>,
    total: usize,
}

impl PacketChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment at the tail.
    pub fn push(&mut self, segment: Bytes) {
        if !segment.is_empty() {
            self.total += segment.len();
            self.segments.push_back(segment);
        }
    }

    /// Append several segments in order.
    pub fn extend<I: IntoIterator<Item = Bytes>>(&mut self, segments: I) {
        for segment in segments {
            self.push(segment);
        }
    }

    /// Unconsumed bytes of the front segment.
    #[inline]
    pub fn front(&self) -> Option<&[u8]> {
        self.segments.front().map(|s| s.as_ref())
    }

    /// Consume `n` bytes from the front segment.
    ///
    /// `n` is clamped to the front segment length.
    pub fn advance(&mut self, n: usize) {
        if let Some(front) = self.segments.front_mut() {
            let n = n.min(front.len());
            front.advance(n);
            self.total -= n;
            if front.is_empty() {
                self.segments.pop_front();
            }
        }
    }

    /// Total unconsumed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.total
    }

    /// `true` if nothing is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of segments still queued.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_across_segments() {
        let mut chain = PacketChain::new();
        chain.push(Bytes::from_static(b"abc"));
        chain.push(Bytes::new());
        chain.push(Bytes::from_static(b"de"));
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.segment_count(), 2);

        chain.advance(2);
        assert_eq!(chain.front(), Some(&b"c"[..]));
        chain.advance(10);
        assert_eq!(chain.front(), Some(&b"de"[..]));
        assert_eq!(chain.len(), 2);

        chain.advance(2);
        assert!(chain.is_empty());
        assert_eq!(chain.front(), None);
    }

    #[test]
    fn test_pending_data_is_appended() {
        let mut chain = PacketChain::new();
        chain.push(Bytes::from_static(b"old"));
        chain.advance(1);
        chain.extend([Bytes::from_static(b"new")]);

        let mut all = Vec::new();
        while let Some(front) = chain.front() {
            all.extend_from_slice(front);
            let n = front.len();
            chain.advance(n);
        }
        assert_eq!(all, b"ldnew");
    }
}
