//! Reorder buffer for the ordered byte stream.
//!
//! Holds segments that arrived ahead of the next expected sequence number
//! until the gap is filled. The buffer is bounded; segments that do not fit
//! are dropped and recovered through the sender's retransmission.

use std::collections::BTreeMap;

/// One unit of the ordered stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Stream bytes.
    Data(Vec<u8>),
    /// End of stream.
    End,
}

/// Result of offering an early segment to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Segment stored.
    Buffered,
    /// Same sequence already buffered; discarded.
    Duplicate,
    /// Buffer full; discarded.
    Full,
}

/// Bounded out-of-order segment store.
#[derive(Debug)]
pub struct ReorderBuffer {
    segments: BTreeMap<u32, Segment>,
    capacity: usize,
}

impl ReorderBuffer {
    /// Create an empty buffer holding at most `capacity` segments.
    pub fn new(capacity: usize) -> Self {
        Self {
            segments: BTreeMap::new(),
            capacity,
        }
    }

    /// Store a segment that arrived ahead of the expected sequence.
    pub fn insert(&mut self, seq: u32, segment: Segment) -> InsertOutcome {
        if self.segments.contains_key(&seq) {
            return InsertOutcome::Duplicate;
        }
        if self.segments.len() >= self.capacity {
            return InsertOutcome::Full;
        }
        self.segments.insert(seq, segment);
        InsertOutcome::Buffered
    }

    /// Take the segment for `expected`, if it has arrived.
    pub fn pop(&mut self, expected: u32) -> Option<Segment> {
        self.segments.remove(&expected)
    }

    /// Discard segments below `expected` (already delivered).
    pub fn discard_below(&mut self, expected: u32) {
        self.segments = self.segments.split_off(&expected);
    }

    /// Number of buffered segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Release every buffered segment.
    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_drain_in_order() {
        let mut buf = ReorderBuffer::new(8);

        assert_eq!(buf.insert(3, Segment::Data(b"d".to_vec())), InsertOutcome::Buffered);
        assert_eq!(buf.insert(2, Segment::Data(b"c".to_vec())), InsertOutcome::Buffered);
        assert_eq!(buf.insert(4, Segment::End), InsertOutcome::Buffered);

        // Gap at 1: nothing to release
        assert_eq!(buf.pop(1), None);

        let mut expected = 2;
        let mut drained = Vec::new();
        while let Some(segment) = buf.pop(expected) {
            drained.push(segment);
            expected += 1;
        }

        assert_eq!(
            drained,
            vec![
                Segment::Data(b"c".to_vec()),
                Segment::Data(b"d".to_vec()),
                Segment::End
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_duplicate_discarded() {
        let mut buf = ReorderBuffer::new(8);
        buf.insert(5, Segment::Data(b"first".to_vec()));

        assert_eq!(
            buf.insert(5, Segment::Data(b"second".to_vec())),
            InsertOutcome::Duplicate
        );
        assert_eq!(buf.pop(5), Some(Segment::Data(b"first".to_vec())));
    }

    #[test]
    fn test_bounded() {
        let mut buf = ReorderBuffer::new(2);
        buf.insert(1, Segment::End);
        buf.insert(2, Segment::End);

        assert_eq!(buf.insert(3, Segment::End), InsertOutcome::Full);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_discard_below_and_clear() {
        let mut buf = ReorderBuffer::new(8);
        for seq in 1..6 {
            buf.insert(seq, Segment::Data(vec![seq as u8]));
        }

        buf.discard_below(4);
        assert_eq!(buf.len(), 2);

        buf.clear();
        assert!(buf.is_empty());
    }
}
