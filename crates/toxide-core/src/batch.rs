//! Scheduled byte segments flowing through a toxic chain.
//!
//! A chunk read from a socket enters the chain as a [`Batch`] holding a single
//! [`Segment`]. Each toxic rewrites the batch: splitting segments, adding
//! delay, truncating data, or flagging the connection for close. The pump
//! turns the final batch into timed writes.

use std::time::Duration;

use bytes::Bytes;

/// A piece of data with its write schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Bytes to write.
    pub data: Bytes,
    /// Earliest write time, as an offset from when the chunk was read.
    pub hold: Duration,
    /// Gap to leave after the previous write before writing this segment.
    pub pause: Duration,
}

impl Segment {
    /// Creates a segment with no scheduling constraints.
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            hold: Duration::ZERO,
            pause: Duration::ZERO,
        }
    }

    /// Creates a segment that shares this segment's hold but has its own pause.
    pub(crate) fn follow(&self, data: Bytes, pause: Duration) -> Self {
        Self {
            data,
            hold: self.hold,
            pause,
        }
    }

    /// Returns the number of bytes in this segment.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the segment carries no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Output of running one chunk through a toxic chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Segments to write, in order.
    pub segments: Vec<Segment>,
    /// Close the write side once these segments have been written.
    pub close: bool,
}

impl Batch {
    /// Creates a batch holding a single unscheduled segment.
    pub fn new(data: Bytes) -> Self {
        Self {
            segments: vec![Segment::new(data)],
            close: false,
        }
    }

    /// Total number of bytes across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Returns true if no segment carries data.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    /// Concatenates all segment data.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.segments {
            out.extend_from_slice(&segment.data);
        }
        out
    }

    /// Total pause time across all segments.
    pub fn total_pause(&self) -> Duration {
        self.segments.iter().map(|s| s.pause).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_batch_has_one_segment() {
        let batch = Batch::new(Bytes::from_static(b"hello"));
        assert_eq!(batch.segments.len(), 1);
        assert_eq!(batch.len(), 5);
        assert!(!batch.close);
        assert_eq!(batch.segments[0].hold, Duration::ZERO);
    }

    #[test]
    fn empty_and_concat() {
        let mut batch = Batch::new(Bytes::from_static(b"ab"));
        batch.segments.push(Segment::new(Bytes::from_static(b"cd")));
        assert_eq!(batch.to_vec(), b"abcd");

        let empty = Batch::default();
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 0);
    }
}
