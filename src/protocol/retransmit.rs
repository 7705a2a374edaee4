//! Per-socket queue of sent but unacknowledged segments.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::wrapping_le;

/// Segment queued for retransmission.
#[derive(Debug, Clone)]
pub struct OutstandingSegment {
    /// Sequence number that, once acknowledged, retires the segment.
    ack_threshold: u32,
    /// Encoded segment, checksum included, resent unmodified.
    bytes: Vec<u8>,
    /// When the segment was last handed to the adapter.
    last_transmit: Option<Instant>,
    /// Number of times the segment has been transmitted.
    transmit_count: u32,
}

impl OutstandingSegment {
    /// Creates a not yet transmitted segment retired by `ack_threshold`.
    pub fn new(ack_threshold: u32, bytes: Vec<u8>) -> Self {
        Self {
            ack_threshold,
            bytes,
            last_transmit: None,
            transmit_count: 0,
        }
    }

    /// Returns the sequence number that retires this segment.
    pub fn ack_threshold(&self) -> u32 {
        self.ack_threshold
    }

    /// Returns the encoded segment.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns when the segment was last transmitted, if ever.
    pub fn last_transmit(&self) -> Option<Instant> {
        self.last_transmit
    }

    /// Returns the number of successful transmissions so far.
    pub fn transmit_count(&self) -> u32 {
        self.transmit_count
    }

    /// Returns `true` if the segment was never sent, or was last sent more
    /// than `timeout` before `now`.
    pub fn is_due(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_transmit {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) > timeout,
        }
    }

    /// Records a transmission at `now`.
    pub fn mark_transmitted(&mut self, now: Instant) {
        self.last_transmit = Some(now);
        self.transmit_count += 1;
    }
}

/// Sequence-ordered list of [`OutstandingSegment`]s.
///
/// Segments are appended in the order their sequence space was consumed, so
/// a cumulative acknowledgment always retires a prefix of the queue.
#[derive(Debug, Default)]
pub struct RetransmissionQueue {
    segments: VecDeque<OutstandingSegment>,
}

impl RetransmissionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment. Its threshold must not precede the last queued one.
    pub fn push(&mut self, segment: OutstandingSegment) {
        debug_assert!(
            self.segments
                .back()
                .is_none_or(|last| wrapping_le(last.ack_threshold, segment.ack_threshold)),
            "retransmission queue must stay sequence-ordered"
        );

        self.segments.push_back(segment);
    }

    /// Retires every segment from the front whose threshold is covered by
    /// `ack`, stopping at the first one that is not. Returns the number of
    /// segments removed.
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        let covered = self
            .segments
            .iter()
            .take_while(|segment| wrapping_le(segment.ack_threshold, ack))
            .count();

        self.segments.drain(..covered);

        covered
    }

    /// Returns `true` if any segment is due for (re)transmission at `now`.
    pub fn has_due(&self, now: Instant, timeout: Duration) -> bool {
        self.segments.iter().any(|segment| segment.is_due(now, timeout))
    }

    /// Returns the due segments, in queue order.
    pub fn due_mut(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> impl Iterator<Item = &mut OutstandingSegment> {
        self.segments
            .iter_mut()
            .filter(move |segment| segment.is_due(now, timeout))
    }

    /// Returns the queued segments, in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &OutstandingSegment> {
        self.segments.iter()
    }

    /// Returns the number of queued segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` if nothing is awaiting acknowledgment.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Drops every queued segment.
    pub fn clear(&mut self) {
        self.segments.clear();
    }
}
