use tracing::debug;

/// Assigns sequence numbers to outgoing `Data` messages, starting at 0
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: u64,
}

impl SequenceGenerator {
    pub fn next(&mut self) -> u64 {
        let result = self.next;
        self.next = self.next.wrapping_add(1);
        result
    }
}

/// Checks sequence numbers of received `Data` messages.
///
/// There is no reordering or retransmission: a message whose sequence number is not the expected
///  one is reported as a gap, and tracking resynchronizes on it, so that only the first message
///  after a gap is affected.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next_expected: u64,
}

impl SequenceTracker {
    /// returns `true` iff the sequence number is the expected one
    #[must_use]
    pub fn check(&mut self, sequence_number: u64) -> bool {
        let is_in_order = sequence_number == self.next_expected;
        if !is_in_order {
            debug!("sequence gap: expected {}, received {}", self.next_expected, sequence_number);
        }
        self.next_expected = sequence_number.wrapping_add(1);
        is_in_order
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }
}
