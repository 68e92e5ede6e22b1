use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::protocol::{MessageOrChunk, SeqNr};

/// Confirmations are tracked per qualifier, e.g. to distinguish several consumers that are
///  fed from the same queue over time.
pub type ConfirmationQualifier = String;
pub const NO_QUALIFIER: &str = "";

/// milliseconds since the epoch
pub type TimestampMillis = u64;

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MessageSent<A> {
    pub seq_nr: SeqNr,
    pub message: MessageOrChunk<A>,
    pub ack: bool,
    pub confirmation_qualifier: ConfirmationQualifier,
    pub timestamp_millis: TimestampMillis,
}

impl<A> MessageSent<A> {
    /// Chunks of a message share its sequence number, so the chunk index is needed to tell
    ///  them apart.
    pub fn key(&self) -> (SeqNr, u32) {
        (self.seq_nr, self.message.chunk_index())
    }
}

/// The events that a durable queue persists. Replaying them through [DurableState::apply]
///  rebuilds the state.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum DurableQueueEvent<A> {
    MessageSent(MessageSent<A>),
    Confirmed {
        seq_nr: SeqNr,
        confirmation_qualifier: ConfirmationQualifier,
        timestamp_millis: TimestampMillis,
    },
    Cleanup {
        confirmation_qualifiers: Vec<ConfirmationQualifier>,
    },
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DurableState<A> {
    /// the next sequence number to be assigned
    pub current_seq_nr: SeqNr,
    pub highest_confirmed_seq_nr: SeqNr,
    pub confirmed_seq_nr: FxHashMap<ConfirmationQualifier, (SeqNr, TimestampMillis)>,
    /// ordered by sequence number and chunk index
    pub unconfirmed: Vec<MessageSent<A>>,
}

impl<A> Default for DurableState<A> {
    fn default() -> Self {
        DurableState::empty()
    }
}

impl<A> DurableState<A> {
    pub fn empty() -> DurableState<A> {
        DurableState {
            current_seq_nr: 1,
            highest_confirmed_seq_nr: 0,
            confirmed_seq_nr: FxHashMap::default(),
            unconfirmed: Vec::new(),
        }
    }

    /// Rebuilds a state from a persisted event log.
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a DurableQueueEvent<A>>) -> DurableState<A>
    where A: Clone + 'a
    {
        let mut result = DurableState::empty();
        for evt in events {
            result.apply(evt);
        }
        result
    }

    pub fn apply(&mut self, event: &DurableQueueEvent<A>) where A: Clone {
        match event {
            DurableQueueEvent::MessageSent(sent) => { self.add_message_sent(sent.clone()); }
            DurableQueueEvent::Confirmed { seq_nr, confirmation_qualifier, timestamp_millis } =>
                self.confirmed(*seq_nr, confirmation_qualifier, *timestamp_millis),
            DurableQueueEvent::Cleanup { confirmation_qualifiers } => self.cleanup(confirmation_qualifiers),
        }
    }

    /// Returns `false` if the message (or chunk) was confirmed or stored before, leaving the
    ///  state unchanged.
    pub fn add_message_sent(&mut self, sent: MessageSent<A>) -> bool {
        if sent.seq_nr <= self.highest_confirmed_seq_nr {
            trace!("message #{} was confirmed already - ignoring", sent.seq_nr);
            return false;
        }

        let key = sent.key();
        let pos = self.unconfirmed.partition_point(|u| u.key() < key);
        if self.unconfirmed.get(pos).map(|u| u.key()) == Some(key) {
            trace!("message #{} (chunk #{}) was stored before - ignoring", key.0, key.1);
            return false;
        }

        self.current_seq_nr = self.current_seq_nr.max(sent.seq_nr + 1);
        self.unconfirmed.insert(pos, sent);
        true
    }

    pub fn confirmed(&mut self, seq_nr: SeqNr, confirmation_qualifier: &str, timestamp_millis: TimestampMillis) {
        self.unconfirmed.retain(|u| u.seq_nr > seq_nr || u.confirmation_qualifier != confirmation_qualifier);
        self.highest_confirmed_seq_nr = self.highest_confirmed_seq_nr.max(seq_nr);
        self.current_seq_nr = self.current_seq_nr.max(self.highest_confirmed_seq_nr + 1);

        match self.confirmed_seq_nr.get_mut(confirmation_qualifier) {
            Some(entry) => {
                if seq_nr >= entry.0 {
                    *entry = (seq_nr, timestamp_millis);
                }
            }
            None => {
                self.confirmed_seq_nr.insert(confirmation_qualifier.to_string(), (seq_nr, timestamp_millis));
            }
        }
    }

    pub fn cleanup(&mut self, confirmation_qualifiers: &[ConfirmationQualifier]) {
        for q in confirmation_qualifiers {
            self.confirmed_seq_nr.remove(q);
        }
    }

    /// Qualifiers whose most recent confirmation is older than the cutoff. A store removes them
    ///  through a `Cleanup` event when it loads the state, see
    ///  [InMemoryDurableQueue::with_cleanup_unused_after](crate::durable_queue::InMemoryDurableQueue::with_cleanup_unused_after).
    pub fn stale_qualifiers(&self, older_than: TimestampMillis) -> Vec<ConfirmationQualifier> {
        let mut result = self.confirmed_seq_nr.iter()
            .filter(|(_, (_, timestamp))| *timestamp < older_than)
            .map(|(q, _)| q.clone())
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// A crash while a large message was being stored can leave the beginning of its run of
    ///  chunks in the queue. The producer can not complete such a message, so the torn run is
    ///  discarded and its sequence number is assigned again. Returns `true` if chunks were
    ///  discarded.
    pub fn cleanup_partially_chunked_messages(&mut self) -> bool {
        if self.unconfirmed.iter().all(|u| u.message.is_first_chunk() && u.message.is_last_chunk()) {
            return false;
        }

        let num_before = self.unconfirmed.len();

        let mut kept = Vec::with_capacity(self.unconfirmed.len());
        let mut run = Vec::new();
        let mut new_current_seq_nr = self.highest_confirmed_seq_nr + 1;

        for sent in self.unconfirmed.drain(..) {
            let first = sent.message.is_first_chunk();
            let last = sent.message.is_last_chunk();

            if first && last {
                run.clear();
                new_current_seq_nr = sent.seq_nr + 1;
                kept.push(sent);
            }
            else if first {
                run.clear();
                run.push(sent);
            }
            else if last {
                new_current_seq_nr = sent.seq_nr + 1;
                kept.append(&mut run);
                kept.push(sent);
            }
            else {
                run.push(sent);
            }
        }

        if !run.is_empty() {
            debug!("discarding {} chunks of partially stored message #{}", run.len(), run[0].seq_nr);
        }

        self.unconfirmed = kept;
        self.current_seq_nr = new_current_seq_nr;
        self.unconfirmed.len() < num_before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::protocol::ChunkedMessage;

    fn msg(seq_nr: SeqNr) -> MessageSent<String> {
        MessageSent {
            seq_nr,
            message: MessageOrChunk::Message(format!("m{}", seq_nr)),
            ack: false,
            confirmation_qualifier: NO_QUALIFIER.to_string(),
            timestamp_millis: 0,
        }
    }

    fn chunk(seq_nr: SeqNr, chunk_index: u32, last_chunk: bool) -> MessageSent<String> {
        MessageSent {
            seq_nr,
            message: MessageOrChunk::Chunk(ChunkedMessage {
                serialized: Bytes::from_static(b"abc"),
                chunk_index,
                first_chunk: chunk_index == 0,
                last_chunk,
            }),
            ack: false,
            confirmation_qualifier: NO_QUALIFIER.to_string(),
            timestamp_millis: 0,
        }
    }

    fn keys(state: &DurableState<String>) -> Vec<(SeqNr, u32)> {
        state.unconfirmed.iter()
            .map(|u| u.key())
            .collect()
    }

    #[test]
    fn test_empty() {
        let state = DurableState::<String>::empty();
        assert_eq!(state.current_seq_nr, 1);
        assert_eq!(state.highest_confirmed_seq_nr, 0);
        assert!(state.unconfirmed.is_empty());
    }

    #[test]
    fn test_add_message_sent_idempotent() {
        let mut state = DurableState::empty();
        assert!(state.add_message_sent(msg(1)));
        assert!(state.add_message_sent(msg(2)));
        let before = state.clone();

        assert!(!state.add_message_sent(msg(2)));
        assert!(!state.add_message_sent(msg(1)));
        assert_eq!(state, before);
        assert_eq!(state.current_seq_nr, 3);
    }

    #[test]
    fn test_add_message_sent_confirmed_is_ignored() {
        let mut state = DurableState::empty();
        state.add_message_sent(msg(1));
        state.confirmed(1, NO_QUALIFIER, 10);

        assert!(!state.add_message_sent(msg(1)));
        assert!(state.unconfirmed.is_empty());
        assert_eq!(state.current_seq_nr, 2);
    }

    #[test]
    fn test_add_chunks_share_seq_nr() {
        let mut state = DurableState::empty();
        assert!(state.add_message_sent(chunk(1, 0, false)));
        assert!(state.add_message_sent(chunk(1, 1, false)));
        assert!(!state.add_message_sent(chunk(1, 1, false)));
        assert!(state.add_message_sent(chunk(1, 2, true)));

        assert_eq!(keys(&state), vec![(1, 0), (1, 1), (1, 2)]);
        assert_eq!(state.current_seq_nr, 2);
    }

    #[test]
    fn test_add_keeps_order() {
        let mut state = DurableState::empty();
        state.add_message_sent(msg(3));
        state.add_message_sent(msg(1));
        state.add_message_sent(msg(2));
        assert_eq!(keys(&state), vec![(1, 0), (2, 0), (3, 0)]);
        assert_eq!(state.current_seq_nr, 4);
    }

    #[rstest]
    #[case::none(0, vec![1, 2, 3, 4, 5], 0)]
    #[case::some(3, vec![4, 5], 3)]
    #[case::all(5, vec![], 5)]
    #[case::beyond(7, vec![], 7)]
    fn test_confirmed(#[case] confirmed: SeqNr, #[case] expected_unconfirmed: Vec<SeqNr>, #[case] expected_highest: SeqNr) {
        let mut state = DurableState::empty();
        for seq_nr in 1..=5 {
            state.add_message_sent(msg(seq_nr));
        }
        state.confirmed(confirmed, NO_QUALIFIER, 100);

        let unconfirmed = state.unconfirmed.iter().map(|u| u.seq_nr).collect::<Vec<_>>();
        assert_eq!(unconfirmed, expected_unconfirmed);
        assert_eq!(state.highest_confirmed_seq_nr, expected_highest);
        assert_eq!(state.current_seq_nr, expected_highest.max(5) + 1);
    }

    #[test]
    fn test_confirmed_is_monotonic() {
        let mut state = DurableState::<String>::empty();
        state.confirmed(5, NO_QUALIFIER, 100);
        state.confirmed(3, NO_QUALIFIER, 200);

        assert_eq!(state.highest_confirmed_seq_nr, 5);
        assert_eq!(state.confirmed_seq_nr.get(NO_QUALIFIER), Some(&(5, 100)));

        state.confirmed(5, NO_QUALIFIER, 300);
        assert_eq!(state.confirmed_seq_nr.get(NO_QUALIFIER), Some(&(5, 300)));
    }

    #[test]
    fn test_confirmed_only_matching_qualifier() {
        let mut state = DurableState::empty();
        state.add_message_sent(msg(1));
        state.add_message_sent(MessageSent { confirmation_qualifier: "b".to_string(), ..msg(2) });
        state.add_message_sent(msg(3));

        state.confirmed(3, "b", 100);
        assert_eq!(keys(&state), vec![(1, 0), (3, 0)]);

        state.confirmed(3, NO_QUALIFIER, 200);
        assert!(state.unconfirmed.is_empty());
        assert_eq!(state.confirmed_seq_nr.len(), 2);
    }

    #[test]
    fn test_cleanup_and_stale_qualifiers() {
        let mut state = DurableState::<String>::empty();
        state.confirmed(1, "a", 100);
        state.confirmed(2, "b", 200);
        state.confirmed(3, "c", 300);

        assert_eq!(state.stale_qualifiers(250), vec!["a".to_string(), "b".to_string()]);

        state.cleanup(&["a".to_string(), "x".to_string()]);
        assert!(!state.confirmed_seq_nr.contains_key("a"));
        assert_eq!(state.confirmed_seq_nr.len(), 2);
        assert_eq!(state.highest_confirmed_seq_nr, 3);
    }

    #[rstest]
    #[case::no_chunks(vec![msg(4), msg(5)], vec![(4, 0), (5, 0)], 6)]
    #[case::complete_run(vec![msg(4), chunk(5, 0, false), chunk(5, 1, true)], vec![(4, 0), (5, 0), (5, 1)], 6)]
    #[case::trailing_torn_run(vec![msg(4), chunk(5, 0, false), chunk(5, 1, false)], vec![(4, 0)], 5)]
    #[case::only_torn_run(vec![chunk(4, 0, false), chunk(4, 1, false)], vec![], 4)]
    #[case::torn_after_complete_run(vec![chunk(4, 0, false), chunk(4, 1, true), chunk(5, 0, false)], vec![(4, 0), (4, 1)], 5)]
    fn test_cleanup_partially_chunked_messages(#[case] unconfirmed: Vec<MessageSent<String>>, #[case] expected_keys: Vec<(SeqNr, u32)>, #[case] expected_current: SeqNr) {
        let mut state = DurableState::empty();
        state.confirmed(3, NO_QUALIFIER, 0);
        for u in unconfirmed {
            state.add_message_sent(u);
        }

        let num_before = state.unconfirmed.len();

        let discarded = state.cleanup_partially_chunked_messages();

        assert_eq!(discarded, expected_keys.len() < num_before);
        assert_eq!(keys(&state), expected_keys);
        assert_eq!(state.current_seq_nr, expected_current);
        assert_eq!(state.highest_confirmed_seq_nr, 3);
    }

    #[test]
    fn test_replay() {
        let events = vec![
            DurableQueueEvent::MessageSent(msg(1)),
            DurableQueueEvent::MessageSent(msg(2)),
            DurableQueueEvent::MessageSent(msg(2)),
            DurableQueueEvent::Confirmed { seq_nr: 1, confirmation_qualifier: NO_QUALIFIER.to_string(), timestamp_millis: 10 },
            DurableQueueEvent::MessageSent(msg(3)),
            DurableQueueEvent::Confirmed { seq_nr: 1, confirmation_qualifier: "other".to_string(), timestamp_millis: 20 },
            DurableQueueEvent::Cleanup { confirmation_qualifiers: vec!["other".to_string()] },
        ];

        let state = DurableState::replay(&events);
        assert_eq!(keys(&state), vec![(2, 0), (3, 0)]);
        assert_eq!(state.current_seq_nr, 4);
        assert_eq!(state.highest_confirmed_seq_nr, 1);
        assert_eq!(state.confirmed_seq_nr.len(), 1);
    }
}
