use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::durable_queue::{now_millis, ConfirmationQualifier, DurableProducerQueue, DurableQueueEvent, DurableState, MessageSent, StoreMessageSentAck, TimestampMillis, NO_QUALIFIER};
use crate::protocol::{DeliveryPayload, SeqNr};

/// An event-sourced store that keeps its log in memory. It survives a producer controller, so
///  sharing one instance between an old and a new controller simulates a producer crash and
///  recovery.
pub struct InMemoryDurableQueue<A> {
    inner: RwLock<Inner<A>>,
    cleanup_unused_after: Option<Duration>,
}

struct Inner<A> {
    events: Vec<DurableQueueEvent<A>>,
    state: DurableState<A>,
}

impl<A: DeliveryPayload> InMemoryDurableQueue<A> {
    pub fn new() -> InMemoryDurableQueue<A> {
        InMemoryDurableQueue {
            inner: RwLock::new(Inner {
                events: Vec::new(),
                state: DurableState::empty(),
            }),
            cleanup_unused_after: None,
        }
    }

    /// When loading the state, confirmation qualifiers without a confirmation for this long are
    ///  removed.
    pub fn with_cleanup_unused_after(mut self, cleanup_unused_after: Duration) -> InMemoryDurableQueue<A> {
        self.cleanup_unused_after = Some(cleanup_unused_after);
        self
    }

    /// the persisted events, in the order they were stored
    pub async fn events(&self) -> Vec<DurableQueueEvent<A>> {
        self.inner.read().await.events.clone()
    }

    /// the live state, without the cleanup that `load_state` applies
    pub async fn state(&self) -> DurableState<A> {
        self.inner.read().await.state.clone()
    }

    /// Simulates a crash in the middle of storing a message's chunks by dropping the last
    ///  `n` persisted events.
    pub async fn truncate_log(&self, n: usize) {
        let mut inner = self.inner.write().await;
        let new_len = inner.events.len().saturating_sub(n);
        inner.events.truncate(new_len);
        let state = DurableState::replay(&inner.events);
        inner.state = state;
    }
}

impl<A: DeliveryPayload> Default for InMemoryDurableQueue<A> {
    fn default() -> Self {
        InMemoryDurableQueue::new()
    }
}

#[async_trait]
impl<A: DeliveryPayload> DurableProducerQueue<A> for InMemoryDurableQueue<A> {
    async fn load_state(&self) -> anyhow::Result<DurableState<A>> {
        let mut inner = self.inner.write().await;

        if let Some(cleanup_unused_after) = self.cleanup_unused_after {
            let cutoff = now_millis().saturating_sub(cleanup_unused_after.as_millis() as TimestampMillis);
            let unused = inner.state.stale_qualifiers(cutoff).into_iter()
                .filter(|q| q != NO_QUALIFIER)
                .collect::<Vec<_>>();
            if !unused.is_empty() {
                debug!("removing unused confirmation qualifiers {:?}", unused);
                let evt = DurableQueueEvent::Cleanup { confirmation_qualifiers: unused };
                inner.state.apply(&evt);
                inner.events.push(evt);
            }
        }

        let mut state = DurableState::replay(&inner.events);
        if state.cleanup_partially_chunked_messages() {
            // the torn chunks must not block re-storing their sequence number
            let kept = state.unconfirmed.iter().map(|u| u.key()).collect::<FxHashSet<_>>();
            let highest_confirmed_seq_nr = state.highest_confirmed_seq_nr;
            inner.events.retain(|evt| match evt {
                DurableQueueEvent::MessageSent(sent) => sent.seq_nr <= highest_confirmed_seq_nr || kept.contains(&sent.key()),
                _ => true,
            });
            inner.state = state.clone();
        }
        Ok(state)
    }

    async fn store_message_sent(&self, sent: MessageSent<A>) -> anyhow::Result<StoreMessageSentAck> {
        let stored_seq_nr = sent.seq_nr;

        let mut inner = self.inner.write().await;
        if inner.state.add_message_sent(sent.clone()) {
            inner.events.push(DurableQueueEvent::MessageSent(sent));
        }
        else {
            trace!("duplicate store request for #{}", stored_seq_nr);
        }
        Ok(StoreMessageSentAck { stored_seq_nr })
    }

    async fn store_message_confirmed(&self, seq_nr: SeqNr, confirmation_qualifier: ConfirmationQualifier, timestamp_millis: TimestampMillis) -> anyhow::Result<()> {
        let evt = DurableQueueEvent::Confirmed { seq_nr, confirmation_qualifier, timestamp_millis };

        let mut inner = self.inner.write().await;
        inner.state.apply(&evt);
        inner.events.push(evt);
        Ok(())
    }

    async fn cleanup(&self, confirmation_qualifiers: Vec<ConfirmationQualifier>) -> anyhow::Result<()> {
        let evt = DurableQueueEvent::Cleanup { confirmation_qualifiers };

        let mut inner = self.inner.write().await;
        inner.state.apply(&evt);
        inner.events.push(evt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::protocol::chunking::split_into_chunks;
    use crate::protocol::MessageOrChunk;

    fn sent(seq_nr: SeqNr) -> MessageSent<String> {
        MessageSent {
            seq_nr,
            message: MessageOrChunk::Message(format!("m{}", seq_nr)),
            ack: true,
            confirmation_qualifier: NO_QUALIFIER.to_string(),
            timestamp_millis: 1,
        }
    }

    #[tokio::test]
    async fn test_crash_and_reload() {
        let queue = InMemoryDurableQueue::<String>::new();
        for seq_nr in 1..=5 {
            queue.store_message_sent(sent(seq_nr)).await.unwrap();
        }
        for seq_nr in 1..=3 {
            queue.store_message_confirmed(seq_nr, NO_QUALIFIER.to_string(), 2).await.unwrap();
        }

        let state = queue.load_state().await.unwrap();
        let unconfirmed = state.unconfirmed.iter().map(|u| u.seq_nr).collect::<Vec<_>>();
        assert_eq!(unconfirmed, vec![4, 5]);
        assert_eq!(state.current_seq_nr, 6);
        assert_eq!(state.highest_confirmed_seq_nr, 3);
    }

    #[tokio::test]
    async fn test_duplicate_store_is_not_logged() {
        let queue = InMemoryDurableQueue::<String>::new();
        let ack = queue.store_message_sent(sent(1)).await.unwrap();
        assert_eq!(ack, StoreMessageSentAck { stored_seq_nr: 1 });
        let ack = queue.store_message_sent(sent(1)).await.unwrap();
        assert_eq!(ack, StoreMessageSentAck { stored_seq_nr: 1 });

        assert_eq!(queue.events().await.len(), 1);
        assert_eq!(queue.state().await.unconfirmed.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_after_torn_chunk_run() {
        let queue = InMemoryDurableQueue::<String>::new();
        queue.store_message_sent(sent(1)).await.unwrap();
        for chunk in split_into_chunks(Bytes::from(vec![7u8; 10]), 4) {
            queue.store_message_sent(MessageSent {
                seq_nr: 2,
                message: MessageOrChunk::Chunk(chunk),
                ack: true,
                confirmation_qualifier: NO_QUALIFIER.to_string(),
                timestamp_millis: 1,
            }).await.unwrap();
        }
        assert_eq!(queue.state().await.unconfirmed.len(), 4);

        queue.truncate_log(1).await;

        let state = queue.load_state().await.unwrap();
        assert_eq!(state.unconfirmed.len(), 1);
        assert_eq!(state.current_seq_nr, 2);

        // #2 can be stored again, and the discarded chunks stay discarded on the next load
        queue.store_message_sent(sent(2)).await.unwrap();
        let state = queue.load_state().await.unwrap();
        assert_eq!(state.unconfirmed.iter().map(|u| u.message.clone()).collect::<Vec<_>>(), vec![
            MessageOrChunk::Message("m1".to_string()),
            MessageOrChunk::Message("m2".to_string()),
        ]);
        assert_eq!(state.current_seq_nr, 3);
    }

    #[tokio::test]
    async fn test_unused_qualifiers_are_removed_on_load() {
        let queue = InMemoryDurableQueue::<String>::new()
            .with_cleanup_unused_after(Duration::from_secs(3600));
        queue.store_message_confirmed(1, "old".to_string(), 1).await.unwrap();
        queue.store_message_confirmed(2, "recent".to_string(), now_millis()).await.unwrap();
        queue.store_message_confirmed(3, NO_QUALIFIER.to_string(), 1).await.unwrap();

        let state = queue.load_state().await.unwrap();
        let mut qualifiers = state.confirmed_seq_nr.keys().cloned().collect::<Vec<_>>();
        qualifiers.sort();
        assert_eq!(qualifiers, vec![NO_QUALIFIER.to_string(), "recent".to_string()]);
        assert_eq!(state.highest_confirmed_seq_nr, 3);
        assert!(matches!(queue.events().await.last(), Some(DurableQueueEvent::Cleanup { .. })));
    }

    #[tokio::test]
    async fn test_cleanup() {
        let queue = InMemoryDurableQueue::<String>::new();
        queue.store_message_confirmed(1, "a".to_string(), 1).await.unwrap();
        queue.store_message_confirmed(1, "b".to_string(), 1).await.unwrap();
        queue.cleanup(vec!["a".to_string()]).await.unwrap();

        let state = queue.load_state().await.unwrap();
        assert_eq!(state.confirmed_seq_nr.keys().collect::<Vec<_>>(), vec!["b"]);
    }
}
