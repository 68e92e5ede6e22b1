use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::link::{ConsumerLink, ProducerLink};
use crate::protocol::{ControlMessage, SequencedMessage};

/// A [ConsumerLink] that records the messages sent through it instead of delivering them.
pub struct RecordingConsumerLink<A> {
    tracker: RwLock<Vec<SequencedMessage<A>>>,
}

impl<A: Clone + Eq + Debug + Send + Sync + 'static> RecordingConsumerLink<A> {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingConsumerLink {
            tracker: Default::default(),
        })
    }

    /// removes and returns all messages recorded so far
    pub async fn take_sent(&self) -> Vec<SequencedMessage<A>> {
        std::mem::take(&mut *self.tracker.write().await)
    }

    pub async fn assert_message_sent(&self, message: SequencedMessage<A>) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no message was sent, expected {:?}", message);
        }
        assert_eq!(lock.remove(0), message);
    }

    pub async fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected messages: {:?}", lock);
    }
}

#[async_trait]
impl<A: Clone + Send + Sync + 'static> ConsumerLink<A> for RecordingConsumerLink<A> {
    async fn send(&self, msg: SequencedMessage<A>, _reply_to: Arc<dyn ProducerLink>) {
        self.tracker.write().await.push(msg);
    }
}

/// A [ProducerLink] that records the control messages sent through it.
#[derive(Default)]
pub struct RecordingProducerLink {
    tracker: RwLock<Vec<ControlMessage>>,
}

impl RecordingProducerLink {
    pub fn new() -> Arc<Self> {
        Default::default()
    }

    pub async fn take_sent(&self) -> Vec<ControlMessage> {
        std::mem::take(&mut *self.tracker.write().await)
    }

    pub async fn assert_message_sent(&self, message: ControlMessage) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no message was sent, expected {:?}", message);
        }
        assert_eq!(lock.remove(0), message);
    }

    pub async fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected messages: {:?}", lock);
    }
}

#[async_trait]
impl ProducerLink for RecordingProducerLink {
    async fn send(&self, msg: ControlMessage) {
        self.tracker.write().await.push(msg);
    }
}
