//! The seams between the controllers and whatever transports messages between them.
//!
//! Links are fire-and-forget: the controllers never learn whether a message arrived, and they
//!  tolerate links that lose, duplicate or reorder messages. The controller handles implement
//!  these traits for in-process use; a networked deployment wraps its transport instead.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::protocol::{ControlMessage, SequencedMessage};

/// A link from the consumer controller to its producer controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProducerLink: Send + Sync + 'static {
    async fn send(&self, msg: ControlMessage);
}

/// A link from the producer controller to a consumer controller. `reply_to` is the link on
///  which the consumer controller sends its responses. The consumer controller identifies
///  a delivery session by the producer id and the (pointer) identity of this link, so a
///  producer controller must always pass the same `Arc`.
#[async_trait]
pub trait ConsumerLink<A: Send + 'static>: Send + Sync + 'static {
    async fn send(&self, msg: SequencedMessage<A>, reply_to: Arc<dyn ProducerLink>);
}
