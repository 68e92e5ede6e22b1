//! Reliable, ordered, flow-controlled point-to-point delivery of messages from one producer to
//!  one consumer over a transport that may lose, duplicate or reorder messages.
//!
//! There are two controllers, each running as a tokio task:
//! * The [producer controller](producer::ProducerController) pulls messages from the application
//!   producer, assigns sequence numbers, optionally splits large messages into chunks and
//!   stores them in a [durable queue](durable_queue::DurableProducerQueue) before sending them
//!   to the consumer side. It keeps every message until the consumer confirms it.
//! * The [consumer controller](consumer::ConsumerController) tracks the sequence numbers it
//!   receives, reassembles chunks, discards duplicates, asks for lost messages to be re-sent and
//!   hands messages to the application consumer one at a time and in order. It grants the
//!   producer a window of messages it may send ahead, and extends it as messages are confirmed.
//!
//! The controllers talk to each other through [link](link) traits. They do not care how the
//!  messages are transported, only that a link may lose, duplicate and reorder them.

pub mod config;
pub mod consumer;
pub mod durable_queue;
pub mod link;
pub mod producer;
pub mod protocol;
pub mod test_util;
