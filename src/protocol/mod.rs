//! The messages exchanged between producer controller and consumer controller, and the
//!  [DeliveryPayload] abstraction for application messages.

pub mod chunking;
mod protocol_messages;

use std::fmt::Debug;

use bytes::{BufMut, Bytes, BytesMut};

pub use protocol_messages::*;

/// Sequence numbers start at 1 for a new producer and are never reused, not even across
///  restarts if the producer has a durable queue. 0 means 'nothing'.
pub type SeqNr = u64;

/// Application messages travel between producer and consumer controller as typed values.
///  They are serialized only if they are split into chunks, and deserialized after all chunks
///  were received.
pub trait DeliveryPayload: Clone + Debug + Send + Sync + 'static {
    fn ser(&self, buf: &mut BytesMut);
    fn deser(buf: &[u8]) -> anyhow::Result<Self>;
}

impl DeliveryPayload for Vec<u8> {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn deser(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(buf.to_vec())
    }
}

impl DeliveryPayload for Bytes {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn deser(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(Bytes::copy_from_slice(buf))
    }
}

impl DeliveryPayload for String {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }

    fn deser(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(std::str::from_utf8(buf)?.to_string())
    }
}
