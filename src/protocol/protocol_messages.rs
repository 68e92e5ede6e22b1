use bytes::Bytes;

use crate::protocol::SeqNr;

/// A part of a message that was split because its serialized size exceeded the configured
///  threshold. All chunks of a message share the message's sequence number.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ChunkedMessage {
    pub serialized: Bytes,
    /// zero-based position of this chunk in the message's run of chunks
    pub chunk_index: u32,
    pub first_chunk: bool,
    pub last_chunk: bool,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum MessageOrChunk<A> {
    Message(A),
    Chunk(ChunkedMessage),
}

impl<A> MessageOrChunk<A> {
    pub fn is_first_chunk(&self) -> bool {
        match self {
            MessageOrChunk::Message(_) => true,
            MessageOrChunk::Chunk(c) => c.first_chunk,
        }
    }

    pub fn is_last_chunk(&self) -> bool {
        match self {
            MessageOrChunk::Message(_) => true,
            MessageOrChunk::Chunk(c) => c.last_chunk,
        }
    }

    pub fn chunk_index(&self) -> u32 {
        match self {
            MessageOrChunk::Message(_) => 0,
            MessageOrChunk::Chunk(c) => c.chunk_index,
        }
    }
}

/// The envelope in which the producer controller sends messages (or chunks) to the consumer
///  controller.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SequencedMessage<A> {
    pub producer_id: String,
    pub seq_nr: SeqNr,
    pub message: MessageOrChunk<A>,
    /// marks the first message of a delivery session, causing the consumer controller to
    ///  (re)bind to the sending producer
    pub first: bool,
    /// the producer wants an explicit `Ack` once this message is confirmed
    pub ack: bool,
}

impl<A> SequencedMessage<A> {
    pub fn with_first(self, first: bool) -> SequencedMessage<A> {
        SequencedMessage {
            first,
            ..self
        }
    }
}

/// Messages sent from the consumer controller back to the producer controller. All sequence
///  numbers in here are cumulative, i.e. confirming N confirms everything up to and including N.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ControlMessage {
    /// Confirms everything up to `confirmed_seq_nr`, and allows the producer to send messages
    ///  up to and including `request_up_to_seq_nr`.
    Request {
        confirmed_seq_nr: SeqNr,
        request_up_to_seq_nr: SeqNr,
        supports_resend: bool,
        via_timeout: bool,
    },
    /// The consumer detected a gap: it asks for all messages from `from_seq_nr` to be re-sent.
    Resend {
        from_seq_nr: SeqNr,
    },
    Ack {
        confirmed_seq_nr: SeqNr,
    },
}
