use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::protocol::{ChunkedMessage, DeliveryPayload, MessageOrChunk};

/// Wraps a payload for sending: as a whole message if it is small enough (or chunking is
///  disabled), or as a run of chunks otherwise.
pub fn split_payload<A: DeliveryPayload>(payload: A, chunk_large_messages_bytes: Option<usize>) -> Vec<MessageOrChunk<A>> {
    if let Some(chunk_size) = chunk_large_messages_bytes {
        let mut buf = BytesMut::new();
        payload.ser(&mut buf);
        if buf.len() > chunk_size {
            return split_into_chunks(buf.freeze(), chunk_size)
                .into_iter()
                .map(MessageOrChunk::Chunk)
                .collect();
        }
    }
    vec![MessageOrChunk::Message(payload)]
}

/// Splits serialized data into chunks of `chunk_size` bytes each (the last chunk may be
///  shorter). Empty data results in a single empty chunk so there is always a first and a
///  last chunk.
pub fn split_into_chunks(serialized: Bytes, chunk_size: usize) -> Vec<ChunkedMessage> {
    assert!(chunk_size > 0, "chunk size must be positive");

    let num_chunks = serialized.len().div_ceil(chunk_size).max(1);
    (0..num_chunks)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(serialized.len());
            ChunkedMessage {
                serialized: serialized.slice(start..end),
                chunk_index: i as u32,
                first_chunk: i == 0,
                last_chunk: i == num_chunks - 1,
            }
        })
        .collect()
}

/// Collects the chunks of a single message. Chunks may be added in any order and more than once.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    chunks: FxHashMap<u32, ChunkedMessage>,
    last_chunk_index: Option<u32>,
}

impl ChunkAssembler {
    pub fn new() -> ChunkAssembler {
        Default::default()
    }

    /// returns `false` if the chunk was there already
    pub fn add(&mut self, chunk: ChunkedMessage) -> bool {
        if (chunk.chunk_index == 0) != chunk.first_chunk {
            warn!("chunk #{} has an inconsistent 'first' flag - ignoring", chunk.chunk_index);
            return false;
        }
        if self.chunks.contains_key(&chunk.chunk_index) {
            return false;
        }

        if chunk.last_chunk {
            if let Some(prev) = self.last_chunk_index {
                if prev != chunk.chunk_index {
                    warn!("conflicting last chunks #{} and #{} - ignoring the latter", prev, chunk.chunk_index);
                    return false;
                }
            }
            self.last_chunk_index = Some(chunk.chunk_index);
        }
        self.chunks.insert(chunk.chunk_index, chunk);
        true
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        match self.last_chunk_index {
            Some(last) => self.chunks.len() == last as usize + 1,
            None => false,
        }
    }

    /// returns the serialized message, or `None` if some chunks are still missing
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }

        let total_len = self.chunks.values()
            .map(|c| c.serialized.len())
            .sum();
        let mut buf = BytesMut::with_capacity(total_len);
        for idx in 0..self.chunks.len() as u32 {
            buf.extend_from_slice(&self.chunks.get(&idx)?.serialized);
        }
        Some(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn data(len: usize) -> Bytes {
        (0..len)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<_>>()
            .into()
    }

    #[rstest]
    #[case::large(10_000, 4096, vec![4096, 4096, 1808])]
    #[case::exact_multiple(8192, 4096, vec![4096, 4096])]
    #[case::one_byte_over(4097, 4096, vec![4096, 1])]
    #[case::single(100, 4096, vec![100])]
    #[case::empty(0, 4096, vec![0])]
    #[case::tiny_chunks(5, 1, vec![1, 1, 1, 1, 1])]
    fn test_split_into_chunks(#[case] len: usize, #[case] chunk_size: usize, #[case] expected_sizes: Vec<usize>) {
        let chunks = split_into_chunks(data(len), chunk_size);

        let sizes = chunks.iter()
            .map(|c| c.serialized.len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, expected_sizes);

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.first_chunk, i == 0);
            assert_eq!(chunk.last_chunk, i == chunks.len() - 1);
        }
    }

    #[rstest]
    #[case::disabled(None, 10_000, 1)]
    #[case::below_threshold(Some(4096), 4096, 1)]
    #[case::above_threshold(Some(4096), 10_000, 3)]
    fn test_split_payload(#[case] threshold: Option<usize>, #[case] len: usize, #[case] expected_parts: usize) {
        let payload = data(len).to_vec();
        let parts = split_payload(payload.clone(), threshold);
        assert_eq!(parts.len(), expected_parts);
        if expected_parts == 1 {
            assert_eq!(parts[0], MessageOrChunk::Message(payload));
        }
        else {
            assert!(parts.iter().all(|p| matches!(p, MessageOrChunk::Chunk(_))));
        }
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::shuffled(vec![1, 2, 0])]
    #[case::with_duplicates(vec![1, 1, 2, 0, 2])]
    fn test_assemble(#[case] order: Vec<usize>) {
        let original = data(10_000);
        let chunks = split_into_chunks(original.clone(), 4096);

        let mut assembler = ChunkAssembler::new();
        for &i in &order {
            assembler.add(chunks[i].clone());
        }
        assert!(assembler.is_complete());
        assert_eq!(assembler.num_chunks(), 3);
        assert_eq!(assembler.assemble(), Some(original));
    }

    #[test]
    fn test_assemble_incomplete() {
        let chunks = split_into_chunks(data(10_000), 4096);

        let mut assembler = ChunkAssembler::new();
        assert!(assembler.add(chunks[0].clone()));
        assert!(assembler.add(chunks[2].clone()));
        assert!(!assembler.add(chunks[2].clone()));

        assert!(!assembler.is_complete());
        assert_eq!(assembler.assemble(), None);
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = "x".repeat(10_000);
        let parts = split_payload(payload.clone(), Some(4096));

        let mut assembler = ChunkAssembler::new();
        for part in parts {
            match part {
                MessageOrChunk::Chunk(c) => { assembler.add(c); }
                MessageOrChunk::Message(_) => panic!("expected chunks"),
            }
        }
        let serialized = assembler.assemble().unwrap();
        assert_eq!(String::deser(&serialized).unwrap(), payload);
    }
}
