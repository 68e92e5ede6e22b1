//! A durable queue makes a producer crash-safe: every message is stored before it is sent, and
//!  a restarted producer controller continues with the unconfirmed messages and the sequence
//!  numbers from the stored state.
//!
//! This module contains the queue's state machine ([DurableState]) and the contract of the
//!  store that persists it ([DurableProducerQueue]). Storage engines are out of scope, but
//!  there is an [InMemoryDurableQueue] which is useful for testing and which shows how an
//!  event-sourced store is expected to work.

mod durable_state;
mod in_memory;

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::time;
use tracing::warn;

pub use durable_state::*;
pub use in_memory::InMemoryDurableQueue;

use crate::protocol::SeqNr;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct StoreMessageSentAck {
    pub stored_seq_nr: SeqNr,
}

/// A store for a producer's [DurableState]. The producer controller calls these operations
///  with a timeout, retrying them if they fail. Implementations must therefore be idempotent,
///  which the operations of [DurableState] are.
#[async_trait]
pub trait DurableProducerQueue<A: Send + 'static>: Send + Sync + 'static {
    async fn load_state(&self) -> anyhow::Result<DurableState<A>>;

    async fn store_message_sent(&self, sent: MessageSent<A>) -> anyhow::Result<StoreMessageSentAck>;

    async fn store_message_confirmed(&self, seq_nr: SeqNr, confirmation_qualifier: ConfirmationQualifier, timestamp_millis: TimestampMillis) -> anyhow::Result<()>;

    async fn cleanup(&self, confirmation_qualifiers: Vec<ConfirmationQualifier>) -> anyhow::Result<()>;
}

pub fn now_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMillis)
        .unwrap_or(0)
}

/// Calls a store operation with a timeout, repeating it if it fails or times out. The
///  operation is attempted `retry_attempts + 1` times before giving up.
pub async fn with_retries<T, F, Fut>(what: &str, request_timeout: Duration, retry_attempts: u32, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        let e = match time::timeout(request_timeout, op()).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => e,
            Err(_) => anyhow!("timeout after {:?}", request_timeout),
        };

        if attempt >= retry_attempts {
            bail!("{} failed after {} attempts: {}", what, attempt + 1, e);
        }
        attempt += 1;
        warn!("{} failed: {} - retrying (attempt {} of {})", what, e, attempt + 1, retry_attempts + 1);
    }
}
