use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::trace;

use crate::link::{ConsumerLink, ProducerLink};
use crate::protocol::{ControlMessage, SequencedMessage};

/// Probabilities (between 0.0 and 1.0) of a message being dropped, duplicated or delayed by
///  an unreliable link. A delayed message is held back until the next message passes the
///  link, and delivered after that.
#[derive(Debug, Clone)]
pub struct Unreliability {
    pub drop_probability: f64,
    pub duplicate_probability: f64,
    pub reorder_probability: f64,
}

impl Unreliability {
    pub fn new(drop_probability: f64, duplicate_probability: f64, reorder_probability: f64) -> Unreliability {
        Unreliability {
            drop_probability,
            duplicate_probability,
            reorder_probability,
        }
    }

    pub fn reliable() -> Unreliability {
        Unreliability::new(0.0, 0.0, 0.0)
    }
}

struct Chaos<T> {
    config: Unreliability,
    rng: Mutex<StdRng>,
    held_back: Mutex<Option<T>>,
}

impl<T: Clone> Chaos<T> {
    fn new(config: Unreliability, seed: u64) -> Chaos<T> {
        Chaos {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            held_back: Mutex::new(None),
        }
    }

    /// returns the messages that actually pass the link, in the order they pass it
    async fn transmit(&self, msg: T) -> Vec<T> {
        let (drop, duplicate, reorder) = {
            let mut rng = self.rng.lock().await;
            (
                rng.gen_bool(self.config.drop_probability),
                rng.gen_bool(self.config.duplicate_probability),
                rng.gen_bool(self.config.reorder_probability),
            )
        };

        if drop {
            trace!("dropping message");
            return vec![];
        }

        let mut held_back = self.held_back.lock().await;
        if reorder && held_back.is_none() {
            trace!("holding back message");
            *held_back = Some(msg);
            return vec![];
        }

        let mut result = vec![msg.clone()];
        if duplicate {
            trace!("duplicating message");
            result.push(msg);
        }
        if let Some(delayed) = held_back.take() {
            result.push(delayed);
        }
        result
    }
}

/// Wraps a [ConsumerLink], dropping, duplicating and reordering messages at random. The
///  randomness is seeded for reproducible tests.
pub struct UnreliableConsumerLink<A> {
    target: Arc<dyn ConsumerLink<A>>,
    chaos: Chaos<(SequencedMessage<A>, Arc<dyn ProducerLink>)>,
}

impl<A: Clone + Send + Sync + 'static> UnreliableConsumerLink<A> {
    pub fn new(target: Arc<dyn ConsumerLink<A>>, unreliability: Unreliability, seed: u64) -> Arc<Self> {
        Arc::new(UnreliableConsumerLink {
            target,
            chaos: Chaos::new(unreliability, seed),
        })
    }
}

#[async_trait]
impl<A: Clone + Send + Sync + 'static> ConsumerLink<A> for UnreliableConsumerLink<A> {
    async fn send(&self, msg: SequencedMessage<A>, reply_to: Arc<dyn ProducerLink>) {
        for (msg, reply_to) in self.chaos.transmit((msg, reply_to)).await {
            self.target.send(msg, reply_to).await;
        }
    }
}

/// Wraps a [ProducerLink], dropping, duplicating and reordering control messages at random.
pub struct UnreliableProducerLink {
    target: Arc<dyn ProducerLink>,
    chaos: Chaos<ControlMessage>,
}

impl UnreliableProducerLink {
    pub fn new(target: Arc<dyn ProducerLink>, unreliability: Unreliability, seed: u64) -> Arc<Self> {
        Arc::new(UnreliableProducerLink {
            target,
            chaos: Chaos::new(unreliability, seed),
        })
    }
}

#[async_trait]
impl ProducerLink for UnreliableProducerLink {
    async fn send(&self, msg: ControlMessage) {
        for msg in self.chaos.transmit(msg).await {
            self.target.send(msg).await;
        }
    }
}
