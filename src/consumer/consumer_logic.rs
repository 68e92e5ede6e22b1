use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ConsumerControllerConfig;
use crate::consumer::consumer_messages::{ConfirmTo, ConsumerCommand, Delivery};
use crate::consumer::resend_backoff::ResendBackoff;
use crate::link::ProducerLink;
use crate::protocol::chunking::ChunkAssembler;
use crate::protocol::{ControlMessage, DeliveryPayload, MessageOrChunk, SeqNr, SequencedMessage};

/// A delivery session is identified by the producer id and the link the producer sends its
///  messages from.
struct ProducerBinding {
    producer_id: String,
    link: Arc<dyn ProducerLink>,
    epoch: u64,
}

enum Received<A> {
    Whole { message: A, ack: bool },
    Chunks { assembler: ChunkAssembler, ack: bool },
}

impl<A> Received<A> {
    fn is_complete(&self) -> bool {
        match self {
            Received::Whole { .. } => true,
            Received::Chunks { assembler, .. } => assembler.is_complete(),
        }
    }
}

/// the delivery awaiting confirmation, kept for handing it to a restarted application consumer
struct InFlight<A> {
    seq_nr: SeqNr,
    ack: bool,
    binding_epoch: u64,
    producer_id: String,
    message: A,
}

impl<A: DeliveryPayload> InFlight<A> {
    fn to_delivery(&self, commands: &mpsc::Sender<ConsumerCommand<A>>) -> Delivery<A> {
        Delivery {
            message: self.message.clone(),
            producer_id: self.producer_id.clone(),
            seq_nr: self.seq_nr,
            confirm_to: ConfirmTo::new(self.seq_nr, self.binding_epoch, commands.clone()),
        }
    }
}

pub(crate) struct ConsumerSession<A: DeliveryPayload> {
    config: Arc<ConsumerControllerConfig>,
    commands: mpsc::Sender<ConsumerCommand<A>>,
    deliver_to: Option<mpsc::Sender<Delivery<A>>>,
    before_start: VecDeque<(SequencedMessage<A>, Arc<dyn ProducerLink>)>,

    producer: Option<ProducerBinding>,
    num_bindings: u64,

    /// the next sequence number to be delivered
    expected_seq_nr: SeqNr,
    confirmed_seq_nr: SeqNr,
    requested_seq_nr: SeqNr,
    /// messages and chunks at or after `expected_seq_nr` that were not delivered yet
    received: BTreeMap<SeqNr, Received<A>>,
    in_flight: Option<InFlight<A>>,
    resend_requested_from: Option<SeqNr>,

    backoff: ResendBackoff,
    retry_deadline: Option<Instant>,
    stopping: bool,
}

impl<A: DeliveryPayload> ConsumerSession<A> {
    pub(crate) fn new(config: Arc<ConsumerControllerConfig>, commands: mpsc::Sender<ConsumerCommand<A>>) -> ConsumerSession<A> {
        ConsumerSession {
            backoff: ResendBackoff::new(&config),
            config,
            commands,
            deliver_to: None,
            before_start: Default::default(),
            producer: None,
            num_bindings: 0,
            expected_seq_nr: 1,
            confirmed_seq_nr: 0,
            requested_seq_nr: 0,
            received: Default::default(),
            in_flight: None,
            resend_requested_from: None,
            retry_deadline: None,
            stopping: false,
        }
    }

    pub(crate) fn retry_deadline(&self) -> Option<Instant> {
        self.retry_deadline
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.stopping
            && self.in_flight.is_none()
            && !self.is_complete(self.expected_seq_nr)
    }

    fn supports_resend(&self) -> bool {
        !self.config.only_flow_control
    }

    fn is_complete(&self, seq_nr: SeqNr) -> bool {
        self.received.get(&seq_nr)
            .map(|r| r.is_complete())
            .unwrap_or(false)
    }

    pub(crate) async fn on_command(&mut self, command: ConsumerCommand<A>) -> anyhow::Result<()> {
        trace!("consumer: {:?}", command);

        match command {
            ConsumerCommand::Start { deliver_to } => {
                if self.deliver_to.is_some() {
                    debug!("application consumer was restarted");
                }
                self.deliver_to = Some(deliver_to);
                if self.in_flight.is_some() {
                    self.redeliver_in_flight().await?;
                }
                for (msg, reply_to) in std::mem::take(&mut self.before_start) {
                    self.on_sequenced(msg, reply_to).await?;
                }
                self.deliver_next_if_possible().await?;
            }
            ConsumerCommand::Sequenced { msg, reply_to } => {
                self.on_sequenced(msg, reply_to).await?;
            }
            ConsumerCommand::Confirmed { seq_nr, binding_epoch } => {
                self.on_confirmed(seq_nr, binding_epoch).await?;
            }
            ConsumerCommand::DeliverThenStop => {
                info!("stopping after delivering the remaining messages");
                self.stopping = true;
            }
        }

        self.update_retry_deadline();
        Ok(())
    }

    async fn on_sequenced(&mut self, msg: SequencedMessage<A>, reply_to: Arc<dyn ProducerLink>) -> anyhow::Result<()> {
        if self.deliver_to.is_none() {
            if self.before_start.len() < self.config.max_buffered_before_start {
                self.before_start.push_back((msg, reply_to));
            }
            else {
                warn!("consumer is not started and its buffer is full - dropping message #{} from producer {}", msg.seq_nr, msg.producer_id);
            }
            return Ok(());
        }

        let is_bound = match &self.producer {
            Some(binding) => binding.producer_id == msg.producer_id && Arc::ptr_eq(&binding.link, &reply_to),
            None => false,
        };

        if !is_bound {
            if !msg.first {
                debug!("message #{} from producer {} which is not bound - dropping", msg.seq_nr, msg.producer_id);
                return Ok(());
            }
            self.bind(msg.producer_id.clone(), reply_to, msg.seq_nr).await;
        }
        else if msg.first && msg.seq_nr > self.expected_seq_nr {
            debug!("producer {} started a new delivery session at #{}", msg.producer_id, msg.seq_nr);
            self.bind(msg.producer_id.clone(), reply_to, msg.seq_nr).await;
        }

        let seq_nr = msg.seq_nr;
        if seq_nr < self.expected_seq_nr {
            trace!("duplicate message #{} - dropping", seq_nr);
            return Ok(());
        }
        if seq_nr > self.requested_seq_nr {
            debug!("message #{} is beyond the requested window (up to #{}) - dropping", seq_nr, self.requested_seq_nr);
            return Ok(());
        }

        let ack = msg.ack;
        match msg.message {
            MessageOrChunk::Message(message) => match self.received.entry(seq_nr) {
                Entry::Vacant(e) => {
                    e.insert(Received::Whole { message, ack });
                }
                Entry::Occupied(_) => {
                    trace!("duplicate message #{} - dropping", seq_nr);
                    return Ok(());
                }
            },
            MessageOrChunk::Chunk(chunk) => {
                let entry = self.received.entry(seq_nr)
                    .or_insert_with(|| Received::Chunks { assembler: ChunkAssembler::new(), ack });
                match entry {
                    Received::Chunks { assembler, .. } => {
                        if !assembler.add(chunk) {
                            trace!("duplicate chunk of message #{} - dropping", seq_nr);
                            return Ok(());
                        }
                    }
                    Received::Whole { .. } => {
                        warn!("received a chunk for message #{} which was received as a whole - dropping", seq_nr);
                        return Ok(());
                    }
                }
            }
        }

        if seq_nr > self.expected_seq_nr
            && self.supports_resend()
            && !self.is_complete(self.expected_seq_nr)
            && self.resend_requested_from != Some(self.expected_seq_nr)
        {
            let from_seq_nr = self.expected_seq_nr;
            debug!("received #{} while expecting #{} - requesting resend", seq_nr, from_seq_nr);
            self.resend_requested_from = Some(from_seq_nr);
            self.send_to_producer(ControlMessage::Resend { from_seq_nr }).await;
        }

        self.deliver_next_if_possible().await
    }

    async fn bind(&mut self, producer_id: String, link: Arc<dyn ProducerLink>, seq_nr: SeqNr) {
        match &self.producer {
            Some(prev) if prev.producer_id != producer_id => info!("switching from producer {} to producer {} at #{}", prev.producer_id, producer_id, seq_nr),
            _ => debug!("binding to producer {} at #{}", producer_id, seq_nr),
        }
        if !self.received.is_empty() {
            debug!("discarding {} buffered messages of the previous delivery session", self.received.len());
            self.received.clear();
        }

        self.num_bindings += 1;
        self.producer = Some(ProducerBinding {
            producer_id,
            link,
            epoch: self.num_bindings,
        });
        self.expected_seq_nr = seq_nr;
        self.confirmed_seq_nr = seq_nr.saturating_sub(1);
        self.requested_seq_nr = self.confirmed_seq_nr + self.config.flow_control_window as SeqNr;
        self.resend_requested_from = None;
        self.on_progress();

        self.send_request(false).await;
    }

    async fn deliver_next_if_possible(&mut self) -> anyhow::Result<()> {
        if self.in_flight.is_some() {
            return Ok(());
        }
        let Some(deliver_to) = self.deliver_to.clone() else {
            return Ok(());
        };

        if !self.supports_resend() && !self.is_complete(self.expected_seq_nr) {
            let next_complete = self.received.iter()
                .find(|(_, r)| r.is_complete())
                .map(|(&seq_nr, _)| seq_nr);
            if let Some(next_complete) = next_complete {
                debug!("skipping lost messages #{} to #{}", self.expected_seq_nr, next_complete - 1);
                self.received = self.received.split_off(&next_complete);
                self.expected_seq_nr = next_complete;
            }
        }

        if !self.is_complete(self.expected_seq_nr) {
            return Ok(());
        }
        let (producer_id, binding_epoch) = match &self.producer {
            Some(binding) => (binding.producer_id.clone(), binding.epoch),
            None => return Ok(()),
        };
        let Some(received) = self.received.remove(&self.expected_seq_nr) else {
            return Ok(());
        };

        let seq_nr = self.expected_seq_nr;
        let (message, ack) = match received {
            Received::Whole { message, ack } => (message, ack),
            Received::Chunks { assembler, ack } => {
                let Some(serialized) = assembler.assemble() else {
                    bail!("message #{} from producer {} is incomplete", seq_nr, producer_id);
                };
                let message = A::deser(&serialized)
                    .with_context(|| format!("deserializing chunked message #{} from producer {} failed", seq_nr, producer_id))?;
                (message, ack)
            }
        };

        self.expected_seq_nr += 1;
        if self.resend_requested_from.is_some_and(|from| from < self.expected_seq_nr) {
            self.resend_requested_from = None;
        }
        trace!("delivering message #{} from producer {}", seq_nr, producer_id);
        let in_flight = InFlight { seq_nr, ack, binding_epoch, producer_id, message };
        let delivery = in_flight.to_delivery(&self.commands);
        self.in_flight = Some(in_flight);
        self.on_progress();

        if deliver_to.send(delivery).await.is_err() {
            bail!("the application consumer is gone");
        }
        Ok(())
    }

    /// A restarted application consumer gets the unconfirmed delivery again.
    async fn redeliver_in_flight(&self) -> anyhow::Result<()> {
        let (Some(in_flight), Some(deliver_to)) = (&self.in_flight, &self.deliver_to) else {
            return Ok(());
        };
        debug!("delivering unconfirmed message #{} to the restarted application consumer", in_flight.seq_nr);
        if deliver_to.send(in_flight.to_delivery(&self.commands)).await.is_err() {
            bail!("the application consumer is gone");
        }
        Ok(())
    }

    async fn on_confirmed(&mut self, seq_nr: SeqNr, binding_epoch: u64) -> anyhow::Result<()> {
        match &self.in_flight {
            Some(f) if f.seq_nr == seq_nr && f.binding_epoch == binding_epoch => {}
            _ => {
                debug!("unexpected confirmation of #{} - ignoring", seq_nr);
                return Ok(());
            }
        }
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(());
        };
        self.on_progress();

        let current_epoch = self.producer.as_ref().map(|b| b.epoch);
        if current_epoch == Some(in_flight.binding_epoch) {
            self.confirmed_seq_nr = seq_nr;

            let window = self.config.flow_control_window as SeqNr;
            if seq_nr >= self.requested_seq_nr.saturating_sub(window / 2) {
                self.requested_seq_nr = seq_nr + window;
                self.send_request(false).await;
            }
            else if in_flight.ack {
                self.send_to_producer(ControlMessage::Ack { confirmed_seq_nr: seq_nr }).await;
            }
        }
        else {
            debug!("confirmation of #{} belongs to a previous delivery session - not reporting it", seq_nr);
        }

        self.deliver_next_if_possible().await
    }

    pub(crate) async fn on_retry_timer(&mut self) {
        self.retry_deadline = None;
        if self.producer.is_none() || self.in_flight.is_some() {
            return;
        }

        match self.resend_requested_from {
            Some(from_seq_nr) if self.supports_resend() => {
                debug!("no progress for {:?} - repeating resend from #{}", self.backoff.interval(), from_seq_nr);
                self.send_to_producer(ControlMessage::Resend { from_seq_nr }).await;
            }
            _ => {
                debug!("no progress for {:?} - repeating request", self.backoff.interval());
                self.send_request(true).await;
            }
        }

        self.backoff.on_timeout();
        self.update_retry_deadline();
    }

    fn on_progress(&mut self) {
        self.backoff.reset();
        self.retry_deadline = None;
    }

    /// The timer runs while there is a producer and no delivery is awaiting confirmation.
    fn update_retry_deadline(&mut self) {
        if self.producer.is_none() || self.in_flight.is_some() {
            self.retry_deadline = None;
            return;
        }
        if self.retry_deadline.is_none() {
            self.retry_deadline = Some(Instant::now() + self.backoff.interval());
        }
    }

    async fn send_request(&self, via_timeout: bool) {
        self.send_to_producer(ControlMessage::Request {
            confirmed_seq_nr: self.confirmed_seq_nr,
            request_up_to_seq_nr: self.requested_seq_nr,
            supports_resend: self.supports_resend(),
            via_timeout,
        }).await
    }

    async fn send_to_producer(&self, msg: ControlMessage) {
        if let Some(binding) = &self.producer {
            trace!("sending {:?} to producer {}", msg, binding.producer_id);
            binding.link.send(msg).await;
        }
    }
}
