use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::ProducerControllerConfig;
use crate::durable_queue::{now_millis, with_retries, DurableProducerQueue, DurableState, MessageSent, StoreMessageSentAck, NO_QUALIFIER};
use crate::link::{ConsumerLink, ProducerLink};
use crate::producer::producer_messages::{ProducerCommand, RequestNext, SendNextTo};
use crate::protocol::chunking::split_payload;
use crate::protocol::{ControlMessage, DeliveryPayload, SeqNr, SequencedMessage};

/// Results of durable queue operations, which run as separate tasks
pub(crate) enum StoreReply {
    MessageSent(anyhow::Result<StoreMessageSentAck>),
    Confirmed(anyhow::Result<()>),
}

/// A message (or one of its chunks) that is being stored, and the message's remaining chunks
///  which are stored after it
struct StoreInProgress<A> {
    storing: SequencedMessage<A>,
    remaining: VecDeque<SequencedMessage<A>>,
}

pub(crate) struct ProducerSession<A: DeliveryPayload> {
    producer_id: String,
    config: Arc<ProducerControllerConfig>,
    commands: mpsc::Sender<ProducerCommand<A>>,
    self_link: Arc<dyn ProducerLink>,
    store_replies: mpsc::Sender<StoreReply>,
    durable_queue: Option<Arc<dyn DurableProducerQueue<A>>>,

    producer: Option<mpsc::Sender<RequestNext<A>>>,
    consumer: Option<Arc<dyn ConsumerLink<A>>>,

    /// the sequence number of the next message
    current_seq_nr: SeqNr,
    confirmed_seq_nr: SeqNr,
    /// the consumer granted messages up to and including this sequence number
    requested_seq_nr: SeqNr,
    /// the first message of the current delivery session
    first_seq_nr: SeqNr,
    supports_resend: bool,
    /// a `Request` was received in the current delivery session
    request_received: bool,
    /// the application producer has an unused `RequestNext`
    requested: bool,
    /// incremented on each `Start`, messages sent through an older `SendNextTo` are ignored
    producer_generation: u64,
    stopping: bool,

    unconfirmed: VecDeque<SequencedMessage<A>>,
    reply_after_confirm: BTreeMap<SeqNr, oneshot::Sender<SeqNr>>,
    store_in_progress: Option<StoreInProgress<A>>,
    /// number of spawned `store_message_confirmed` calls that did not report back yet
    confirmations_in_progress: usize,
    pending_commands: VecDeque<ProducerCommand<A>>,
}

impl<A: DeliveryPayload> ProducerSession<A> {
    pub(crate) fn new(
        producer_id: String,
        config: Arc<ProducerControllerConfig>,
        commands: mpsc::Sender<ProducerCommand<A>>,
        self_link: Arc<dyn ProducerLink>,
        store_replies: mpsc::Sender<StoreReply>,
        durable_queue: Option<Arc<dyn DurableProducerQueue<A>>>,
        loaded_state: DurableState<A>,
    ) -> ProducerSession<A> {
        let highest_confirmed = loaded_state.highest_confirmed_seq_nr;
        let first_seq_nr = highest_confirmed + 1;

        let unconfirmed = loaded_state.unconfirmed.into_iter()
            .filter(|sent| sent.seq_nr > highest_confirmed)
            .map(|sent| SequencedMessage {
                producer_id: producer_id.clone(),
                seq_nr: sent.seq_nr,
                message: sent.message,
                first: sent.seq_nr == first_seq_nr,
                ack: sent.ack,
            })
            .collect::<VecDeque<_>>();

        ProducerSession {
            producer_id,
            config,
            commands,
            self_link,
            store_replies,
            durable_queue,
            producer: None,
            consumer: None,
            current_seq_nr: loaded_state.current_seq_nr,
            confirmed_seq_nr: highest_confirmed,
            requested_seq_nr: first_seq_nr,
            first_seq_nr,
            supports_resend: true,
            request_received: false,
            requested: false,
            producer_generation: 0,
            stopping: false,
            unconfirmed,
            reply_after_confirm: Default::default(),
            store_in_progress: None,
            confirmations_in_progress: 0,
            pending_commands: Default::default(),
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.stopping
            && self.unconfirmed.is_empty()
            && self.store_in_progress.is_none()
            && self.confirmations_in_progress == 0
            && self.pending_commands.is_empty()
    }

    pub(crate) async fn on_command(&mut self, command: ProducerCommand<A>) -> anyhow::Result<()> {
        if self.store_in_progress.is_some() {
            if self.pending_commands.len() >= self.config.max_pending_commands {
                bail!("producer {}: more than {} commands pending while waiting for the durable queue", self.producer_id, self.config.max_pending_commands);
            }
            trace!("producer {}: store in progress - stashing {:?}", self.producer_id, command);
            self.pending_commands.push_back(command);
            return Ok(());
        }
        self.handle_command(command).await
    }

    async fn handle_command(&mut self, command: ProducerCommand<A>) -> anyhow::Result<()> {
        trace!("producer {}: {:?}", self.producer_id, command);

        match command {
            ProducerCommand::Start { producer } => {
                if self.producer.is_some() {
                    debug!("producer {}: application producer was restarted", self.producer_id);
                    self.requested = false;
                }
                self.producer_generation += 1;
                self.producer = Some(producer);
                self.request_next_if_possible().await
            }
            ProducerCommand::RegisterConsumer { consumer } => {
                self.on_register_consumer(consumer).await;
                self.request_next_if_possible().await
            }
            ProducerCommand::Msg { message, confirm_to, generation } => {
                if generation != self.producer_generation {
                    debug!("producer {}: message from a previous application producer - ignoring", self.producer_id);
                    return Ok(());
                }
                self.on_msg(message, confirm_to).await
            }
            ProducerCommand::Control(ControlMessage::Request { confirmed_seq_nr, request_up_to_seq_nr, supports_resend, via_timeout }) => {
                self.on_request(confirmed_seq_nr, request_up_to_seq_nr, supports_resend, via_timeout).await
            }
            ProducerCommand::Control(ControlMessage::Resend { from_seq_nr }) => {
                self.on_ack(from_seq_nr.saturating_sub(1));
                self.resend_from(from_seq_nr).await;
                Ok(())
            }
            ProducerCommand::Control(ControlMessage::Ack { confirmed_seq_nr }) => {
                self.on_ack(confirmed_seq_nr);
                Ok(())
            }
            ProducerCommand::Stop => {
                info!("producer {}: stopping after {} unconfirmed messages are confirmed", self.producer_id, self.unconfirmed.len());
                self.stopping = true;
                Ok(())
            }
        }
    }

    async fn on_register_consumer(&mut self, consumer: Arc<dyn ConsumerLink<A>>) {
        if self.consumer.is_some() {
            info!("producer {}: registering a new consumer", self.producer_id);
        }

        self.consumer = Some(consumer);
        self.first_seq_nr = self.unconfirmed.front()
            .map(|m| m.seq_nr)
            .unwrap_or(self.current_seq_nr);
        self.requested_seq_nr = self.first_seq_nr;
        self.request_received = false;
        self.supports_resend = true;

        debug!("producer {}: new delivery session starting at #{}", self.producer_id, self.first_seq_nr);
        self.send_first().await;
    }

    async fn on_msg(&mut self, message: A, confirm_to: Option<oneshot::Sender<SeqNr>>) -> anyhow::Result<()> {
        if !self.requested {
            bail!("producer {}: unexpected message without demand: {:?}", self.producer_id, message);
        }
        self.requested = false;

        let seq_nr = self.current_seq_nr;
        self.current_seq_nr += 1;

        let ack = self.durable_queue.is_some() || confirm_to.is_some();
        if let Some(confirm_to) = confirm_to {
            self.reply_after_confirm.insert(seq_nr, confirm_to);
        }

        let first = seq_nr == self.first_seq_nr;
        let mut parts = split_payload(message, self.config.chunk_large_messages_bytes)
            .into_iter()
            .map(|message| SequencedMessage {
                producer_id: self.producer_id.clone(),
                seq_nr,
                message,
                first,
                ack,
            })
            .collect::<VecDeque<_>>();
        if parts.len() > 1 {
            debug!("producer {}: message #{} is split into {} chunks", self.producer_id, seq_nr, parts.len());
        }

        if self.durable_queue.is_some() {
            if let Some(storing) = parts.pop_front() {
                self.store_message_sent(&storing);
                self.store_in_progress = Some(StoreInProgress { storing, remaining: parts });
            }
            return Ok(());
        }

        for msg in parts {
            self.send_sequenced(msg).await;
        }
        self.request_next_if_possible().await
    }

    async fn on_request(&mut self, confirmed_seq_nr: SeqNr, request_up_to_seq_nr: SeqNr, supports_resend: bool, via_timeout: bool) -> anyhow::Result<()> {
        if confirmed_seq_nr > request_up_to_seq_nr {
            warn!("producer {}: invalid request confirming #{} but requesting only up to #{} - ignoring", self.producer_id, confirmed_seq_nr, request_up_to_seq_nr);
            return Ok(());
        }

        self.on_ack(confirmed_seq_nr);

        let handshake = !self.request_received;
        self.request_received = true;

        if supports_resend {
            if via_timeout {
                self.resend_from(confirmed_seq_nr + 1).await;
            }
            else if handshake {
                // the consumer has the first message, everything after it may have been dropped
                self.resend_from(self.first_seq_nr + 1).await;
            }
        }
        else if self.supports_resend {
            debug!("producer {}: consumer does not support resend - dropping unconfirmed messages", self.producer_id);
            self.unconfirmed.clear();
        }
        self.supports_resend = supports_resend;

        let new_requested_seq_nr = if !supports_resend && via_timeout && request_up_to_seq_nr < self.current_seq_nr {
            // all messages in the window were lost: widen the window so the producer can continue
            self.current_seq_nr + (request_up_to_seq_nr - confirmed_seq_nr)
        }
        else {
            request_up_to_seq_nr
        };

        if new_requested_seq_nr > self.requested_seq_nr {
            trace!("producer {}: consumer requested up to #{}", self.producer_id, new_requested_seq_nr);
            self.requested_seq_nr = new_requested_seq_nr;
        }
        self.request_next_if_possible().await
    }

    /// `confirmed_seq_nr` is cumulative
    fn on_ack(&mut self, confirmed_seq_nr: SeqNr) {
        let confirmed_seq_nr = confirmed_seq_nr.min(self.current_seq_nr - 1);
        if confirmed_seq_nr <= self.confirmed_seq_nr {
            return;
        }
        trace!("producer {}: confirmed up to #{}", self.producer_id, confirmed_seq_nr);

        let not_yet_confirmed = self.reply_after_confirm.split_off(&(confirmed_seq_nr + 1));
        for (seq_nr, reply) in std::mem::replace(&mut self.reply_after_confirm, not_yet_confirmed) {
            if reply.send(seq_nr).is_err() {
                trace!("producer {}: confirmation for #{} is not awaited", self.producer_id, seq_nr);
            }
        }

        while self.unconfirmed.front().is_some_and(|m| m.seq_nr <= confirmed_seq_nr) {
            self.unconfirmed.pop_front();
        }
        self.confirmed_seq_nr = confirmed_seq_nr;

        self.store_message_confirmed(confirmed_seq_nr);
    }

    pub(crate) async fn on_store_reply(&mut self, reply: StoreReply) -> anyhow::Result<()> {
        match reply {
            StoreReply::Confirmed(result) => {
                self.confirmations_in_progress = self.confirmations_in_progress.saturating_sub(1);
                result.with_context(|| format!("producer {}: storing a confirmation failed", self.producer_id))
            }
            StoreReply::MessageSent(result) => {
                let ack = result.with_context(|| format!("producer {}: storing a message failed", self.producer_id))?;

                let Some(mut in_progress) = self.store_in_progress.take() else {
                    warn!("producer {}: unexpected store acknowledgement for #{} - ignoring", self.producer_id, ack.stored_seq_nr);
                    return Ok(());
                };
                trace!("producer {}: stored #{}", self.producer_id, ack.stored_seq_nr);

                self.send_sequenced(in_progress.storing).await;

                if let Some(next) = in_progress.remaining.pop_front() {
                    self.store_message_sent(&next);
                    self.store_in_progress = Some(StoreInProgress { storing: next, remaining: in_progress.remaining });
                    return Ok(());
                }

                self.request_next_if_possible().await?;
                self.unstash().await
            }
        }
    }

    async fn unstash(&mut self) -> anyhow::Result<()> {
        while self.store_in_progress.is_none() {
            let Some(command) = self.pending_commands.pop_front() else {
                break;
            };
            self.handle_command(command).await?;
        }
        Ok(())
    }

    pub(crate) async fn on_resend_first_tick(&mut self) {
        if self.request_received {
            return;
        }
        if self.unconfirmed.front().map(|m| m.seq_nr) == Some(self.first_seq_nr) {
            debug!("producer {}: no response from consumer yet - resending first message #{}", self.producer_id, self.first_seq_nr);
            self.send_first().await;
        }
    }

    async fn send_first(&self) {
        let Some(consumer) = &self.consumer else {
            return;
        };

        for msg in self.unconfirmed.iter().take_while(|m| m.seq_nr == self.first_seq_nr) {
            consumer.send(msg.clone().with_first(true), self.self_link.clone()).await;
        }
    }

    async fn resend_from(&self, from_seq_nr: SeqNr) {
        let Some(consumer) = &self.consumer else {
            return;
        };

        let mut num_resent = 0;
        for msg in self.unconfirmed.iter().filter(|m| m.seq_nr >= from_seq_nr) {
            let first = msg.seq_nr == self.first_seq_nr;
            consumer.send(msg.clone().with_first(first), self.self_link.clone()).await;
            num_resent += 1;
        }
        if num_resent > 0 {
            debug!("producer {}: resent {} messages / chunks from #{}", self.producer_id, num_resent, from_seq_nr);
        }
    }

    async fn send_sequenced(&mut self, msg: SequencedMessage<A>) {
        if self.supports_resend {
            self.unconfirmed.push_back(msg.clone());
        }
        match &self.consumer {
            Some(consumer) => consumer.send(msg, self.self_link.clone()).await,
            None => trace!("producer {}: no consumer registered yet - keeping #{} for later", self.producer_id, msg.seq_nr),
        }
    }

    async fn request_next_if_possible(&mut self) -> anyhow::Result<()> {
        if self.requested || self.stopping || self.store_in_progress.is_some() || self.current_seq_nr > self.requested_seq_nr {
            return Ok(());
        }
        let Some(producer) = &self.producer else {
            return Ok(());
        };

        let request_next = RequestNext {
            producer_id: self.producer_id.clone(),
            current_seq_nr: self.current_seq_nr,
            confirmed_seq_nr: self.confirmed_seq_nr,
            send_next_to: SendNextTo::new(self.commands.clone(), self.producer_generation),
        };
        trace!("producer {}: {:?}", self.producer_id, request_next);
        if producer.send(request_next).await.is_err() {
            bail!("producer {}: the application producer is gone", self.producer_id);
        }
        self.requested = true;
        Ok(())
    }

    fn store_message_sent(&self, msg: &SequencedMessage<A>) {
        let Some(queue) = self.durable_queue.clone() else {
            return;
        };

        let sent = MessageSent {
            seq_nr: msg.seq_nr,
            message: msg.message.clone(),
            ack: msg.ack,
            confirmation_qualifier: NO_QUALIFIER.to_string(),
            timestamp_millis: now_millis(),
        };
        let what = format!("producer {}: storing message #{}", self.producer_id, msg.seq_nr);
        let config = self.config.durable_queue.clone();
        let replies = self.store_replies.clone();

        tokio::spawn(async move {
            let result = with_retries(&what, config.request_timeout, config.retry_attempts, || {
                let queue = queue.clone();
                let sent = sent.clone();
                async move { queue.store_message_sent(sent).await }
            }).await;
            let _ = replies.send(StoreReply::MessageSent(result)).await;
        });
    }

    fn store_message_confirmed(&mut self, confirmed_seq_nr: SeqNr) {
        let Some(queue) = self.durable_queue.clone() else {
            return;
        };
        self.confirmations_in_progress += 1;

        let what = format!("producer {}: storing confirmation of #{}", self.producer_id, confirmed_seq_nr);
        let config = self.config.durable_queue.clone();
        let replies = self.store_replies.clone();
        let timestamp_millis = now_millis();

        tokio::spawn(async move {
            let result = with_retries(&what, config.request_timeout, config.retry_attempts, || {
                let queue = queue.clone();
                async move { queue.store_message_confirmed(confirmed_seq_nr, NO_QUALIFIER.to_string(), timestamp_millis).await }
            }).await;
            let _ = replies.send(StoreReply::Confirmed(result)).await;
        });
    }
}
