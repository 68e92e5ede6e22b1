use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::link::{ConsumerLink, ProducerLink};
use crate::producer::ProducerControllerHandle;
use crate::protocol::{DeliveryPayload, SeqNr, SequencedMessage};

pub(crate) enum ConsumerCommand<A> {
    Start { deliver_to: mpsc::Sender<Delivery<A>> },
    Sequenced { msg: SequencedMessage<A>, reply_to: Arc<dyn ProducerLink> },
    Confirmed { seq_nr: SeqNr, binding_epoch: u64 },
    DeliverThenStop,
}

impl<A: Debug> Debug for ConsumerCommand<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerCommand::Start { .. } => write!(f, "Start"),
            ConsumerCommand::Sequenced { msg, .. } => write!(f, "Sequenced({:?})", msg),
            ConsumerCommand::Confirmed { seq_nr, binding_epoch } => write!(f, "Confirmed(#{}, binding {})", seq_nr, binding_epoch),
            ConsumerCommand::DeliverThenStop => write!(f, "DeliverThenStop"),
        }
    }
}

/// A message handed to the application consumer. The consumer controller delivers the next
///  message only after this one was confirmed through `confirm_to`.
pub struct Delivery<A> {
    pub message: A,
    pub producer_id: String,
    pub seq_nr: SeqNr,
    pub confirm_to: ConfirmTo<A>,
}

impl<A: Debug> Debug for Delivery<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Delivery{{message: {:?}, producer_id: {:?}, seq_nr: {}}}", self.message, self.producer_id, self.seq_nr)
    }
}

pub struct ConfirmTo<A> {
    seq_nr: SeqNr,
    binding_epoch: u64,
    commands: mpsc::Sender<ConsumerCommand<A>>,
}

impl<A: DeliveryPayload> ConfirmTo<A> {
    pub(crate) fn new(seq_nr: SeqNr, binding_epoch: u64, commands: mpsc::Sender<ConsumerCommand<A>>) -> ConfirmTo<A> {
        ConfirmTo { seq_nr, binding_epoch, commands }
    }

    /// Confirms that the message was processed, allowing the next message to be delivered.
    pub async fn confirm(self) -> anyhow::Result<()> {
        self.commands.send(ConsumerCommand::Confirmed { seq_nr: self.seq_nr, binding_epoch: self.binding_epoch }).await
            .map_err(|_| anyhow!("consumer controller is terminated"))
    }
}

/// The application's handle to a running consumer controller. It is also the link on which
///  producer controllers send their messages.
pub struct ConsumerControllerHandle<A> {
    commands: mpsc::Sender<ConsumerCommand<A>>,
}

impl<A> Clone for ConsumerControllerHandle<A> {
    fn clone(&self) -> Self {
        ConsumerControllerHandle {
            commands: self.commands.clone(),
        }
    }
}

impl<A: DeliveryPayload> ConsumerControllerHandle<A> {
    pub(crate) fn new(commands: mpsc::Sender<ConsumerCommand<A>>) -> ConsumerControllerHandle<A> {
        ConsumerControllerHandle { commands }
    }

    /// Starts delivering messages to `deliver_to`, one at a time.
    pub async fn start(&self, deliver_to: mpsc::Sender<Delivery<A>>) -> anyhow::Result<()> {
        self.send_command(ConsumerCommand::Start { deliver_to }).await
    }

    /// Registers this consumer controller with a producer controller in the same process.
    pub async fn register_to_producer(&self, producer: &ProducerControllerHandle<A>) -> anyhow::Result<()> {
        producer.register_consumer(Arc::new(self.clone())).await
    }

    /// Stops the controller after all messages that were received completely are delivered and
    ///  confirmed.
    pub async fn deliver_then_stop(&self) -> anyhow::Result<()> {
        self.send_command(ConsumerCommand::DeliverThenStop).await
    }

    async fn send_command(&self, command: ConsumerCommand<A>) -> anyhow::Result<()> {
        self.commands.send(command).await
            .map_err(|_| anyhow!("consumer controller is terminated"))
    }
}

#[async_trait]
impl<A: DeliveryPayload> ConsumerLink<A> for ConsumerControllerHandle<A> {
    async fn send(&self, msg: SequencedMessage<A>, reply_to: Arc<dyn ProducerLink>) {
        let seq_nr = msg.seq_nr;
        if self.commands.send(ConsumerCommand::Sequenced { msg, reply_to }).await.is_err() {
            debug!("consumer controller is terminated - dropping message #{}", seq_nr);
        }
    }
}
