use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::link::{ConsumerLink, ProducerLink};
use crate::protocol::{ControlMessage, DeliveryPayload, SeqNr};

pub(crate) enum ProducerCommand<A> {
    Start { producer: mpsc::Sender<RequestNext<A>> },
    RegisterConsumer { consumer: Arc<dyn ConsumerLink<A>> },
    Msg { message: A, confirm_to: Option<oneshot::Sender<SeqNr>>, generation: u64 },
    Control(ControlMessage),
    Stop,
}

impl<A: Debug> Debug for ProducerCommand<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerCommand::Start { .. } => write!(f, "Start"),
            ProducerCommand::RegisterConsumer { .. } => write!(f, "RegisterConsumer"),
            ProducerCommand::Msg { message, confirm_to, .. } => write!(f, "Msg({:?}, with confirmation: {})", message, confirm_to.is_some()),
            ProducerCommand::Control(msg) => write!(f, "Control({:?})", msg),
            ProducerCommand::Stop => write!(f, "Stop"),
        }
    }
}

/// Sent to the application producer when the producer controller is ready to accept the next
///  message. The message is handed over through `send_next_to`, which can be used once.
pub struct RequestNext<A> {
    pub producer_id: String,
    pub current_seq_nr: SeqNr,
    pub confirmed_seq_nr: SeqNr,
    pub send_next_to: SendNextTo<A>,
}

impl<A> Debug for RequestNext<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestNext{{producer_id: {:?}, current_seq_nr: {}, confirmed_seq_nr: {}}}", self.producer_id, self.current_seq_nr, self.confirmed_seq_nr)
    }
}

/// NB: not `Clone`, there is demand for exactly one message per `RequestNext`.
pub struct SendNextTo<A> {
    commands: mpsc::Sender<ProducerCommand<A>>,
    generation: u64,
}

impl<A: DeliveryPayload> SendNextTo<A> {
    pub(crate) fn new(commands: mpsc::Sender<ProducerCommand<A>>, generation: u64) -> SendNextTo<A> {
        SendNextTo { commands, generation }
    }

    pub async fn send(self, message: A) -> anyhow::Result<()> {
        self.commands.send(ProducerCommand::Msg { message, confirm_to: None, generation: self.generation }).await
            .map_err(|_| anyhow!("producer controller is terminated"))
    }

    /// The returned receiver completes with the message's sequence number once the consumer
    ///  confirmed it (and, with a durable queue, after it was stored).
    pub async fn send_with_confirmation(self, message: A) -> anyhow::Result<oneshot::Receiver<SeqNr>> {
        let (send, recv) = oneshot::channel();
        self.commands.send(ProducerCommand::Msg { message, confirm_to: Some(send), generation: self.generation }).await
            .map_err(|_| anyhow!("producer controller is terminated"))?;
        Ok(recv)
    }
}

/// The application's handle to a running producer controller. It is also the link on which
///  the consumer controller sends its control messages back.
pub struct ProducerControllerHandle<A> {
    producer_id: String,
    commands: mpsc::Sender<ProducerCommand<A>>,
}

impl<A> Clone for ProducerControllerHandle<A> {
    fn clone(&self) -> Self {
        ProducerControllerHandle {
            producer_id: self.producer_id.clone(),
            commands: self.commands.clone(),
        }
    }
}

impl<A: DeliveryPayload> ProducerControllerHandle<A> {
    pub(crate) fn new(producer_id: String, commands: mpsc::Sender<ProducerCommand<A>>) -> ProducerControllerHandle<A> {
        ProducerControllerHandle { producer_id, commands }
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Starts pulling messages from the application producer. `RequestNext` messages are sent
    ///  to `producer` one at a time, the next one only after a message was sent in response
    ///  to the previous one.
    pub async fn start(&self, producer: mpsc::Sender<RequestNext<A>>) -> anyhow::Result<()> {
        self.send_command(ProducerCommand::Start { producer }).await
    }

    /// Binds the producer controller to a consumer controller, starting a new delivery session.
    pub async fn register_consumer(&self, consumer: Arc<dyn ConsumerLink<A>>) -> anyhow::Result<()> {
        self.send_command(ProducerCommand::RegisterConsumer { consumer }).await
    }

    /// Stops pulling messages. The controller terminates when all messages that were sent
    ///  are confirmed.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send_command(ProducerCommand::Stop).await
    }

    async fn send_command(&self, command: ProducerCommand<A>) -> anyhow::Result<()> {
        self.commands.send(command).await
            .map_err(|_| anyhow!("producer controller {} is terminated", self.producer_id))
    }
}

#[async_trait]
impl<A: DeliveryPayload> ProducerLink for ProducerControllerHandle<A> {
    async fn send(&self, msg: ControlMessage) {
        if self.commands.send(ProducerCommand::Control(msg)).await.is_err() {
            debug!("producer controller {} is terminated - dropping {:?}", self.producer_id, msg);
        }
    }
}
