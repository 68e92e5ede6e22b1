//! The producer side of reliable delivery.
//!
//! A [ProducerController] numbers the messages it pulls from the application producer, stores
//!  them in an (optional) durable queue and sends them to the consumer controller. It keeps
//!  every message until the consumer controller confirmed it, and re-sends it when asked to.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tracing::{debug, info};

use crate::config::DeliveryConfig;
use crate::durable_queue::{with_retries, DurableProducerQueue, DurableState};
use crate::link::ProducerLink;
use crate::producer::producer_logic::ProducerSession;
use crate::protocol::DeliveryPayload;

pub use producer_messages::{ProducerControllerHandle, RequestNext, SendNextTo};
use producer_messages::ProducerCommand;

mod producer_logic;
mod producer_messages;

pub struct ProducerController<A: DeliveryPayload> {
    producer_id: String,
    config: Arc<DeliveryConfig>,
    durable_queue: Option<Arc<dyn DurableProducerQueue<A>>>,
    reply_link: Option<Arc<dyn ProducerLink>>,
    commands_send: mpsc::Sender<ProducerCommand<A>>,
    commands_recv: mpsc::Receiver<ProducerCommand<A>>,
}

impl<A: DeliveryPayload> ProducerController<A> {
    pub fn new(producer_id: impl Into<String>, config: Arc<DeliveryConfig>, durable_queue: Option<Arc<dyn DurableProducerQueue<A>>>) -> ProducerController<A> {
        let (commands_send, commands_recv) = mpsc::channel(1024);
        ProducerController {
            producer_id: producer_id.into(),
            config,
            durable_queue,
            reply_link: None,
            commands_send,
            commands_recv,
        }
    }

    /// By default, the consumer controller sends its responses to the controller's handle
    ///  directly. A transport can replace that by a link that forwards to the handle.
    pub fn with_reply_link(mut self, reply_link: Arc<dyn ProducerLink>) -> ProducerController<A> {
        self.reply_link = Some(reply_link);
        self
    }

    pub fn handle(&self) -> ProducerControllerHandle<A> {
        ProducerControllerHandle::new(self.producer_id.clone(), self.commands_send.clone())
    }

    pub fn spawn(self) -> (ProducerControllerHandle<A>, JoinHandle<anyhow::Result<()>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Runs the controller until it is stopped and all messages are confirmed. A durable
    ///  queue that keeps failing terminates it with an error.
    pub async fn run(self) -> anyhow::Result<()> {
        let ProducerController { producer_id, config, durable_queue, reply_link, commands_send, mut commands_recv } = self;

        if durable_queue.is_some() {
            config.validate_with_durable_queue()?;
        }
        else {
            config.validate()?;
        }
        let config = Arc::new(config.producer_controller.clone());

        let loaded_state = match &durable_queue {
            Some(queue) => {
                debug!("producer {}: loading durable state", producer_id);
                let what = format!("producer {}: loading durable state", producer_id);
                let state = with_retries(&what, config.durable_queue.request_timeout, config.durable_queue.retry_attempts, || {
                    let queue = queue.clone();
                    async move { queue.load_state().await }
                }).await?;
                info!("producer {}: loaded durable state with {} unconfirmed messages / chunks, continuing at #{}", producer_id, state.unconfirmed.len(), state.current_seq_nr);
                state
            }
            None => DurableState::empty(),
        };

        let (store_replies_send, mut store_replies) = mpsc::channel(16);
        let reply_link = reply_link.unwrap_or_else(|| Arc::new(ProducerControllerHandle::new(producer_id.clone(), commands_send.clone())));

        let mut session = ProducerSession::new(producer_id.clone(), config.clone(), commands_send, reply_link, store_replies_send, durable_queue, loaded_state);

        let mut resend_first_ticks = time::interval(config.durable_queue.resend_first_interval);
        resend_first_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resend_first_ticks.tick().await;

        loop {
            if session.is_terminated() {
                info!("producer {}: all messages are confirmed - terminating", producer_id);
                return Ok(());
            }

            select! {
                cmd = commands_recv.recv() => {
                    let cmd = cmd.expect("the session holds a sender - this should never happen");
                    session.on_command(cmd).await?;
                }
                reply = store_replies.recv() => {
                    let reply = reply.expect("the session holds a sender - this should never happen");
                    session.on_store_reply(reply).await?;
                }
                _ = resend_first_ticks.tick() => {
                    session.on_resend_first_tick().await;
                }
            }
        }
    }
}
