//! The consumer side of reliable delivery.
//!
//! A [ConsumerController] receives sequenced messages from a producer controller, discards
//!  duplicates, reassembles chunks and hands the messages to the application consumer in order,
//!  one at a time. It tells the producer how far ahead it may send, and asks for lost messages
//!  to be re-sent.

use std::future;
use std::sync::Arc;

use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::info;

use crate::config::DeliveryConfig;
use crate::consumer::consumer_logic::ConsumerSession;
use crate::protocol::DeliveryPayload;

pub use consumer_messages::{ConfirmTo, ConsumerControllerHandle, Delivery};
use consumer_messages::ConsumerCommand;

mod consumer_logic;
mod consumer_messages;
pub mod resend_backoff;

pub struct ConsumerController<A: DeliveryPayload> {
    config: Arc<DeliveryConfig>,
    commands_send: mpsc::Sender<ConsumerCommand<A>>,
    commands_recv: mpsc::Receiver<ConsumerCommand<A>>,
}

impl<A: DeliveryPayload> ConsumerController<A> {
    pub fn new(config: Arc<DeliveryConfig>) -> ConsumerController<A> {
        let (commands_send, commands_recv) = mpsc::channel(1024);
        ConsumerController {
            config,
            commands_send,
            commands_recv,
        }
    }

    pub fn handle(&self) -> ConsumerControllerHandle<A> {
        ConsumerControllerHandle::new(self.commands_send.clone())
    }

    pub fn spawn(self) -> (ConsumerControllerHandle<A>, JoinHandle<anyhow::Result<()>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Runs the controller until it is stopped via [ConsumerControllerHandle::deliver_then_stop]
    ///  and all complete messages are delivered. A chunked message that can not be deserialized
    ///  or an application consumer that went away terminate it with an error.
    pub async fn run(self) -> anyhow::Result<()> {
        let ConsumerController { config, commands_send, mut commands_recv } = self;
        config.validate()?;

        let mut session = ConsumerSession::new(Arc::new(config.consumer_controller.clone()), commands_send);

        loop {
            if session.is_terminated() {
                info!("consumer: all messages are delivered - terminating");
                return Ok(());
            }

            select! {
                cmd = commands_recv.recv() => {
                    let cmd = cmd.expect("the session holds a sender - this should never happen");
                    session.on_command(cmd).await?;
                }
                _ = sleep_until_deadline(session.retry_deadline()) => {
                    session.on_retry_timer().await;
                }
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
