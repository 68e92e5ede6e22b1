use std::time::Duration;
use anyhow::bail;

/// Top-level configuration of a reliable delivery pair (producer controller + consumer
///  controller). Both sides are usually configured from the same instance, but they are
///  independent at runtime and only agree through the protocol messages they exchange.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub producer_controller: ProducerControllerConfig,
    pub consumer_controller: ConsumerControllerConfig,
}

impl DeliveryConfig {
    pub fn new() -> DeliveryConfig {
        DeliveryConfig {
            producer_controller: ProducerControllerConfig::new(),
            consumer_controller: ConsumerControllerConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.producer_controller.validate()?;
        self.consumer_controller.validate()?;
        Ok(())
    }

    /// Flow-control-only mode means the consumer never asks for lost messages, so there is
    ///  nothing a durable queue could be replayed into.
    pub fn validate_with_durable_queue(&self) -> anyhow::Result<()> {
        self.validate()?;
        if self.consumer_controller.only_flow_control {
            bail!("a durable producer queue can not be combined with 'only flow control' mode");
        }
        Ok(())
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig::new()
    }
}

#[derive(Debug, Clone)]
pub struct ProducerControllerConfig {
    /// Messages with a serialized size above this threshold are split into chunks of (at most)
    ///  this size. Each chunk is sent as a separate transport message, sharing the sequence
    ///  number of the message. `None` disables chunking.
    pub chunk_large_messages_bytes: Option<usize>,

    /// Upper bound for the number of commands that are buffered while the controller waits
    ///  for the durable queue to acknowledge a stored message. Exceeding it is fatal for the
    ///  session.
    pub max_pending_commands: usize,

    pub durable_queue: DurableQueueConfig,
}

impl ProducerControllerConfig {
    pub fn new() -> ProducerControllerConfig {
        ProducerControllerConfig {
            chunk_large_messages_bytes: None,
            max_pending_commands: 1000,
            durable_queue: DurableQueueConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_large_messages_bytes == Some(0) {
            bail!("chunk size must be positive");
        }
        if self.max_pending_commands == 0 {
            bail!("max_pending_commands must be positive");
        }
        self.durable_queue.validate()
    }
}

impl Default for ProducerControllerConfig {
    fn default() -> Self {
        ProducerControllerConfig::new()
    }
}

#[derive(Debug, Clone)]
pub struct DurableQueueConfig {
    /// timeout for a single request to the durable queue
    pub request_timeout: Duration,
    /// number of retries after a failed or timed out request, i.e. a request is attempted
    ///  `retry_attempts + 1` times before the session fails
    pub retry_attempts: u32,
    /// The first message of a delivery session is re-sent with this interval until the
    ///  consumer controller has responded with a `Request`.
    pub resend_first_interval: Duration,
}

impl DurableQueueConfig {
    pub fn new() -> DurableQueueConfig {
        DurableQueueConfig {
            request_timeout: Duration::from_secs(3),
            retry_attempts: 10,
            resend_first_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout.is_zero() {
            bail!("durable queue request timeout must be positive");
        }
        if self.resend_first_interval.is_zero() {
            bail!("resend-first interval must be positive");
        }
        Ok(())
    }
}

impl Default for DurableQueueConfig {
    fn default() -> Self {
        DurableQueueConfig::new()
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerControllerConfig {
    /// Number of messages the consumer allows the producer to send ahead of the last confirmed
    ///  message. A new `Request` is sent when half of the window is used up.
    pub flow_control_window: u32,

    /// If there was no progress for this interval, the last `Request` or `Resend` is repeated.
    pub resend_interval_min: Duration,
    /// upper bound for the retry interval after repeated timeouts without progress
    pub resend_interval_max: Duration,
    /// factor (in eighths, i.e. 12 means 1.5) by which the retry interval grows on each
    ///  consecutive timeout
    pub resend_backoff_factor_eighths: u32,

    /// Lost messages are not re-sent, the consumer just skips them. This reduces the protocol
    ///  to flow control without delivery guarantees.
    pub only_flow_control: bool,

    /// messages that arrive before the application consumer started are buffered up to this
    ///  number
    pub max_buffered_before_start: usize,
}

impl ConsumerControllerConfig {
    pub fn new() -> ConsumerControllerConfig {
        ConsumerControllerConfig {
            flow_control_window: 50,
            resend_interval_min: Duration::from_secs(2),
            resend_interval_max: Duration::from_secs(30),
            resend_backoff_factor_eighths: 12,
            only_flow_control: false,
            max_buffered_before_start: 1000,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.flow_control_window == 0 {
            bail!("flow control window must be positive");
        }
        if self.resend_interval_min.is_zero() {
            bail!("minimum resend interval must be positive");
        }
        if self.resend_interval_max < self.resend_interval_min {
            bail!("maximum resend interval {:?} is less than the minimum {:?}", self.resend_interval_max, self.resend_interval_min);
        }
        if self.resend_backoff_factor_eighths < 8 {
            bail!("resend backoff factor must be at least 8 (i.e. 1.0)");
        }
        Ok(())
    }
}

impl Default for ConsumerControllerConfig {
    fn default() -> Self {
        ConsumerControllerConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults(DeliveryConfig::new(), true)]
    #[case::zero_chunk_size({ let mut c = DeliveryConfig::new(); c.producer_controller.chunk_large_messages_bytes = Some(0); c }, false)]
    #[case::chunk_size({ let mut c = DeliveryConfig::new(); c.producer_controller.chunk_large_messages_bytes = Some(4096); c }, true)]
    #[case::zero_window({ let mut c = DeliveryConfig::new(); c.consumer_controller.flow_control_window = 0; c }, false)]
    #[case::max_below_min({ let mut c = DeliveryConfig::new(); c.consumer_controller.resend_interval_max = Duration::from_secs(1); c }, false)]
    #[case::max_equals_min({ let mut c = DeliveryConfig::new(); c.consumer_controller.resend_interval_max = Duration::from_secs(2); c }, true)]
    #[case::shrinking_backoff({ let mut c = DeliveryConfig::new(); c.consumer_controller.resend_backoff_factor_eighths = 7; c }, false)]
    #[case::zero_store_timeout({ let mut c = DeliveryConfig::new(); c.producer_controller.durable_queue.request_timeout = Duration::ZERO; c }, false)]
    #[case::zero_pending({ let mut c = DeliveryConfig::new(); c.producer_controller.max_pending_commands = 0; c }, false)]
    fn test_validate(#[case] config: DeliveryConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[rstest]
    #[case::resend(false, true)]
    #[case::only_flow_control(true, false)]
    fn test_validate_with_durable_queue(#[case] only_flow_control: bool, #[case] expected_ok: bool) {
        let mut config = DeliveryConfig::new();
        config.consumer_controller.only_flow_control = only_flow_control;
        assert_eq!(config.validate_with_durable_queue().is_ok(), expected_ok);
    }
}
