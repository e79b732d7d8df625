pub mod amqp_consumer;

pub use amqp_consumer::{ConsumerError, ConsumerSettings, Disposition, IngestConsumer};
