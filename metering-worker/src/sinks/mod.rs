pub mod amqp_publisher;
pub mod postgres;

pub use amqp_publisher::AmqpEventPublisher;
pub use postgres::{PgReadingRepository, PgReadingTransaction};
