//! The consume-handle-commit skeleton shared by the engine binaries.
//!
//! An [Engine] owns one manually-committing consumer and one producer. The
//! engine binaries supply a [Handler] which is given each record in turn and
//! is responsible for committing it exactly once, on the success and drop
//! paths both. Committing only after any publishes gives at-least-once
//! semantics: a crash between publish and commit replays the input record.
use crate::{
    config::KafkaConfig,
    metrics::{
        names::{KAFKA_CONSUMER_ERRORS, KAFKA_PRODUCER_ERRORS},
        topic_label,
    },
};
use metrics::counter;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::BorrowedMessage,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{error, info};

/// Triggers an error if the producer takes longer than this to deliver a message.
const PRODUCER_TIMEOUT: Timeout = Timeout::After(Duration::from_secs(5));

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("record serialisation failed: {0}")]
    Serialise(#[from] serde_json::Error),
    #[error("signal handler installation failed: {0}")]
    Signal(#[from] std::io::Error),
}

/// Per-record processing supplied by each engine binary.
pub trait Handler {
    type Error: From<EngineError> + std::error::Error;

    /// Handles one consumed record. Must call [Engine::commit] exactly once
    /// before returning `Ok`; returning an error aborts the engine without
    /// committing, so the record is replayed after a restart.
    async fn handle(
        &mut self,
        engine: &Engine,
        msg: &BorrowedMessage<'_>,
    ) -> Result<(), Self::Error>;
}

pub struct Engine {
    input_topic: String,
    consumer: StreamConsumer,
    producer: FutureProducer,
}

impl Engine {
    /// Creates the consumer/producer pair for one engine process,
    /// subscribed to `input_topic`.
    pub fn new(kafka: &KafkaConfig, input_topic: &str) -> Result<Self, KafkaError> {
        let consumer = crate::create_default_consumer(&kafka.url, &kafka.group, &[input_topic])?;
        let producer = crate::generate_kafka_client_config(&kafka.url).create()?;
        Ok(Self {
            input_topic: input_topic.to_owned(),
            consumer,
            producer,
        })
    }

    /// Serialises each record to JSON and publishes the batch to `topic`.
    ///
    /// A delivery failure increments the producer error counter for the topic
    /// and is returned to the caller, which aborts the engine.
    pub async fn publish<T: Serialize>(&self, topic: &str, batch: &[T]) -> Result<(), EngineError> {
        for item in batch {
            let payload = serde_json::to_vec(item)?;
            let record = FutureRecord::<(), Vec<u8>>::to(topic).payload(&payload);
            if let Err((e, _)) = self.producer.send(record, PRODUCER_TIMEOUT).await {
                error!("Failed to publish to topic {topic}: {e}");
                counter!(KAFKA_PRODUCER_ERRORS, &[topic_label(topic)]).increment(1);
                return Err(EngineError::Kafka(e));
            }
        }
        Ok(())
    }

    /// Marks the record's offset as processed.
    pub fn commit(&self, msg: &BorrowedMessage<'_>) -> Result<(), EngineError> {
        Ok(self.consumer.commit_message(msg, CommitMode::Async)?)
    }

    /// Drives the consume loop until a fatal error or a shutdown signal.
    ///
    /// A consumer error is fatal: the loop aborts without committing and the
    /// process exits for the supervisor to restart. A shutdown signal lets the
    /// in-flight record finish (including its commit) and returns cleanly.
    pub async fn run<H: Handler>(&self, handler: &mut H) -> Result<(), H::Error> {
        let mut sigint = signal(SignalKind::interrupt()).map_err(EngineError::from)?;

        loop {
            select! {
                msg = self.consumer.recv() => match msg {
                    Ok(msg) => handler.handle(self, &msg).await?,
                    Err(e) => {
                        error!("Kafka error while reading {}: {e}", self.input_topic);
                        counter!(KAFKA_CONSUMER_ERRORS, &[topic_label(&self.input_topic)])
                            .increment(1);
                        return Err(H::Error::from(EngineError::Kafka(e)));
                    }
                },
                _ = sigint.recv() => {
                    info!("Shutdown signal received, stopping {} consumer", self.input_topic);
                    return Ok(());
                }
            }
        }
    }
}
