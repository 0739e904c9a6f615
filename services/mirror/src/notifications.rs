//! Bucket change notifications.
//!
//! The bucket publishes its S3 event records (`{"Records": [...]}`) to a Kafka
//! topic. Each [`NotificationFilter`] gets its own consumer and receives only the
//! records whose key and event name it accepts.

use crate::config::NotificationsConfig;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event name prefix of object creations
pub const OBJECT_CREATED: &str = "s3:ObjectCreated:";
/// Event name prefix of object removals
pub const OBJECT_REMOVED: &str = "s3:ObjectRemoved:";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Malformed bucket event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Bucket event has no payload")]
    EmptyPayload,

    #[error("Notifications are not configured: {0}")]
    NotConfigured(String),
}

/// One object change, as seen by a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub event_name: String,
    /// Decoded bucket key
    pub object_key: String,
    pub object_size: u64,
    /// Raw event time, parsed by the consumer
    pub event_time: String,
}

impl NotificationRecord {
    pub fn is_created(&self) -> bool {
        has_event_prefix(&self.event_name, OBJECT_CREATED)
    }

    pub fn is_removed(&self) -> bool {
        has_event_prefix(&self.event_name, OBJECT_REMOVED)
    }
}

/// Which records a subscription receives
#[derive(Debug, Clone)]
pub struct NotificationFilter {
    /// Subscription name, used in logs and consumer group ids
    pub name: String,
    pub prefix: String,
    pub suffix: String,
    /// Accepted event name prefixes, e.g. [`OBJECT_CREATED`]
    pub events: Vec<String>,
}

impl NotificationFilter {
    pub fn new(name: impl Into<String>, suffix: impl Into<String>, events: &[&str]) -> Self {
        Self {
            name: name.into(),
            prefix: String::new(),
            suffix: suffix.into(),
            events: events.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn matches(&self, record: &NotificationRecord) -> bool {
        record.object_key.starts_with(&self.prefix)
            && record.object_key.ends_with(&self.suffix)
            && self
                .events
                .iter()
                .any(|prefix| has_event_prefix(&record.event_name, prefix))
    }
}

/// AWS omits the `s3:` namespace that MinIO includes
fn has_event_prefix(event_name: &str, prefix: &str) -> bool {
    event_name
        .trim_start_matches("s3:")
        .starts_with(prefix.trim_start_matches("s3:"))
}

pub type NotificationStream = mpsc::Receiver<Result<NotificationRecord, NotificationError>>;

/// Source of bucket change notifications
pub trait NotificationSource: Send + Sync {
    /// Start delivering records accepted by `filter` until `shutdown` fires
    fn subscribe(
        &self,
        filter: NotificationFilter,
        shutdown: CancellationToken,
    ) -> Result<NotificationStream, NotificationError>;
}

#[derive(Debug, Deserialize)]
struct S3EventMessage {
    #[serde(rename = "Records", default)]
    records: Vec<S3EventRecord>,
}

#[derive(Debug, Deserialize)]
struct S3EventRecord {
    #[serde(rename = "eventName")]
    event_name: String,
    #[serde(rename = "eventTime", default)]
    event_time: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
    #[serde(default)]
    size: u64,
}

/// Decode the records of one bucket event message
pub fn parse_records(payload: &[u8]) -> Result<Vec<NotificationRecord>, NotificationError> {
    let message: S3EventMessage = serde_json::from_slice(payload)?;

    Ok(message
        .records
        .into_iter()
        .map(|record| NotificationRecord {
            event_name: record.event_name,
            object_key: decode_key(&record.s3.object.key),
            object_size: record.s3.object.size,
            event_time: record.event_time,
        })
        .collect())
}

/// Keys in event records are form-urlencoded, so `=` and `&` never appear raw
fn decode_key(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default()
}

/// Kafka-backed notification source
pub struct KafkaNotificationSource {
    config: NotificationsConfig,
    bootstrap_servers: String,
}

impl KafkaNotificationSource {
    pub fn new(config: &NotificationsConfig) -> Result<Self, NotificationError> {
        let bootstrap_servers = config
            .bootstrap_servers
            .clone()
            .ok_or_else(|| {
                NotificationError::NotConfigured("missing bootstrap servers".to_string())
            })?;

        Ok(Self {
            config: config.clone(),
            bootstrap_servers,
        })
    }

    fn create_consumer(
        &self,
        filter: &NotificationFilter,
    ) -> Result<StreamConsumer, NotificationError> {
        let group_id = format!("{}-{}", self.config.consumer_group, filter.name);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .create()?;

        consumer.subscribe(&[&self.config.topic])?;

        info!(
            topic = %self.config.topic,
            group = %group_id,
            suffix = %filter.suffix,
            "Subscribed to bucket notifications"
        );

        Ok(consumer)
    }
}

impl NotificationSource for KafkaNotificationSource {
    fn subscribe(
        &self,
        filter: NotificationFilter,
        shutdown: CancellationToken,
    ) -> Result<NotificationStream, NotificationError> {
        let consumer = self.create_consumer(&filter)?;
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut stream = consumer.stream();

            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = stream.next() => message,
                };
                let Some(message) = message else { break };

                let batch = match message {
                    Ok(message) => {
                        let parsed = message
                            .payload()
                            .ok_or(NotificationError::EmptyPayload)
                            .and_then(parse_records);

                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                            warn!(error = %e, "Failed to commit offset");
                        }

                        match parsed {
                            Ok(records) => records
                                .into_iter()
                                .filter(|record| filter.matches(record))
                                .map(Ok)
                                .collect(),
                            Err(e) => vec![Err(e)],
                        }
                    }
                    Err(e) => {
                        metrics::counter!("mirror.kafka.errors").increment(1);
                        vec![Err(NotificationError::Kafka(e))]
                    }
                };

                for item in batch {
                    if tx.send(item).await.is_err() {
                        debug!(subscription = %filter.name, "Notification receiver dropped");
                        return;
                    }
                }
            }

            debug!(subscription = %filter.name, "Notification consumer stopped");
        });

        Ok(rx)
    }
}

/// Notification source fed by test code
#[cfg(test)]
pub(crate) mod channel {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    type Sender = mpsc::Sender<Result<NotificationRecord, NotificationError>>;

    #[derive(Default)]
    pub(crate) struct ChannelNotificationSource {
        pending: Mutex<HashMap<String, NotificationStream>>,
        senders: Mutex<HashMap<String, Sender>>,
    }

    impl ChannelNotificationSource {
        pub(crate) fn new(names: &[&str]) -> Self {
            let source = Self::default();
            for name in names {
                let (tx, rx) = mpsc::channel(16);
                source.pending.lock().insert(name.to_string(), rx);
                source.senders.lock().insert(name.to_string(), tx);
            }
            source
        }

        pub(crate) fn sender(&self, name: &str) -> Sender {
            self.senders.lock()[name].clone()
        }

        /// Drop the test-side senders so streams end once drained
        pub(crate) fn close(&self) {
            self.senders.lock().clear();
        }
    }

    impl NotificationSource for ChannelNotificationSource {
        fn subscribe(
            &self,
            filter: NotificationFilter,
            _shutdown: CancellationToken,
        ) -> Result<NotificationStream, NotificationError> {
            self.pending
                .lock()
                .remove(&filter.name)
                .ok_or_else(|| NotificationError::NotConfigured(filter.name.clone()))
        }
    }
}
