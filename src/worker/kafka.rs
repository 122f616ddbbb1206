//! Kafka consumer group sessions
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaError,
    ClientConfig, ClientContext, Message, Offset, TopicPartitionList,
};
use tokio::{sync::mpsc, time::sleep};
use tracing::debug;

use super::{
    Notification, Positions, Record, Session, SessionEvents, StartOffset, Worker, WorkerFactory,
};
use crate::error::WorkerError;

const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// Routes client errors and rebalances of one consumer into its session streams
pub struct FleetContext {
    topic: String,
    errors: mpsc::UnboundedSender<WorkerError>,
    notifications: mpsc::UnboundedSender<Notification>,
}

fn partitions(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|e| (e.topic().to_string(), e.partition()))
        .collect()
}

impl ClientContext for FleetContext {
    fn error(&self, error: KafkaError, reason: &str) {
        debug!(topic = %self.topic, %reason, "kafka client error");
        let _ = self.errors.send(WorkerError::Kafka(error));
    }
}

impl ConsumerContext for FleetContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let _ = self
                .notifications
                .send(Notification::Revoked(partitions(tpl)));
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        let notification = match rebalance {
            Rebalance::Assign(tpl) => Notification::Assigned(partitions(tpl)),
            Rebalance::Revoke(_) => return,
            Rebalance::Error(e) => Notification::RebalanceError(e.to_string()),
        };
        let _ = self.notifications.send(notification);
    }
}

pub struct KafkaSession {
    consumer: Arc<StreamConsumer<FleetContext>>,
    errors: mpsc::UnboundedSender<WorkerError>,
}

#[async_trait]
impl Session for KafkaSession {
    async fn recv(&self) -> Option<Record> {
        loop {
            let received = self.consumer.recv().await.map(|msg| Record {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec),
                payload: msg.payload().map(<[u8]>::to_vec),
            });
            match received {
                Ok(record) => return Some(record),
                Err(e) => {
                    if self.errors.send(WorkerError::Kafka(e)).is_err() {
                        return None;
                    }
                    sleep(RECV_BACKOFF).await;
                }
            }
        }
    }

    async fn commit(&self, positions: &Positions) -> Result<(), WorkerError> {
        let mut topic_map = HashMap::new();
        for ((topic, partition), offset) in positions {
            topic_map.insert((topic.clone(), *partition), Offset::from_raw(*offset));
        }
        let tpl = TopicPartitionList::from_topic_map(&topic_map)?;
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| WorkerError::Commit(e.to_string()))??;
        Ok(())
    }

    fn close(&self) {
        self.consumer.unsubscribe();
    }
}

/// Creates workers consuming with their own Kafka consumer group
pub struct KafkaWorkerFactory {
    config: ClientConfig,
}

impl KafkaWorkerFactory {
    pub fn new(config: ClientConfig) -> Self {
        KafkaWorkerFactory { config }
    }
}

#[async_trait]
impl WorkerFactory for KafkaWorkerFactory {
    async fn create(
        &self,
        group_id: &str,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Worker, WorkerError> {
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let (notifications_tx, notifications) = mpsc::unbounded_channel();
        let context = FleetContext {
            topic: topic.to_string(),
            errors: errors_tx.clone(),
            notifications: notifications_tx,
        };

        let mut config = self.config.clone();
        config
            .set("group.id", group_id)
            // commits happen only after sink flushes, never implicitly
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                match offset {
                    StartOffset::Oldest => "earliest",
                    StartOffset::Newest => "latest",
                },
            );
        let consumer: StreamConsumer<FleetContext> = config.create_with_context(context)?;
        consumer.subscribe(&[topic])?;
        debug!(topic, group_id, "subscribed");

        let session = Arc::new(KafkaSession {
            consumer: Arc::new(consumer),
            errors: errors_tx,
        });
        Ok(Worker::new(
            topic,
            group_id,
            session,
            SessionEvents {
                errors,
                notifications,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::error::RDKafkaErrorCode;

    use super::*;

    fn context() -> (
        FleetContext,
        mpsc::UnboundedReceiver<WorkerError>,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let (notifications_tx, notifications) = mpsc::unbounded_channel();
        let context = FleetContext {
            topic: String::from("orders_eu"),
            errors: errors_tx,
            notifications: notifications_tx,
        };
        (context, errors, notifications)
    }

    #[test]
    fn rebalances_become_notifications() {
        let (context, _errors, mut notifications) = context();
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("orders_eu", 0);
        tpl.add_partition("orders_eu", 2);
        let partitions = vec![(String::from("orders_eu"), 0), (String::from("orders_eu"), 2)];

        context.pre_rebalance(&Rebalance::Assign(&tpl));
        context.post_rebalance(&Rebalance::Assign(&tpl));
        context.pre_rebalance(&Rebalance::Revoke(&tpl));
        context.post_rebalance(&Rebalance::Revoke(&tpl));
        context.post_rebalance(&Rebalance::Error(KafkaError::Rebalance(
            RDKafkaErrorCode::Fail,
        )));

        assert_eq!(
            notifications.try_recv().unwrap(),
            Notification::Assigned(partitions.clone())
        );
        assert_eq!(
            notifications.try_recv().unwrap(),
            Notification::Revoked(partitions)
        );
        assert!(matches!(
            notifications.try_recv().unwrap(),
            Notification::RebalanceError(_)
        ));
        assert!(notifications.try_recv().is_err());
    }

    #[test]
    fn client_errors_are_forwarded() {
        let (context, mut errors, _notifications) = context();
        context.error(
            KafkaError::ClientCreation(String::from("no brokers")),
            "bootstrap failed",
        );
        assert!(matches!(
            errors.try_recv().unwrap(),
            WorkerError::Kafka(KafkaError::ClientCreation(_))
        ));
    }
}
