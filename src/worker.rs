//! Consumer worker of one topic
//!
//! A [Worker] runs three loops over one consumer group session: messages,
//! errors and rebalance notifications. Every message handed to the message
//! handler successfully is *marked*; marked positions are only committed by
//! the [CommitHook] registered on the topic's sink, i.e. after the records were
//! flushed.
pub mod kafka;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{HandlerError, WorkerError},
    sink::FlushListener,
};

/// How long stop waits for each loop to finish
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Next offset to read per (topic, partition)
pub type Positions = HashMap<(String, i32), i64>;

/// One record read from the source log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Consumer group membership change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
    RebalanceError(String),
}

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// oldest record not yet committed by the group
    Oldest,
    Newest,
}

/// Consumer group session bound to one topic.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Next record, `None` once the session is closed.
    async fn recv(&self) -> Option<Record>;
    /// Commits the given positions for the session's group.
    async fn commit(&self, positions: &Positions) -> Result<(), WorkerError>;
    /// Leaves the group. Never commits on its own.
    fn close(&self);
}

/// Asynchronous streams of a session
pub struct SessionEvents {
    pub errors: mpsc::UnboundedReceiver<WorkerError>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

/// Receives every record of the worker's topic.
/// A record is marked as read only when the handler returns `Ok`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, record: &Record) -> Result<(), HandlerError>;
}

pub type ErrorCallback = Arc<dyn Fn(&WorkerError) + Send + Sync>;
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Creates workers bound to new consumer group sessions.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create(
        &self,
        group_id: &str,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Worker, WorkerError>;
}

#[derive(Default)]
struct Marks {
    marked: Positions,
    snapshot: Option<Positions>,
    committed: Positions,
}

/// Read progress shared by a worker and its commit hook
#[derive(Default)]
struct Progress {
    marks: Mutex<Marks>,
}

impl Progress {
    fn mark(&self, record: &Record) {
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        let next_offset = record.offset + 1; // committing _next_ offset, as Kafka expects
        let k = (record.topic.clone(), record.partition);
        match marks.marked.get(&k) {
            Some(offset) if *offset >= next_offset => {}
            _ => {
                marks.marked.insert(k, next_offset);
            }
        }
    }

    fn snapshot(&self) {
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        marks.snapshot = Some(marks.marked.clone());
    }

    /// Positions to commit, if they advanced since the last commit
    fn take(&self, from_snapshot: bool) -> Option<Positions> {
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        let positions = if from_snapshot {
            marks.snapshot.take()?
        } else {
            marks.marked.clone()
        };
        if positions.is_empty() || positions == marks.committed {
            return None;
        }
        Some(positions)
    }

    fn committed(&self, positions: Positions) {
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        for (k, offset) in positions {
            let current = marks.committed.entry(k).or_insert(offset);
            *current = (*current).max(offset);
        }
    }

    async fn commit(&self, session: &dyn Session, from_snapshot: bool) -> Result<(), WorkerError> {
        let Some(positions) = self.take(from_snapshot) else {
            return Ok(());
        };
        session.commit(&positions).await?;
        debug!(?positions, "committed positions");
        self.committed(positions);
        Ok(())
    }
}

/// Commits what was marked when a sink flush took its snapshot, once that flush succeeded.
pub struct CommitHook {
    session: Arc<dyn Session>,
    progress: Arc<Progress>,
}

#[async_trait]
impl FlushListener for CommitHook {
    fn on_snapshot(&self) {
        self.progress.snapshot();
    }

    async fn on_flush(&self) -> Result<(), anyhow::Error> {
        self.progress.commit(self.session.as_ref(), true).await?;
        Ok(())
    }
}

pub struct Worker {
    topic: String,
    group_id: String,
    session: Arc<dyn Session>,
    events: Option<SessionEvents>,
    on_message: Option<Arc<dyn MessageHandler>>,
    on_error: Option<ErrorCallback>,
    on_notification: Option<NotificationCallback>,
    progress: Arc<Progress>,
    running: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn new(topic: &str, group_id: &str, session: Arc<dyn Session>, events: SessionEvents) -> Worker {
        Worker {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            session,
            events: Some(events),
            on_message: None,
            on_error: None,
            on_notification: None,
            progress: Arc::new(Progress::default()),
            running: Arc::new(AtomicBool::new(false)),
            stop: watch::channel(false).0,
            tasks: Vec::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn on_message(&mut self, handler: Arc<dyn MessageHandler>) {
        self.on_message = Some(handler);
    }

    pub fn on_error(&mut self, callback: ErrorCallback) {
        self.on_error = Some(callback);
    }

    pub fn on_notification(&mut self, callback: NotificationCallback) {
        self.on_notification = Some(callback);
    }

    /// Flush listener committing this worker's positions.
    pub fn commit_hook(&self) -> CommitHook {
        CommitHook {
            session: self.session.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Commits everything marked so far.
    pub async fn on_consumer_flush(&self) -> Result<(), WorkerError> {
        self.progress.commit(self.session.as_ref(), false).await
    }

    /// Launches the message, error and notification loops. A worker starts only once.
    pub fn start(&mut self) {
        let Some(events) = self.events.take() else {
            warn!(topic = %self.topic, "worker already started");
            return;
        };
        self.running.store(true, Ordering::Release);
        info!(topic = %self.topic, group_id = %self.group_id, "starting worker");

        self.tasks.push(tokio::spawn(message_loop(
            self.topic.clone(),
            self.session.clone(),
            self.on_message.clone(),
            self.progress.clone(),
            self.running.clone(),
            self.stop.subscribe(),
        )));
        self.tasks.push(tokio::spawn(forward(
            events.errors,
            self.on_error.clone(),
            self.stop.subscribe(),
        )));
        self.tasks.push(tokio::spawn(forward(
            events.notifications,
            self.on_notification.clone(),
            self.stop.subscribe(),
        )));
    }

    /// Stops the loops without closing the session, so positions can still be committed.
    pub async fn stop(&mut self) {
        let _ = self.stop.send(true);
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                warn!(topic = %self.topic, "worker loop did not stop in time");
            }
        }
        self.running.store(false, Ordering::Release);
    }

    /// Leaves the consumer group, committing marked positions first if asked to.
    pub async fn close(&mut self, commit: bool) {
        self.stop().await;
        if commit {
            if let Err(e) = self.on_consumer_flush().await {
                warn!(topic = %self.topic, error = %e, "commit on close failed");
            }
        }
        self.session.close();
        info!(topic = %self.topic, group_id = %self.group_id, "worker closed");
    }
}

async fn message_loop(
    topic: String,
    session: Arc<dyn Session>,
    handler: Option<Arc<dyn MessageHandler>>,
    progress: Arc<Progress>,
    running: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let record = tokio::select! {
            _ = stop.changed() => break,
            record = session.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        if let Some(handler) = &handler {
            let outcome = tokio::select! {
                _ = stop.changed() => break,
                outcome = handler.on_message(&record) => outcome,
            };
            if let Err(e) = outcome {
                warn!(%topic, partition = record.partition, offset = record.offset, error = %e, "message loop halted");
                break;
            }
        }
        progress.mark(&record);
    }
    running.store(false, Ordering::Release);
    debug!(%topic, "message loop finished");
}

async fn forward<T: Send + 'static>(
    mut events: mpsc::UnboundedReceiver<T>,
    callback: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = stop.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Some(callback) = &callback {
            callback(&event);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    /// Session fed from a channel, recording commits.
    pub(crate) struct MemorySession {
        records: AsyncMutex<mpsc::UnboundedReceiver<Record>>,
        pub commits: Mutex<Vec<Positions>>,
        pub closed: AtomicBool,
    }

    pub(crate) struct Feed {
        pub records: mpsc::UnboundedSender<Record>,
        pub errors: mpsc::UnboundedSender<WorkerError>,
        pub notifications: mpsc::UnboundedSender<Notification>,
    }

    impl MemorySession {
        pub(crate) fn new() -> (Arc<MemorySession>, SessionEvents, Feed) {
            let (records_tx, records) = mpsc::unbounded_channel();
            let (errors_tx, errors) = mpsc::unbounded_channel();
            let (notifications_tx, notifications) = mpsc::unbounded_channel();
            (
                Arc::new(MemorySession {
                    records: AsyncMutex::new(records),
                    commits: Mutex::new(Vec::new()),
                    closed: AtomicBool::new(false),
                }),
                SessionEvents {
                    errors,
                    notifications,
                },
                Feed {
                    records: records_tx,
                    errors: errors_tx,
                    notifications: notifications_tx,
                },
            )
        }
    }

    #[async_trait]
    impl Session for MemorySession {
        async fn recv(&self) -> Option<Record> {
            self.records.lock().await.recv().await
        }
        async fn commit(&self, positions: &Positions) -> Result<(), WorkerError> {
            self.commits.lock().unwrap().push(positions.clone());
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn record(topic: &str, partition: i32, offset: i64, payload: &str) -> Record {
        Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            payload: Some(payload.as_bytes().to_vec()),
        }
    }

    struct Collect(Mutex<Vec<i64>>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn on_message(&self, record: &Record) -> Result<(), HandlerError> {
            self.0.lock().unwrap().push(record.offset);
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl MessageHandler for Refuse {
        async fn on_message(&self, record: &Record) -> Result<(), HandlerError> {
            Err(HandlerError::SinkStopped(record.topic.clone()))
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn loops_forward_messages_errors_and_notifications() {
        let (session, events, feed) = MemorySession::new();
        let mut worker = Worker::new("orders_eu", "logship-orders_eu", session.clone(), events);
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        let errors = Arc::new(AtomicUsize::new(0));
        let notifications = Arc::new(Mutex::new(Vec::new()));
        worker.on_message(handler.clone());
        let counter = errors.clone();
        worker.on_error(Arc::new(move |_: &WorkerError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let seen = notifications.clone();
        worker.on_notification(Arc::new(move |n: &Notification| seen.lock().unwrap().push(n.clone())));
        worker.start();
        assert!(worker.is_running());

        for offset in 0..3 {
            feed.records.send(record("orders_eu", 0, offset, "x")).unwrap();
        }
        feed.errors
            .send(WorkerError::Commit(String::from("broker down")))
            .unwrap();
        feed.notifications
            .send(Notification::Assigned(vec![(String::from("orders_eu"), 0)]))
            .unwrap();

        eventually(|| handler.0.lock().unwrap().len() == 3).await;
        eventually(|| errors.load(Ordering::SeqCst) == 1).await;
        eventually(|| notifications.lock().unwrap().len() == 1).await;
        assert_eq!(*handler.0.lock().unwrap(), vec![0, 1, 2]);

        worker.stop().await;
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn commits_only_through_flush_hook() {
        let (session, events, feed) = MemorySession::new();
        let mut worker = Worker::new("orders_eu", "g", session.clone(), events);
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        worker.on_message(handler.clone());
        let hook = worker.commit_hook();
        worker.start();

        feed.records.send(record("orders_eu", 0, 7, "a")).unwrap();
        feed.records.send(record("orders_eu", 1, 3, "b")).unwrap();
        eventually(|| handler.0.lock().unwrap().len() == 2).await;
        // marking happens right after the handler returns
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.commits.lock().unwrap().is_empty());

        hook.on_flush().await.unwrap();
        assert!(session.commits.lock().unwrap().is_empty());

        hook.on_snapshot();
        hook.on_flush().await.unwrap();
        hook.on_flush().await.unwrap();
        let commits = session.commits.lock().unwrap().clone();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0][&(String::from("orders_eu"), 0)], 8);
        assert_eq!(commits[0][&(String::from("orders_eu"), 1)], 4);

        worker.close(false).await;
        assert!(session.closed.load(Ordering::SeqCst));
        assert_eq!(session.commits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refused_record_is_not_marked() {
        let (session, events, feed) = MemorySession::new();
        let mut worker = Worker::new("orders_eu", "g", session.clone(), events);
        worker.on_message(Arc::new(Refuse));
        worker.start();

        feed.records.send(record("orders_eu", 0, 0, "a")).unwrap();
        eventually(|| !worker.is_running()).await;

        worker.close(true).await;
        assert!(session.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_can_commit_marked_positions() {
        let (session, events, feed) = MemorySession::new();
        let mut worker = Worker::new("orders_eu", "g", session.clone(), events);
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        worker.on_message(handler.clone());
        worker.start();

        feed.records.send(record("orders_eu", 2, 41, "a")).unwrap();
        eventually(|| handler.0.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        worker.close(true).await;
        let commits = session.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0][&(String::from("orders_eu"), 2)], 42);
    }
}
