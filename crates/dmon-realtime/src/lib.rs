//! Realtime insert listener with per-table debounced fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dmon_core::ChangeEvent;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "dmon-realtime";

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime connect failed: {0}")]
    Connect(String),
    #[error("realtime channel error: {0}")]
    Channel(String),
}

/// Opens streaming connections to the realtime endpoint.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>, RealtimeError>;
}

#[async_trait]
pub trait RealtimeConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), RealtimeError>;

    /// Next text frame. `Ok(None)` once the peer has closed the stream.
    async fn recv(&mut self) -> Result<Option<String>, RealtimeError>;
}

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>, RealtimeError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;
        info!(url = %self.url, "realtime connection established");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeConnection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<(), RealtimeError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| RealtimeError::Channel(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, RealtimeError> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(|e| RealtimeError::Channel(e.to_string()))? {
                Message::Text(text) => return Ok(Some(text)),
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }
}

/// Receives one coalesced batch per debounce window.
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    async fn on_changes(&self, table: &str, events: Vec<ChangeEvent>);
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub debounce: Duration,
    pub reconnect_delay: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

pub fn join_message(table: &str) -> String {
    json!({
        "topic": table,
        "event": "phx_join",
        "payload": {},
        "ref": "1"
    })
    .to_string()
}

/// Extracts an insert event from a pushed frame. Replies, heartbeats and other
/// event kinds yield `None`.
pub fn parse_insert(text: &str) -> Option<ChangeEvent> {
    let frame: JsonValue = serde_json::from_str(text).ok()?;
    if frame.get("event")?.as_str()? != "INSERT" {
        return None;
    }
    let table = frame.get("topic")?.as_str()?.to_string();
    let record = frame.get("payload")?.get("record")?.clone();
    Some(ChangeEvent { table, record })
}

#[derive(Default)]
struct TableBuffer {
    events: Vec<ChangeEvent>,
    timer: Option<JoinHandle<()>>,
}

enum Command {
    Join(String),
}

struct Inner {
    transport: Arc<dyn RealtimeTransport>,
    config: NotifierConfig,
    subscribers: Mutex<HashMap<String, Vec<Arc<dyn ChangeSubscriber>>>>,
    buffers: Mutex<HashMap<String, TableBuffer>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// Long-lived realtime listener. Subscriptions survive reconnects; events are
/// buffered per table and flushed once per debounce window.
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<Inner>,
}

impl ChangeNotifier {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: NotifierConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                subscribers: Mutex::new(HashMap::new()),
                buffers: Mutex::new(HashMap::new()),
                commands: Mutex::new(None),
                listener: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Registers `subscriber` for `table`, starting the listener on first use.
    pub async fn subscribe(&self, table: &str, subscriber: Arc<dyn ChangeSubscriber>) {
        if self.inner.cancel.is_cancelled() {
            warn!(table, "subscribe after shutdown ignored");
            return;
        }
        self.inner
            .subscribers
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push(subscriber);

        let mut commands = self.inner.commands.lock().await;
        let sender = match commands.as_ref() {
            Some(sender) => sender.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = tokio::spawn(listen(self.inner.clone(), rx));
                *self.inner.listener.lock().await = Some(handle);
                *commands = Some(tx.clone());
                tx
            }
        };
        if sender.send(Command::Join(table.to_string())).is_err() {
            warn!(table, "realtime listener is gone, join not sent");
        }
    }

    pub async fn subscribed_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.inner.subscribers.lock().await.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Buffers `event`, arming the table's debounce timer if it is idle. Events for
    /// tables without a subscriber are dropped.
    pub async fn push(&self, event: ChangeEvent) {
        push_event(&self.inner, event).await;
    }

    /// Stops the listener and drops pending debounce timers with their buffered events.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.listener.lock().await.take() {
            handle.abort();
        }
        self.inner.commands.lock().await.take();
        let mut buffers = self.inner.buffers.lock().await;
        for (_, buffer) in buffers.drain() {
            if let Some(timer) = buffer.timer {
                timer.abort();
            }
        }
        info!("realtime notifier shut down");
    }
}

async fn push_event(inner: &Arc<Inner>, event: ChangeEvent) {
    if inner.cancel.is_cancelled() {
        return;
    }
    let table = event.table.clone();
    if !inner.subscribers.lock().await.contains_key(&table) {
        debug!(table = %table, "change for unsubscribed table dropped");
        return;
    }
    let mut buffers = inner.buffers.lock().await;
    let buffer = buffers.entry(table.clone()).or_default();
    buffer.events.push(event);
    if buffer.timer.is_none() {
        let inner = inner.clone();
        let debounce = inner.config.debounce;
        let cancel = inner.cancel.clone();
        buffer.timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(debounce) => flush(&inner, &table).await,
            }
        }));
    }
}

async fn flush(inner: &Arc<Inner>, table: &str) {
    let events = {
        let mut buffers = inner.buffers.lock().await;
        match buffers.get_mut(table) {
            Some(buffer) => {
                buffer.timer = None;
                std::mem::take(&mut buffer.events)
            }
            None => return,
        }
    };
    if events.is_empty() {
        return;
    }

    let subscribers = inner
        .subscribers
        .lock()
        .await
        .get(table)
        .cloned()
        .unwrap_or_default();
    debug!(table, events = events.len(), subscribers = subscribers.len(), "flushing change buffer");
    for subscriber in subscribers {
        subscriber.on_changes(table, events.clone()).await;
    }
}

async fn listen(inner: Arc<Inner>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let cancel = inner.cancel.clone();
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = inner.transport.connect() => result,
        };

        match connected {
            Ok(mut conn) => {
                if let Err(err) = run_connection(&inner, conn.as_mut(), &mut commands).await {
                    warn!(error = %err, "realtime connection lost");
                }
                if cancel.is_cancelled() {
                    return;
                }
            }
            Err(err) => warn!(error = %err, "realtime connect failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }
        info!("reconnecting realtime listener");
    }
}

async fn run_connection(
    inner: &Arc<Inner>,
    conn: &mut dyn RealtimeConnection,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<(), RealtimeError> {
    let mut joined = HashSet::new();
    let tables: Vec<String> = inner.subscribers.lock().await.keys().cloned().collect();
    for table in tables {
        conn.send(join_message(&table)).await?;
        joined.insert(table);
    }
    debug!(tables = joined.len(), "joined realtime channels");

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            command = commands.recv() => match command {
                Some(Command::Join(table)) => {
                    if !joined.contains(&table) {
                        conn.send(join_message(&table)).await?;
                        joined.insert(table);
                    }
                }
                None => return Ok(()),
            },
            frame = conn.recv() => match frame? {
                Some(text) => match parse_insert(&text) {
                    Some(event) => push_event(inner, event).await,
                    None => debug!("ignoring realtime frame"),
                },
                None => return Err(RealtimeError::Channel("stream closed by peer".into())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use tokio::time::Instant;

    type SentLog = Arc<std::sync::Mutex<Vec<(usize, String)>>>;

    /// Hands out scripted connections in order; connect fails once they run out.
    struct ScriptedTransport {
        pending: std::sync::Mutex<VecDeque<mpsc::UnboundedReceiver<String>>>,
        opened: std::sync::atomic::AtomicUsize,
        sent: SentLog,
    }

    impl ScriptedTransport {
        fn new(connections: Vec<mpsc::UnboundedReceiver<String>>) -> Arc<Self> {
            Arc::new(Self {
                pending: std::sync::Mutex::new(connections.into()),
                opened: std::sync::atomic::AtomicUsize::new(0),
                sent: Arc::default(),
            })
        }
    }

    struct ScriptedConnection {
        index: usize,
        incoming: mpsc::UnboundedReceiver<String>,
        sent: SentLog,
    }

    #[async_trait]
    impl RealtimeTransport for ScriptedTransport {
        async fn connect(&self) -> Result<Box<dyn RealtimeConnection>, RealtimeError> {
            let next = self.pending.lock().unwrap().pop_front();
            match next {
                Some(incoming) => Ok(Box::new(ScriptedConnection {
                    index: self
                        .opened
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
                    incoming,
                    sent: self.sent.clone(),
                })),
                None => Err(RealtimeError::Connect("no more scripted connections".into())),
            }
        }
    }

    #[async_trait]
    impl RealtimeConnection for ScriptedConnection {
        async fn send(&mut self, text: String) -> Result<(), RealtimeError> {
            self.sent.lock().unwrap().push((self.index, text));
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>, RealtimeError> {
            Ok(self.incoming.recv().await)
        }
    }

    #[derive(Default)]
    struct Collecting {
        batches: std::sync::Mutex<Vec<(String, Vec<ChangeEvent>, Instant)>>,
    }

    #[async_trait]
    impl ChangeSubscriber for Collecting {
        async fn on_changes(&self, table: &str, events: Vec<ChangeEvent>) {
            self.batches
                .lock()
                .unwrap()
                .push((table.to_string(), events, Instant::now()));
        }
    }

    fn insert_frame(table: &str, brv: &str) -> String {
        json!({
            "event": "INSERT",
            "topic": table,
            "payload": {"record": {"brv_number": brv}}
        })
        .to_string()
    }

    #[test]
    fn parses_insert_frames_only() {
        let event = parse_insert(&insert_frame("orders", "AS1")).unwrap();
        assert_eq!(event.table, "orders");
        assert_eq!(event.record["brv_number"], "AS1");

        let reply = json!({"event": "phx_reply", "topic": "orders", "payload": {}}).to_string();
        assert!(parse_insert(&reply).is_none());
        assert!(parse_insert("not json").is_none());
    }

    #[test]
    fn join_message_targets_table_topic() {
        let join: JsonValue = serde_json::from_str(&join_message("loaded")).unwrap();
        assert_eq!(join["topic"], "loaded");
        assert_eq!(join["event"], "phx_join");
        assert_eq!(join["ref"], "1");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_inside_window_yields_one_callback() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport::new(vec![rx]);
        let notifier = ChangeNotifier::new(transport.clone(), NotifierConfig::default());
        let subscriber = Arc::new(Collecting::default());
        notifier.subscribe("orders", subscriber.clone()).await;

        let start = Instant::now();
        tx.send(insert_frame("orders", "AS1")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(insert_frame("orders", "AS2")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(subscriber.batches.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(4)).await;
        let batches = subscriber.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let (table, events, at) = &batches[0];
        assert_eq!(table, "orders");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].record["brv_number"], "AS1");
        assert_eq!(events[1].record["brv_number"], "AS2");
        assert_eq!(at.duration_since(start), Duration::from_secs(5));

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &[(0, join_message("orders"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_rejoined_after_reconnect() {
        let (first_tx, first_rx) = mpsc::unbounded_channel::<String>();
        let (second_tx, second_rx) = mpsc::unbounded_channel();
        drop(first_tx);
        let transport = ScriptedTransport::new(vec![first_rx, second_rx]);
        let notifier = ChangeNotifier::new(transport.clone(), NotifierConfig::default());
        let subscriber = Arc::new(Collecting::default());
        notifier.subscribe("orders", subscriber.clone()).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        {
            let sent = transport.sent.lock().unwrap();
            assert_eq!(
                sent.as_slice(),
                &[(0, join_message("orders")), (1, join_message("orders"))]
            );
        }

        second_tx.send(insert_frame("orders", "AS9")).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(subscriber.batches.lock().unwrap().len(), 1);
        notifier.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_pending_buffers() {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier =
            ChangeNotifier::new(ScriptedTransport::new(vec![rx]), NotifierConfig::default());
        let subscriber = Arc::new(Collecting::default());
        notifier.subscribe("loaded", subscriber.clone()).await;

        tx.send(insert_frame("loaded", "AS1")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        notifier.shutdown().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(subscriber.batches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tables_flush_independently() {
        let (_tx, rx) = mpsc::unbounded_channel::<String>();
        let notifier =
            ChangeNotifier::new(ScriptedTransport::new(vec![rx]), NotifierConfig::default());
        let subscriber = Arc::new(Collecting::default());
        notifier.subscribe("loaded", subscriber.clone()).await;
        notifier.subscribe("marked", subscriber.clone()).await;
        assert_eq!(notifier.subscribed_tables().await, vec!["loaded", "marked"]);

        notifier
            .push(ChangeEvent {
                table: "loaded".into(),
                record: json!({"brv_number": "AS1"}),
            })
            .await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        notifier
            .push(ChangeEvent {
                table: "marked".into(),
                record: json!({"brv_number": "AS2"}),
            })
            .await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(subscriber.batches.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let batches = subscriber.batches.lock().unwrap();
        let tables: Vec<_> = batches.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(tables, vec!["loaded", "marked"]);
    }

    #[tokio::test(start_paused = true)]
    async fn events_for_unsubscribed_tables_are_dropped() {
        let (_tx, rx) = mpsc::unbounded_channel::<String>();
        let notifier =
            ChangeNotifier::new(ScriptedTransport::new(vec![rx]), NotifierConfig::default());
        let subscriber = Arc::new(Collecting::default());
        notifier.subscribe("loaded", subscriber.clone()).await;

        notifier
            .push(ChangeEvent {
                table: "approved".into(),
                record: json!({"brv_number": "AS1"}),
            })
            .await;
        assert!(notifier.inner.buffers.lock().await.get("approved").is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(subscriber.batches.lock().unwrap().is_empty());
    }
}
