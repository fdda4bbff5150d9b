//! Server-sent event history and decoding.
//!
//! Every message a session pushes outside a POST reply is recorded in an
//! [`EventLog`] under a monotonically increasing id before it is handed to
//! the connected stream, if any. A reconnecting client presents the last id
//! it saw and gets everything retained after it.

use serde_json::Value;
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::RuntimeMetrics;

/// One recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub id: u64,
    pub data: String,
}

/// Events retained after a given id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    pub events: Vec<HistoryEvent>,
    /// Ids that fell out of the window and can no longer be replayed.
    pub missed: Option<RangeInclusive<u64>>,
}

/// Fixed-capacity ring of the most recent events, oldest evicted first.
#[derive(Debug)]
pub struct EventHistory {
    capacity: usize,
    events: VecDeque<HistoryEvent>,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, event: HistoryEvent) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Everything retained with an id greater than `last_id`.
    pub fn since(&self, last_id: u64) -> Replay {
        let events: Vec<HistoryEvent> = self
            .events
            .iter()
            .filter(|e| e.id > last_id)
            .cloned()
            .collect();
        let missed = events
            .first()
            .filter(|first| first.id > last_id + 1)
            .map(|first| (last_id + 1)..=(first.id - 1));
        Replay { events, missed }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A connected event stream: the replayed backlog, then live events.
pub struct Subscription {
    pub replay: Replay,
    pub receiver: mpsc::Receiver<HistoryEvent>,
}

/// The live stream's sender, and a token cancelled once it is superseded.
#[derive(Clone)]
struct Subscriber {
    tx: mpsc::Sender<HistoryEvent>,
    replaced: CancellationToken,
}

struct LogState {
    next_id: u64,
    history: EventHistory,
    subscriber: Option<Subscriber>,
    closed: bool,
}

impl LogState {
    fn detach(&mut self) {
        if let Some(old) = self.subscriber.take() {
            old.replaced.cancel();
        }
    }
}

/// Per-session outbound event log with at most one live subscriber.
pub struct EventLog {
    state: Mutex<LogState>,
    /// Serializes publishers so live delivery follows id order.
    send_lock: Mutex<()>,
    queue_capacity: usize,
    metrics: Arc<RuntimeMetrics>,
}

impl EventLog {
    pub fn new(history: usize, queue_capacity: usize, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            state: Mutex::new(LogState {
                next_id: 1,
                history: EventHistory::new(history),
                subscriber: None,
                closed: false,
            }),
            send_lock: Mutex::new(()),
            queue_capacity: queue_capacity.max(1),
            metrics,
        }
    }

    /// Record a message and deliver it to the live stream.
    ///
    /// Waits while the stream's queue is full. A wait is abandoned when the
    /// stream is replaced or the log closed; the event stays in history.
    pub async fn publish(&self, message: &Value) -> Result<u64> {
        let data = serde_json::to_string(message)?;
        let _ordered = self.send_lock.lock().await;

        let (event, subscriber) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::TransportClosed("event stream closed".to_string()));
            }
            let event = HistoryEvent {
                id: state.next_id,
                data,
            };
            state.next_id += 1;
            state.history.push(event.clone());
            (event, state.subscriber.clone())
        };

        let id = event.id;
        self.metrics.inc_sse_emitted();
        match subscriber {
            Some(Subscriber { tx, replaced }) => {
                tokio::select! {
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            debug!("Event stream disconnected, event {} kept for replay", id);
                        }
                    }
                    _ = replaced.cancelled() => {
                        debug!("Event stream replaced, event {} kept for replay", id);
                    }
                }
            }
            None => debug!("No event stream connected, event {} kept for replay", id),
        }
        Ok(id)
    }

    /// Attach a new stream, replacing any previous one.
    ///
    /// With `last_event_id` the retained events after it are replayed first.
    pub async fn subscribe(&self, last_event_id: Option<u64>) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::TransportClosed("event stream closed".to_string()));
        }

        let replay = match last_event_id {
            Some(last) => state.history.since(last),
            None => Replay::default(),
        };
        if let Some(missed) = &replay.missed {
            warn!(
                "Events {}..={} are no longer retained and cannot be replayed",
                missed.start(),
                missed.end()
            );
        }
        self.metrics.add_sse_replayed(replay.events.len() as u64);

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        state.detach();
        state.subscriber = Some(Subscriber {
            tx,
            replaced: CancellationToken::new(),
        });
        Ok(Subscription {
            replay,
            receiver: rx,
        })
    }

    /// Whether a live stream is attached.
    pub async fn has_subscriber(&self) -> bool {
        self.state
            .lock()
            .await
            .subscriber
            .as_ref()
            .is_some_and(|sub| !sub.tx.is_closed())
    }

    /// Id of the most recently published event, 0 if none.
    pub async fn last_event_id(&self) -> u64 {
        self.state.lock().await.next_id - 1
    }

    /// End the live stream and refuse further events.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.detach();
    }
}

// ===== Decoding =====

/// A decoded event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Feed chunks as they arrive; complete events come out, a trailing partial
/// event waits for the next chunk.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    out.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                _ => {}
            }
        }
        out
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let id = self.id.take();
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseEvent { id, event, data })
    }
}

/// Decode a complete SSE body into its data payloads.
pub fn decode_sse_events(body: &str) -> Vec<String> {
    let mut decoder = SseDecoder::new();
    let mut events: Vec<String> = decoder.push(body).into_iter().map(|e| e.data).collect();
    if let Some(last) = decoder.push("\n\n").into_iter().next() {
        events.push(last.data);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(history: usize) -> EventLog {
        EventLog::new(history, 4, RuntimeMetrics::new())
    }

    #[test]
    fn test_history_window() {
        let mut history = EventHistory::new(3);
        for id in 1..=5 {
            history.push(HistoryEvent {
                id,
                data: id.to_string(),
            });
        }
        assert_eq!(history.len(), 3);

        let replay = history.since(3);
        assert_eq!(
            replay.events.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert!(replay.missed.is_none());

        let replay = history.since(1);
        assert_eq!(replay.events.len(), 3);
        assert_eq!(replay.missed, Some(2..=2));

        assert!(history.since(5).events.is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_retained() {
        let log = log(10);
        for n in 0..3 {
            log.publish(&json!({"n": n})).await.unwrap();
        }
        assert_eq!(log.last_event_id().await, 3);

        let sub = log.subscribe(Some(1)).await.unwrap();
        let ids: Vec<u64> = sub.replay.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_subscribe_without_last_id_gets_live_only() {
        let log = log(10);
        log.publish(&json!({"n": 0})).await.unwrap();

        let mut sub = log.subscribe(None).await.unwrap();
        assert!(sub.replay.events.is_empty());

        log.publish(&json!({"n": 1})).await.unwrap();
        let live = sub.receiver.recv().await.unwrap();
        assert_eq!(live.id, 2);
        assert_eq!(live.data, r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_stream() {
        let log = log(10);
        let mut first = log.subscribe(None).await.unwrap();
        let _second = log.subscribe(None).await.unwrap();
        assert!(first.receiver.recv().await.is_none());
        assert!(log.has_subscriber().await);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_publisher() {
        let log = Arc::new(log(10));
        let mut sub = log.subscribe(None).await.unwrap();
        for n in 0..4 {
            log.publish(&json!(n)).await.unwrap();
        }

        let blocked = tokio::spawn({
            let log = log.clone();
            async move { log.publish(&json!(4)).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        sub.receiver.recv().await.unwrap();
        assert_eq!(blocked.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_resubscribe_releases_stalled_publisher() {
        let log = Arc::new(log(10));
        // The first stream stays open but is never read.
        let _stalled = log.subscribe(None).await.unwrap();
        for n in 0..4 {
            log.publish(&json!(n)).await.unwrap();
        }
        let blocked = tokio::spawn({
            let log = log.clone();
            async move { log.publish(&json!(4)).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let mut fresh = log.subscribe(Some(4)).await.unwrap();
        let ids: Vec<u64> = fresh.replay.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5]);
        assert_eq!(blocked.await.unwrap().unwrap(), 5);

        let publisher = tokio::spawn({
            let log = log.clone();
            async move { log.publish(&json!(5)).await }
        });
        let live = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            fresh.receiver.recv(),
        )
        .await
        .expect("live event not delivered to the new stream")
        .unwrap();
        assert_eq!(live.id, 6);
        assert_eq!(publisher.await.unwrap().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_closed_log_refuses() {
        let log = log(10);
        let mut sub = log.subscribe(None).await.unwrap();
        log.close().await;
        assert!(sub.receiver.recv().await.is_none());
        assert!(log.publish(&json!({})).await.is_err());
        assert!(log.subscribe(Some(0)).await.is_err());
    }

    #[test]
    fn test_decoder_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("id: 7\nda").is_empty());
        let events = decoder.push("ta: {\"a\":1}\n\n: keep-alive\n\nevent: message\ndata: x\r\n\r\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    id: Some("7".to_string()),
                    event: None,
                    data: "{\"a\":1}".to_string(),
                },
                SseEvent {
                    id: None,
                    event: Some("message".to_string()),
                    data: "x".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_decode_multiline_data() {
        assert_eq!(decode_sse_events("data: a\ndata: b\n\n"), vec!["a\nb"]);
        assert_eq!(decode_sse_events("data: tail"), vec!["tail"]);
    }
}
