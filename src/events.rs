//! Progress and status events for observers.
//!
//! Two independent streams, each a `tokio::sync::broadcast` channel with its own
//! monotonically increasing event ids:
//!
//! - **event**: controller status (`connect_b1500_idn`, `measurement_finish`, ...)
//! - **data**: one [`ProgressUpdate`] per completed measurement step
//!
//! Publishing never blocks and has no effect when nobody listens. A subscriber
//! created with [`EventStream::subscribe`] sees future events only. A reconnecting
//! subscriber that remembers its last event id uses [`EventStream::subscribe_since`]
//! to first receive the retained history after that id, then live events, with no
//! gap or duplicate between the two.

use crate::config::EventConfig;
use crate::data::ResultDataset;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{trace, warn};

/// Terminal outcome reported by `measurement_finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishStatus {
    /// Every target and program completed
    Success,
    /// An instrument or stage error aborted the run
    Error,
    /// The user cancelled the run
    Cancelled,
}

/// Status events published on the event stream, serialized as `{msg, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "data", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// Analyzer connected
    ConnectB1500Idn {
        /// Identification string
        idn: String,
    },
    /// Analyzer disconnected
    DisconnectB1500 {},
    /// Probe station connected
    ConnectCascadeIdn {
        /// Identification string
        idn: String,
    },
    /// Probe station disconnected
    DisconnectCascade {},
    /// A user's global settings, after load or change
    SetUserSettings {
        /// Settings object
        settings: serde_json::Value,
    },
    /// A user's stored program config
    MeasurementProgramConfig {
        /// Program tag
        name: String,
        /// Slot in the user's program chain
        index: usize,
        /// Config object
        config: serde_json::Value,
    },
    /// A user's stored sweep config
    MeasurementSweepConfig {
        /// Sweep tag
        name: String,
        /// Config object
        config: serde_json::Value,
    },
    /// A run request was rejected or a run failed
    MeasurementError {
        /// Human-readable reason
        error: String,
    },
    /// A run reached a terminal state
    MeasurementFinish {
        /// Outcome
        status: FinishStatus,
    },
}

impl ControllerEvent {
    /// Message tag, e.g. `measurement_finish`.
    pub fn msg(&self) -> &'static str {
        match self {
            ControllerEvent::ConnectB1500Idn { .. } => "connect_b1500_idn",
            ControllerEvent::DisconnectB1500 {} => "disconnect_b1500",
            ControllerEvent::ConnectCascadeIdn { .. } => "connect_cascade_idn",
            ControllerEvent::DisconnectCascade {} => "disconnect_cascade",
            ControllerEvent::SetUserSettings { .. } => "set_user_settings",
            ControllerEvent::MeasurementProgramConfig { .. } => "measurement_program_config",
            ControllerEvent::MeasurementSweepConfig { .. } => "measurement_sweep_config",
            ControllerEvent::MeasurementError { .. } => "measurement_error",
            ControllerEvent::MeasurementFinish { .. } => "measurement_finish",
        }
    }

    fn into_parts(self) -> (String, serde_json::Value) {
        let msg = self.msg().to_string();
        let data = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("data").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        };
        (msg, data)
    }
}

/// Metadata of one progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetadata {
    /// Program tag
    pub program: String,
    /// Sweep metadata of the current target
    pub config: serde_json::Value,
    /// Index of the step just completed
    pub step: usize,
    /// Steps planned for this program at this target
    pub step_total: usize,
}

/// Per-step payload of the data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Where in the run this update belongs
    pub metadata: ProgressMetadata,
    /// Dataset of every step completed so far for this program and target
    pub data: ResultDataset,
}

/// Message tag of data stream records.
pub const MEASUREMENT_DATA_MSG: &str = "measurement_data";

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic id within the stream, starting at 1
    pub id: u64,
    /// Message tag
    pub msg: String,
    /// Payload
    pub data: serde_json::Value,
    /// Publish time
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// `text/event-stream` frame: `id:` line plus a `data:` line with `{msg, data}`.
    pub fn to_sse(&self) -> String {
        let body = serde_json::json!({ "msg": self.msg, "data": self.data });
        format!("id: {}\ndata: {}\n\n", self.id, body)
    }
}

struct StreamState {
    next_id: u64,
    history: VecDeque<EventRecord>,
}

/// One broadcast stream with bounded history.
#[derive(Clone)]
pub struct EventStream {
    name: &'static str,
    sender: broadcast::Sender<EventRecord>,
    history_size: usize,
    state: Arc<Mutex<StreamState>>,
}

impl EventStream {
    /// Stream keeping the last `history_size` events.
    pub fn new(name: &'static str, history_size: usize, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name,
            sender,
            history_size,
            state: Arc::new(Mutex::new(StreamState {
                next_id: 1,
                history: VecDeque::with_capacity(history_size),
            })),
        }
    }

    /// Publish an event and return its id.
    pub fn publish(&self, msg: impl Into<String>, data: serde_json::Value) -> u64 {
        // History and send happen under one lock so `subscribe_since` sees a
        // consistent cut between replayed and live events.
        let mut state = self.state.lock();
        let record = EventRecord {
            id: state.next_id,
            msg: msg.into(),
            data,
            timestamp: Utc::now(),
        };
        state.next_id += 1;

        if self.history_size > 0 {
            if state.history.len() == self.history_size {
                state.history.pop_front();
            }
            state.history.push_back(record.clone());
        }

        let id = record.id;
        let receivers = self.sender.send(record).unwrap_or(0);
        trace!(stream = self.name, id, receivers, "event published");
        id
    }

    /// Live events only.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Retained events with id greater than `last_id`, then a live receiver.
    pub fn subscribe_since(&self, last_id: u64) -> (Vec<EventRecord>, broadcast::Receiver<EventRecord>) {
        let state = self.state.lock();
        let receiver = self.sender.subscribe();
        let replay = state
            .history
            .iter()
            .filter(|e| e.id > last_id)
            .cloned()
            .collect();
        (replay, receiver)
    }

    /// [`subscribe_since`](Self::subscribe_since) as a single stream.
    ///
    /// Events dropped because the subscriber fell behind are logged and skipped.
    pub fn stream_since(&self, last_id: u64) -> impl Stream<Item = EventRecord> + Send + 'static {
        let (replay, receiver) = self.subscribe_since(last_id);
        let name = self.name;
        let live = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(record) => Some(record),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(stream = name, skipped, "subscriber lagged, events dropped");
                None
            }
        });
        tokio_stream::iter(replay).chain(live)
    }

    /// Snapshot of the retained history, oldest first.
    pub fn history(&self) -> Vec<EventRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Current live subscriber count.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Event and data streams of the controller.
#[derive(Clone)]
pub struct ProgressEmitter {
    events: EventStream,
    data: EventStream,
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::from_config(&EventConfig {
            history_size: 32,
            channel_capacity: 256,
        })
    }
}

impl ProgressEmitter {
    /// Streams sized from configuration.
    pub fn from_config(config: &EventConfig) -> Self {
        Self {
            events: EventStream::new("event", config.history_size, config.channel_capacity),
            data: EventStream::new("data", config.history_size, config.channel_capacity),
        }
    }

    /// Publish a raw `{msg, data}` status event.
    pub fn emit(&self, msg: &str, data: serde_json::Value) -> u64 {
        self.events.publish(msg, data)
    }

    /// Publish a typed status event.
    pub fn emit_event(&self, event: ControllerEvent) -> u64 {
        let (msg, data) = event.into_parts();
        self.events.publish(msg, data)
    }

    /// Publish a step's progress on the data stream.
    pub fn emit_progress(&self, update: &ProgressUpdate) -> u64 {
        let data = serde_json::to_value(update).unwrap_or(serde_json::Value::Null);
        self.data.publish(MEASUREMENT_DATA_MSG, data)
    }

    /// Status event stream.
    pub fn events(&self) -> &EventStream {
        &self.events
    }

    /// Measurement data stream.
    pub fn data(&self) -> &EventStream {
        &self.data
    }

    /// Live status events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// Live measurement data.
    pub fn subscribe_data(&self) -> broadcast::Receiver<EventRecord> {
        self.data.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_as_msg_data() {
        let event = ControllerEvent::MeasurementFinish {
            status: FinishStatus::Cancelled,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"msg": "measurement_finish", "data": {"status": "cancelled"}})
        );
        assert_eq!(event.msg(), "measurement_finish");

        let (msg, data) = ControllerEvent::DisconnectB1500 {}.into_parts();
        assert_eq!(msg, "disconnect_b1500");
        assert_eq!(data, json!({}));
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let emitter = ProgressEmitter::default();
        let id = emitter.emit("hello", json!({}));
        assert_eq!(id, 1);
        assert_eq!(emitter.events().history().len(), 1);
    }

    #[tokio::test]
    async fn test_live_subscriber_sees_future_events_only() {
        let emitter = ProgressEmitter::default();
        emitter.emit("before", json!({}));

        let mut rx = emitter.subscribe();
        emitter.emit_event(ControllerEvent::MeasurementError {
            error: "boom".into(),
        });

        let record = rx.recv().await.unwrap();
        assert_eq!(record.msg, "measurement_error");
        assert_eq!(record.data, json!({"error": "boom"}));
        assert_eq!(record.id, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_since_replays_then_streams() {
        let emitter = ProgressEmitter::default();
        for i in 0..5 {
            emitter.emit("tick", json!({ "i": i }));
        }

        let (replay, mut rx) = emitter.events().subscribe_since(3);
        let ids: Vec<u64> = replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 5]);

        emitter.emit("tick", json!({ "i": 5 }));
        assert_eq!(rx.recv().await.unwrap().id, 6);
    }

    #[tokio::test]
    async fn test_stream_since_has_no_gap() {
        let stream = EventStream::new("data", 8, 16);
        for _ in 0..3 {
            stream.publish("measurement_data", json!({}));
        }
        let events = stream.stream_since(1);
        stream.publish("measurement_data", json!({}));

        let ids: Vec<u64> = events.take(3).map(|e| e.id).collect().await;
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_history_is_bounded() {
        let stream = EventStream::new("event", 3, 16);
        for _ in 0..10 {
            stream.publish("tick", json!(null));
        }
        let ids: Vec<u64> = stream.history().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
    }

    #[test]
    fn test_sse_frame() {
        let stream = EventStream::new("event", 3, 16);
        stream.publish("disconnect_cascade", json!({}));
        let frame = stream.history()[0].to_sse();
        assert_eq!(
            frame,
            "id: 1\ndata: {\"data\":{},\"msg\":\"disconnect_cascade\"}\n\n"
        );
    }
}
