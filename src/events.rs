// src/events.rs

//! Event stream between the installer worker and its frontend
//!
//! Events travel through a bounded FIFO queue. Informational and progress
//! events are pushed without blocking and are dropped when the queue is full,
//! so a slow frontend can never stall a running transaction.
//!
//! Error events are the exception: they are fatal to the installer run. The
//! emitter queues them with a blocking put, then waits until the consumer has
//! drained every queued event, and only then hands back [`Error::Fatal`]. The
//! caller propagates that to its outer boundary, which ends the run. This
//! guarantees the frontend has seen everything that led up to the failure.
//!
//! # Example
//!
//! ```ignore
//! use pactrans::events::{EventEmitter, event_queue};
//!
//! let (sender, receiver) = event_queue(256);
//! let mut emitter = EventEmitter::new(sender);
//!
//! std::thread::spawn(move || {
//!     for event in receiver.iter() {
//!         println!("{}: {:?}", event.kind(), event);
//!     }
//! });
//!
//! emitter.info("Checking dependencies...");
//! emitter.percent(0.25);
//! ```

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Kind tag of an event, as seen by the frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Info,
    Percent,
    Error,
}

/// One event for the frontend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Event {
    /// Status text
    Info(String),
    /// Progress fraction in `[0, 1]`
    Percent(f64),
    /// Fatal error text; the producer ends after the queue drains
    Error(String),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Info(_) => EventKind::Info,
            Self::Percent(_) => EventKind::Percent,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Count of events queued but not yet taken by the consumer
#[derive(Debug, Default)]
struct DrainState {
    unfinished: usize,
    consumer_gone: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<DrainState>,
    drained: Condvar,
}

impl Shared {
    fn task_done(&self) {
        let mut state = self.state.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.drained.notify_all();
        }
    }
}

/// Create a bounded event queue
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let shared = Arc::new(Shared::default());
    (
        EventSender {
            tx,
            shared: Arc::clone(&shared),
        },
        EventReceiver { rx, shared },
    )
}

/// The queue was full (or the consumer is gone); the event was dropped
#[derive(Debug, Clone, PartialEq)]
pub struct QueueFull(pub Event);

/// Producer end of the event queue
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Event>,
    shared: Arc<Shared>,
}

impl EventSender {
    /// Queue an event without blocking
    pub fn try_put(&self, event: Event) -> std::result::Result<(), QueueFull> {
        self.shared.state.lock().unfinished += 1;
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                self.shared.task_done();
                Err(QueueFull(event))
            }
        }
    }

    /// Queue an event, waiting for room if the queue is full
    ///
    /// Returns false if the consumer has gone away.
    pub fn put(&self, event: Event) -> bool {
        self.shared.state.lock().unfinished += 1;
        if self.tx.send(event).is_err() {
            self.shared.task_done();
            return false;
        }
        true
    }

    /// Block until the consumer has taken every queued event
    ///
    /// Also returns once the consumer end is dropped, since nothing will
    /// drain the queue after that.
    pub fn join(&self) {
        let mut state = self.shared.state.lock();
        while state.unfinished > 0 && !state.consumer_gone {
            self.shared.drained.wait(&mut state);
        }
    }

    /// Events queued and not yet taken
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unfinished
    }
}

/// Consumer end of the event queue
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<Event>,
    shared: Arc<Shared>,
}

impl EventReceiver {
    /// Wait for the next event; `None` once every producer is gone
    pub fn recv(&self) -> Option<Event> {
        let event = self.rx.recv().ok()?;
        self.shared.task_done();
        Some(event)
    }

    pub fn try_recv(&self) -> Option<Event> {
        let event = self.rx.try_recv().ok()?;
        self.shared.task_done();
        Some(event)
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.shared.task_done();
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Blocking iterator that ends when every producer is gone
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.consumer_gone = true;
        self.shared.drained.notify_all();
    }
}

/// Deduplicating producer for frontend events
///
/// An event is suppressed when the last event emitted with the same kind
/// carried the same payload. The cache lives as long as the emitter.
#[derive(Debug, Default)]
pub struct EventEmitter {
    sender: Option<EventSender>,
    last_event: HashMap<EventKind, Event>,
}

impl EventEmitter {
    pub fn new(sender: EventSender) -> Self {
        Self {
            sender: Some(sender),
            last_event: HashMap::new(),
        }
    }

    /// Emitter with no frontend attached; events are discarded
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.sender.is_some()
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.push(Event::Info(text.into()));
    }

    pub fn percent(&mut self, fraction: f64) {
        self.push(Event::Percent(fraction.clamp(0.0, 1.0)));
    }

    /// Emit any event
    ///
    /// Info and percent events never fail. An error event goes through
    /// [`EventEmitter::error`] and its [`Error::Fatal`] comes back here, so
    /// the caller stops with `?` like any other fatal path.
    #[track_caller]
    pub fn emit(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Error(text) => Err(self.error(text)),
            event => {
                self.push(event);
                Ok(())
            }
        }
    }

    fn push(&mut self, event: Event) {
        if !self.remember(&event) {
            return;
        }

        if let Some(sender) = &self.sender
            && let Err(QueueFull(dropped)) = sender.try_put(event)
        {
            debug!("Event queue full, dropping {} event", dropped.kind());
        }
    }

    /// Deliver a fatal error and wait for the frontend to drain the queue
    ///
    /// The returned error must be propagated to the outer boundary that
    /// ends the run. The caller's source location is appended to the text.
    #[track_caller]
    pub fn error(&mut self, text: impl Into<String>) -> Error {
        let caller = Location::caller();
        let text = format!("{} in {}:{}", text.into(), caller.file(), caller.line());
        error!("{}", text);

        let event = Event::Error(text.clone());
        if self.remember(&event)
            && let Some(sender) = &self.sender
            && !sender.put(event)
        {
            debug!("Event consumer is gone, fatal error not delivered");
        }

        if let Some(sender) = &self.sender {
            sender.join();
        }

        Error::Fatal(text)
    }

    /// Record the event in the dedup cache; false if it repeats the last one
    fn remember(&mut self, event: &Event) -> bool {
        let kind = event.kind();
        if self.last_event.get(&kind) == Some(event) {
            return false;
        }
        self.last_event.insert(kind, event.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::Info.to_string(), "info");
        assert_eq!(EventKind::Percent.as_ref(), "percent");
        assert_eq!(EventKind::from_str("error").unwrap(), EventKind::Error);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&Event::Info("Removing...".to_string())).unwrap();
        assert_eq!(json, r#"{"kind":"info","value":"Removing..."}"#);

        let json = serde_json::to_string(&Event::Percent(0.5)).unwrap();
        assert_eq!(json, r#"{"kind":"percent","value":0.5}"#);
    }

    #[test]
    fn test_identical_info_is_delivered_once() {
        let (sender, receiver) = event_queue(16);
        let mut emitter = EventEmitter::new(sender);

        emitter.info("Checking dependencies...");
        emitter.info("Checking dependencies...");

        assert_eq!(
            receiver.drain(),
            vec![Event::Info("Checking dependencies...".to_string())]
        );
    }

    #[test]
    fn test_dedup_is_per_kind_and_last_value_only() {
        let (sender, receiver) = event_queue(16);
        let mut emitter = EventEmitter::new(sender);

        emitter.info("a");
        emitter.percent(0.5);
        emitter.info("b");
        emitter.info("a");
        emitter.percent(0.5);

        assert_eq!(
            receiver.drain(),
            vec![
                Event::Info("a".to_string()),
                Event::Percent(0.5),
                Event::Info("b".to_string()),
                Event::Info("a".to_string()),
            ]
        );
    }

    #[test]
    fn test_full_queue_drops_silently() {
        let (sender, receiver) = event_queue(2);
        let mut emitter = EventEmitter::new(sender.clone());

        emitter.info("one");
        emitter.info("two");
        emitter.info("three");

        assert_eq!(sender.pending(), 2);
        assert_eq!(
            receiver.drain(),
            vec![Event::Info("one".to_string()), Event::Info("two".to_string())]
        );
        assert_eq!(sender.pending(), 0);
    }

    #[test]
    fn test_detached_emitter_still_reports_fatal() {
        let mut emitter = EventEmitter::detached();
        emitter.info("ignored");

        let err = emitter.error("disk full");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("disk full in "));
        assert!(err.to_string().contains("events.rs"));
    }

    #[test]
    fn test_fatal_waits_for_consumer_to_drain() {
        let (sender, receiver) = event_queue(16);
        let delay = Duration::from_millis(150);
        let started = Instant::now();

        let producer = thread::spawn(move || {
            let mut emitter = EventEmitter::new(sender);
            emitter.info("Downloading bash...");
            emitter.percent(0.5);
            let err = emitter.error("mirror unreachable");
            (err, started.elapsed())
        });

        let consumer = thread::spawn(move || {
            thread::sleep(delay);
            let mut seen = Vec::new();
            while let Some(event) = receiver.recv() {
                let last = matches!(event, Event::Error(_));
                seen.push(event);
                if last {
                    break;
                }
            }
            seen
        });

        let (err, elapsed) = producer.join().unwrap();
        let seen = consumer.join().unwrap();

        assert!(err.is_fatal());
        assert!(elapsed >= delay);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], Event::Info("Downloading bash...".to_string()));
        assert_eq!(seen[1], Event::Percent(0.5));
        assert!(matches!(&seen[2], Event::Error(text) if text.starts_with("mirror unreachable")));
    }

    #[test]
    fn test_fatal_does_not_hang_without_consumer() {
        let (sender, receiver) = event_queue(4);
        let mut emitter = EventEmitter::new(sender);
        emitter.info("queued");
        drop(receiver);

        assert!(emitter.error("gone").is_fatal());
    }

    #[test]
    fn test_emit_routes_error_events_through_fatal_path() {
        let (sender, receiver) = event_queue(4);
        let mut emitter = EventEmitter::new(sender);

        let consumer = thread::spawn(move || receiver.recv());
        let err = emitter.emit(Event::Error("bad signature".to_string())).unwrap_err();

        assert!(matches!(&err, Error::Fatal(text) if text.starts_with("bad signature in ")));
        assert!(err.to_string().contains("events.rs"));
        let received = consumer.join().unwrap();
        assert!(matches!(received, Some(Event::Error(text)) if text.starts_with("bad signature")));
    }

    #[test]
    fn test_producer_stops_after_emitted_error() {
        fn download(emitter: &mut EventEmitter) -> Result<()> {
            emitter.emit(Event::Info("Downloading bash...".to_string()))?;
            emitter.emit(Event::Error("disk full".to_string()))?;
            emitter.info("still running");
            Ok(())
        }

        let (sender, receiver) = event_queue(8);
        let mut emitter = EventEmitter::new(sender);
        let consumer = thread::spawn(move || receiver.iter().collect::<Vec<_>>());

        let err = download(&mut emitter).unwrap_err();
        assert!(err.is_fatal());
        drop(emitter);

        let seen = consumer.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Event::Info("Downloading bash...".to_string()));
        assert!(matches!(&seen[1], Event::Error(text) if text.starts_with("disk full")));
    }

    #[test]
    fn test_emit_passes_progress_events_through() {
        let (sender, receiver) = event_queue(4);
        let mut emitter = EventEmitter::new(sender);

        assert!(emitter.emit(Event::Percent(0.25)).is_ok());
        assert!(emitter.emit(Event::Percent(0.25)).is_ok());

        assert_eq!(receiver.drain(), vec![Event::Percent(0.25)]);
    }
}
