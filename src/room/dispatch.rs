use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::orchestrator::SessionSignal;

use super::RoomEvent;

const TARGET: &str = "room_dispatch";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterExit {
    Stopped,
    Cancelled,
    StreamClosed,
}

type EventHandler = Box<dyn Fn(RoomEvent) -> Dispatch + Send + Sync>;
type TopicHandler = Box<dyn Fn(Bytes) -> Dispatch + Send + Sync>;

/// Event-name and data-topic dispatch table for one session's room.
#[derive(Default)]
pub struct RoomEventRouter {
    handlers: HashMap<&'static str, EventHandler>,
    topics: HashMap<String, TopicHandler>,
}

impl RoomEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, event: &'static str, handler: F) -> Self
    where
        F: Fn(RoomEvent) -> Dispatch + Send + Sync + 'static,
    {
        self.handlers.insert(event, Box::new(handler));
        self
    }

    /// Data messages on `topic` go here before the generic
    /// `data_message` handler.
    pub fn on_topic<F>(mut self, topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes) -> Dispatch + Send + Sync + 'static,
    {
        self.topics.insert(topic.into(), Box::new(handler));
        self
    }

    pub fn dispatch(&self, event: RoomEvent) -> Dispatch {
        if let RoomEvent::DataMessage { topic, payload } = &event {
            if let Some(handler) = self.topics.get(topic.as_str()) {
                return handler(payload.clone());
            }
        }

        let name = event.name();
        match self.handlers.get(name) {
            Some(handler) => handler(event),
            None => {
                debug!(target: TARGET, event = name, "no handler registered, ignoring");
                Dispatch::Continue
            }
        }
    }

    pub async fn run(
        self,
        mut events: mpsc::Receiver<RoomEvent>,
        signal: Arc<SessionSignal>,
    ) -> RouterExit {
        let exit = loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = signal.cancelled() => break RouterExit::Cancelled,
            };
            let Some(event) = event else {
                break RouterExit::StreamClosed;
            };
            if self.dispatch(event) == Dispatch::Stop {
                break RouterExit::Stopped;
            }
        };
        info!(target: TARGET, ?exit, "room event router finished");
        exit
    }

    pub fn spawn(
        self,
        events: mpsc::Receiver<RoomEvent>,
        signal: Arc<SessionSignal>,
    ) -> JoinHandle<RouterExit> {
        tokio::spawn(self.run(events, signal))
    }
}
