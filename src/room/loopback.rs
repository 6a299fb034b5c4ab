//! In-process room used for automatic-candidate rehearsal and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::audio::AudioFrame;

use super::{RoomConnection, RoomError, RoomEvent, RoomProvider, RoomSession};

const FRAME_HISTORY: usize = 4_096;
const EVENT_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LoopbackRoom {
    events_tx: mpsc::Sender<RoomEvent>,
    frames: Mutex<VecDeque<AudioFrame>>,
    frames_published: AtomicU64,
    data: Mutex<Vec<(String, Bytes)>>,
    data_tx: broadcast::Sender<(String, Bytes)>,
    disconnected: AtomicBool,
}

impl LoopbackRoom {
    /// Room whose inbound event stream is discarded.
    pub fn new() -> Self {
        let (room, _events) = Self::pair();
        room
    }

    pub fn pair() -> (Self, mpsc::Receiver<RoomEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (data_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let room = Self {
            events_tx,
            frames: Mutex::new(VecDeque::new()),
            frames_published: AtomicU64::new(0),
            data: Mutex::new(Vec::new()),
            data_tx,
            disconnected: AtomicBool::new(false),
        };
        (room, events_rx)
    }

    /// Delivers an inbound event as if it came from the remote participant.
    pub async fn inject(&self, event: RoomEvent) -> Result<(), RoomError> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| RoomError::Closed)
    }

    pub fn try_inject(&self, event: RoomEvent) -> Result<(), RoomError> {
        self.events_tx
            .try_send(event)
            .map_err(|err| RoomError::Rejected(err.to_string()))
    }

    /// Most recent outbound frames, oldest first.
    pub fn published_frames(&self) -> Vec<AudioFrame> {
        lock(&self.frames).iter().cloned().collect()
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::SeqCst)
    }

    pub fn sent_data(&self) -> Vec<(String, Bytes)> {
        lock(&self.data).clone()
    }

    pub fn subscribe_data(&self) -> broadcast::Receiver<(String, Bytes)> {
        self.data_tx.subscribe()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackRoom {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomConnection for LoopbackRoom {
    fn push_frame(&self, frame: AudioFrame) -> Result<(), RoomError> {
        if self.is_disconnected() {
            return Err(RoomError::Closed);
        }
        let mut frames = lock(&self.frames);
        if frames.len() == FRAME_HISTORY {
            frames.pop_front();
        }
        frames.push_back(frame);
        self.frames_published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_data(&self, topic: &str, payload: Bytes) -> Result<(), RoomError> {
        if self.is_disconnected() {
            return Err(RoomError::Closed);
        }
        lock(&self.data).push((topic.to_string(), payload.clone()));
        let _ = self.data_tx.send((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RoomError> {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            info!(target: "room_dispatch", "loopback room disconnected");
        }
        Ok(())
    }
}

/// Hands out a fresh [`LoopbackRoom`] per join and keeps it addressable by
/// room id.
#[derive(Default)]
pub struct LoopbackProvider {
    rooms: Mutex<HashMap<String, Arc<LoopbackRoom>>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<LoopbackRoom>> {
        lock(&self.rooms).get(room_id).cloned()
    }
}

#[async_trait]
impl RoomProvider for LoopbackProvider {
    async fn join(&self, room_id: &str, _token: &str) -> Result<RoomSession> {
        let (room, events) = LoopbackRoom::pair();
        let room = Arc::new(room);
        lock(&self.rooms).insert(room_id.to_string(), Arc::clone(&room));
        Ok(RoomSession {
            connection: room,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_closes_outbound_side() {
        let room = LoopbackRoom::new();
        room.push_frame(AudioFrame::new(vec![0_i16; 4], 16_000, 1))
            .expect("open room");
        room.disconnect().await.expect("disconnect");
        room.disconnect().await.expect("idempotent");

        assert!(matches!(
            room.push_frame(AudioFrame::new(vec![0_i16; 4], 16_000, 1)),
            Err(RoomError::Closed)
        ));
        assert!(room.send_data("control", Bytes::new()).is_err());
        assert_eq!(room.frames_published(), 1);
    }

    #[tokio::test]
    async fn provider_keeps_joined_rooms_addressable() {
        let provider = LoopbackProvider::new();
        let mut session = provider.join("room-1", "token").await.expect("join");
        let room = provider.room("room-1").expect("room registered");

        room.inject(RoomEvent::ParticipantDisconnected {
            identity: "candidate".into(),
        })
        .await
        .expect("inject");
        let event = session.events.recv().await.expect("event");
        assert_eq!(event.name(), RoomEvent::PARTICIPANT_DISCONNECTED);

        session
            .connection
            .send_data("control", Bytes::from_static(b"{}"))
            .expect("send");
        assert_eq!(room.sent_data().len(), 1);
    }
}
